//! `concierge doctor`: Diagnose configuration and connectivity.

use std::path::Path;

use concierge_config::{AppConfig, resolve_model};
use concierge_core::provider::Provider;
use concierge_providers::OpenAiCompatProvider;

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Concierge Doctor");
    println!("===================\n");

    let mut issues = 0;
    let path = super::config_path(config_path);

    if path.exists() {
        println!("  ✅ Config file found: {}", path.display());
    } else {
        println!("  ⚠️  No config file at {}: defaults in use (run `concierge init`)", path.display());
    }

    let config = match AppConfig::load_with_env(&path) {
        Ok(config) => {
            println!("  ✅ Configuration valid");
            config
        }
        Err(e) => {
            println!("  ❌ Configuration invalid: {e}");
            println!("\n  ⚠️  1 issue found. Fix the config and re-run.");
            return Ok(());
        }
    };

    let model = config.model();
    if resolve_model(&config.default_model) == config.default_model.trim() {
        println!("  ✅ Model: {model}");
    } else {
        println!("  ⚠️  Model '{}' is unusable, falling back to {model}", config.default_model);
        issues += 1;
    }

    println!(
        "  ✅ Business: {} ({}), {} service area(s)",
        config.business.company.name,
        config.business.company.currency,
        config.business.company.service_areas.len()
    );

    match config.business.docs_dir.as_deref() {
        Some(dir) if dir.is_dir() => println!("  ✅ FAQ docs directory: {}", dir.display()),
        Some(dir) => {
            println!("  ⚠️  FAQ docs directory missing: {}", dir.display());
            issues += 1;
        }
        None => {}
    }

    let inbox_dir = config
        .business
        .handoff_inbox
        .parent()
        .filter(|d| !d.as_os_str().is_empty());
    match inbox_dir {
        Some(dir) if !dir.exists() => {
            println!("  ℹ️  Hand-off inbox directory will be created: {}", dir.display())
        }
        _ => println!("  ✅ Hand-off inbox: {}", config.business.handoff_inbox.display()),
    }

    if config.bot_token().is_some() {
        println!("  ✅ Gateway bot token configured");
    } else {
        println!("  ❌ No bot token: `concierge serve` will refuse to start (set CONCIERGE_BOT_TOKEN)");
        issues += 1;
    }

    if config.has_api_key() {
        println!("  ✅ API key configured");
        let provider = OpenAiCompatProvider::from_config(&config);
        match provider.health_check().await {
            Ok(true) => println!("  ✅ Provider reachable at {}", config.api_url),
            Ok(false) => {
                println!("  ⚠️  Provider at {} answered but reported unhealthy", config.api_url);
                issues += 1;
            }
            Err(e) => {
                println!("  ❌ Provider check failed: {e}");
                issues += 1;
            }
        }
    } else {
        println!("  ⚠️  No API key configured: set OPENAI_API_KEY or api_key in config.toml");
        issues += 1;
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
