//! `concierge init`: Write a default configuration file.

use std::path::Path;

use concierge_config::AppConfig;

pub async fn run(config_path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = super::config_path(config_path);

    println!("🧹 Concierge Setup");
    println!("====================\n");

    let missing_dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty() && !d.exists());
    if let Some(dir) = missing_dir {
        std::fs::create_dir_all(dir)?;
        println!("✅ Created config directory: {}", dir.display());
    }

    if path.exists() && !force {
        println!("⚠️  Config already exists at: {}", path.display());
        println!("   Edit it manually or re-run with --force.\n");
        return Ok(());
    }

    std::fs::write(&path, AppConfig::default_toml())?;
    println!("✅ Wrote config.toml at: {}", path.display());

    println!("\n📝 Next steps:");
    println!("   1. Set your API key: export OPENAI_API_KEY=sk-...");
    println!("   2. Set the widget credential: export CONCIERGE_BOT_TOKEN=...");
    println!("   3. Edit [business] with your company, pricing and service areas");
    println!("   4. Check everything: concierge doctor");
    println!("   5. Start the gateway: concierge serve\n");

    Ok(())
}
