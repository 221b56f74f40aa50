//! `concierge serve`: Start the HTTP gateway.

use std::path::Path;

pub async fn run(
    config_path: Option<&Path>,
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    if let Some(host) = host_override {
        config.gateway.host = host;
    }

    println!("🧹 {} Concierge", config.business.company.name);
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model: {}", config.model());
    println!(
        "   Streaming: {}",
        if config.streaming.enabled { "on" } else { "off" }
    );
    if config.bot_token().is_none() {
        eprintln!();
        eprintln!("  ERROR: No bot token configured!");
        eprintln!();
        eprintln!("  Every chat route requires the x-bot-token header. Set one of:");
        eprintln!("    CONCIERGE_BOT_TOKEN=...");
        eprintln!("    [gateway] bot_token = \"...\" in {}", super::config_path(config_path).display());
        eprintln!();
    }

    concierge_gateway::start(config).await?;

    Ok(())
}
