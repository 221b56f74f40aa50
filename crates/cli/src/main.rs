//! Concierge CLI: the main entry point.
//!
//! Commands:
//! - `serve`   Start the HTTP gateway
//! - `ask`     Send one message from the terminal
//! - `init`    Write a default config file
//! - `doctor`  Check configuration and provider reachability

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "concierge",
    about = "Concierge: booking and pricing assistant for cleaning companies",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.concierge/config.toml
    #[arg(short, long, global = true, env = "CONCIERGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Ask the concierge a single question
    Ask {
        /// The message to send
        #[arg(short, long)]
        message: String,

        /// Use the conversational chat path instead of the tool-calling agent
        #[arg(long)]
        chat: bool,

        /// With --chat, wait for the full reply instead of streaming tokens
        #[arg(long, requires = "chat")]
        no_stream: bool,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Diagnose configuration and connectivity
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve { port, host } => commands::serve::run(config_path, port, host).await?,
        Commands::Ask {
            message,
            chat,
            no_stream,
        } => commands::ask::run(config_path, message, chat, no_stream).await?,
        Commands::Init { force } => commands::init::run(config_path, force).await?,
        Commands::Doctor => commands::doctor::run(config_path).await?,
    }

    Ok(())
}
