//! Valet CLI — the main entry point.
//!
//! Commands:
//! - `serve`  — Start the HTTP gateway
//! - `route`  — Show the routing decision for a prompt
//! - `health` — Print the aggregated health snapshot

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "valet",
    about = "Valet — tiered request routing for a local-first assistant",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Policy file path (default: ~/.valet/policy.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Classify a prompt and print the routing decision
    Route {
        /// The prompt to classify
        prompt: String,
    },

    /// Print engine and session health
    Health {
        /// Policy file path (default: ~/.valet/policy.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
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

    match cli.command {
        Commands::Serve { port, config } => commands::serve::run(port, config.as_deref()).await?,
        Commands::Route { prompt } => commands::route::run(&prompt)?,
        Commands::Health { config } => commands::health::run(config.as_deref()).await?,
    }

    Ok(())
}
