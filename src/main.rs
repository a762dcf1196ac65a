//! Collarlink CLI
//!
//! Entry point for the coordinator daemon, the forwarder agent, and the
//! direct-device utilities.

use clap::Parser;

// CLI definitions
mod cli;
use cli::{Cli, Commands};

// Direct-device command handlers
mod commands;

use collarlink::{agent, config::Config, coordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("collarlink=info".parse()?),
        )
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        // === Daemons ===
        Commands::Serve => {
            coordinator::run(config).await?;
        }
        Commands::Agent => {
            agent::run(config).await?;
        }

        // === Device utilities ===
        Commands::Scan { duration_ms } => {
            commands::scan(&config, duration_ms).await?;
        }
        Commands::Send {
            shock,
            vibro,
            sound,
        } => {
            commands::send(&config, shock, vibro, sound).await?;
        }
        Commands::Find => {
            commands::find(&config).await?;
        }
        Commands::Battery => {
            commands::battery(&config).await?;
        }
    }

    Ok(())
}
