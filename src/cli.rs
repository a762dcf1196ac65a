// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "collarlink")]
#[command(author, version, about = "Coordinator and forwarder agents for the BLE collar")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    // === Daemons ===
    /// Run the coordinator daemon
    Serve,

    /// Run a forwarder agent
    Agent,

    // === Device utilities (local radio, no coordinator involved) ===
    /// Scan for compatible devices and list them
    #[command(visible_alias = "s")]
    Scan {
        /// Scan window in milliseconds (defaults to the configured value)
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Write a shock/vibrate/sound command to the device
    Send {
        /// Shock intensity (0-100)
        shock: f64,
        /// Vibration intensity (0-100)
        #[arg(default_value_t = 0.0)]
        vibro: f64,
        /// Sound intensity (0-100)
        #[arg(default_value_t = 0.0)]
        sound: f64,
    },

    /// Trigger the device's find beacon
    Find,

    /// Query the battery level
    #[command(visible_alias = "bat")]
    Battery,
}
