//! poolsync CLI
//!
//! Drives the connection engine and the operation engine against an
//! in-process simulated pool.
//!
//! # Commands
//!
//! - `watch` - Connect, generate events and print what the store saw
//! - `bond` - Bond NICs across the pool and report progress

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// poolsync developer tools.
#[derive(Parser)]
#[command(name = "poolsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a simulated pool and print the event stream
    Watch {
        /// Number of hosts in the pool
        #[arg(long, default_value = "3")]
        hosts: usize,

        /// Number of VM changes to generate
        #[arg(short, long, default_value = "10")]
        events: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Bond devices on every host of a simulated pool
    Bond {
        /// Number of hosts in the pool
        #[arg(long, default_value = "3")]
        hosts: usize,

        /// Devices to bond, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "eth1,eth2")]
        devices: Vec<String>,

        /// Make bond creation fail on this host (1-based)
        #[arg(long)]
        fail_on: Option<usize>,

        /// Bond mode (balance-slb, active-backup, lacp)
        #[arg(short, long, default_value = "balance-slb")]
        mode: String,

        /// Print the final store summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Watch {
            hosts,
            events,
            format,
        } => {
            commands::watch::run(hosts, events, &format).await?;
        }
        Commands::Bond {
            hosts,
            devices,
            fail_on,
            mode,
            json,
        } => {
            commands::bond::run(hosts, devices, fail_on, &mode, json).await?;
        }
        Commands::Version => {
            println!("poolsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("poolsync engine v{}", poolsync_engine::VERSION);
        }
    }

    Ok(())
}
