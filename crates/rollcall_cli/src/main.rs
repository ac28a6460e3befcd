//! Rollcall CLI
//!
//! Command-line tools for exercising and inspecting the Rollcall sync core.
//!
//! # Commands
//!
//! - `simulate` - Seed records and run one sync cycle against an in-memory remote
//! - `status` - Display per-table sync state of a snapshot
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Rollcall sync core tools.
#[derive(Parser)]
#[command(name = "rollcall")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store snapshot file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed one record of each kind and run a sync cycle
    Simulate {
        /// Owner to sync for
        #[arg(short, long, default_value = "local-owner")]
        owner: String,

        /// Report the network as unreachable
        #[arg(long)]
        offline: bool,

        /// Inject a network failure for this table (e.g. "terms")
        #[arg(long)]
        fail_table: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display per-table sync state and checkpoints
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            owner,
            offline,
            fail_table,
            format,
        } => {
            let options = commands::simulate::Options {
                owner,
                offline,
                fail_table,
            };
            commands::simulate::run(cli.path.as_deref(), options, &format).await?;
        }
        Commands::Status { format } => {
            let path = cli.path.ok_or("Snapshot path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::Version => {
            println!("Rollcall CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
