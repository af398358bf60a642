//! doctxn CLI
//!
//! Maintenance tools for store snapshot files written by
//! `InMemoryStore::save_snapshot`.
//!
//! # Commands
//!
//! - `inspect` - List transaction records and their attempts
//! - `verify` - Find documents left staged by dead attempts
//! - `cleanup` - Run one cleanup sweep over the snapshot
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// doctxn command-line maintenance tools.
#[derive(Parser)]
#[command(name = "doctxn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store snapshot file
    #[arg(global = true, short, long)]
    snapshot: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List transaction records with the phase and age of every attempt
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Report documents whose staging belongs to a dead attempt
    Verify,

    /// Finish or roll back abandoned attempts
    Cleanup {
        /// Dry run - sweep in memory without writing the snapshot back
        #[arg(short, long)]
        dry_run: bool,

        /// Sweep as if the clock read this many ms since the Unix epoch
        #[arg(long)]
        now_ms: Option<u64>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.snapshot.ok_or("Snapshot path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.snapshot.ok_or("Snapshot path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Cleanup { dry_run, now_ms } => {
            let path = cli.snapshot.ok_or("Snapshot path required for cleanup")?;
            commands::cleanup::run(&path, dry_run, now_ms)?;
        }
        Commands::Version => {
            println!("doctxn CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("doctxn core v{}", doctxn_core::VERSION);
        }
    }

    Ok(())
}
