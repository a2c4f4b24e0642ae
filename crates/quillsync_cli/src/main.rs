//! QuillSync CLI
//!
//! Maintenance tools for the store a QuillSync client persists its sync
//! state in. Every command takes the store's directory lock, so it must not
//! run while the client application has the store open.
//!
//! # Commands
//!
//! - `inspect` - Display pending deltas, queue and operation counts
//! - `dump-deltas` - Dump pending deltas in causal order
//! - `verify` - Recompute delta checksums and report mismatches
//! - `requeue-failed` - Move failed items back to the active queue

mod commands;

use clap::{Parser, Subcommand};
use quillsync_engine::DEFAULT_NAMESPACE;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// QuillSync command-line store tools.
#[derive(Parser)]
#[command(name = "quillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Key namespace the client was configured with
    #[arg(global = true, short, long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display pending deltas, queue and operation counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump pending deltas in causal order
    DumpDeltas {
        /// Maximum number of deltas to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only dump deltas of this entity type
        #[arg(short, long)]
        entity: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Recompute delta checksums and report mismatches
    Verify,

    /// Move failed items back to the active queue
    RequeueFailed {
        /// Also requeue failed optimistic operations
        #[arg(short, long)]
        operations: bool,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &cli.namespace, &format)?;
        }
        Commands::DumpDeltas {
            limit,
            entity,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-deltas")?;
            commands::dump_deltas::run(&path, &cli.namespace, limit, entity.as_deref(), &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, &cli.namespace)?;
        }
        Commands::RequeueFailed {
            operations,
            dry_run,
        } => {
            let path = cli.path.ok_or("Store path required for requeue-failed")?;
            commands::requeue::run(&path, &cli.namespace, operations, dry_run)?;
        }
        Commands::Version => {
            println!("QuillSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
