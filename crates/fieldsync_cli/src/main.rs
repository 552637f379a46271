//! FieldSync CLI
//!
//! Command-line tools for inspecting and repairing an on-device sync queue.
//!
//! # Commands
//!
//! - `inspect` - Display journal and queue statistics
//! - `list` - List queue items
//! - `verify` - Check queue invariants
//! - `purge` - Remove old synced data
//! - `reset` - Put failed items back to pending
//! - `dump-journal` - Dump journal entries for debugging

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use fieldsync_store::SyncStatus;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// FieldSync command-line queue tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of read commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display journal and queue statistics
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List queue items
    List {
        /// Only items with this status (pending, failed, abandoned, ...)
        #[arg(short, long)]
        status: Option<SyncStatus>,

        /// Only items of this tenant
        #[arg(short, long)]
        tenant: Option<String>,

        /// Maximum number of items to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Check queue invariants
    Verify {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Remove synced records older than a number of days, and expired queue items
    Purge {
        /// Minimum age in days of synced records to remove
        #[arg(short, long, default_value = "7")]
        days: u32,
    },

    /// Put failed, abandoned or auth-failed items back to pending
    Reset {
        /// Queue item id
        id: Option<u64>,

        /// Reset every item that needs attention
        #[arg(short, long, conflicts_with = "id")]
        all: bool,
    },

    /// Dump journal entries for debugging
    DumpJournal {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip entries with a lower sequence number
        #[arg(short, long, default_value = "0")]
        from: u64,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: Format,
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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::List {
            status,
            tenant,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for list")?;
            let filter = commands::list::Filter {
                status,
                tenant,
                limit,
            };
            commands::list::run(&path, &filter, format)?;
        }
        Commands::Verify { format } => {
            let path = cli.path.ok_or("Journal path required for verify")?;
            commands::verify::run(&path, format)?;
        }
        Commands::Purge { days } => {
            let path = cli.path.ok_or("Journal path required for purge")?;
            commands::purge::run(&path, days)?;
        }
        Commands::Reset { id, all } => {
            let path = cli.path.ok_or("Journal path required for reset")?;
            let target = match (id, all) {
                (Some(id), false) => commands::reset::Target::One(id),
                (None, true) => commands::reset::Target::All,
                _ => return Err("Specify a queue item id or --all".into()),
            };
            commands::reset::run(&path, target)?;
        }
        Commands::DumpJournal {
            limit,
            from,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for dump-journal")?;
            commands::dump_journal::run(&path, limit, from, format)?;
        }
        Commands::Version => {
            println!("FieldSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Journal format v{}",
                fieldsync_store::journal::JOURNAL_VERSION
            );
        }
    }

    Ok(())
}
