//! ChunkDB CLI
//!
//! Command-line tools for ChunkDB store maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display store metadata and chunk files per segment
//! - `verify` - Check the chunk layout and decode every chunk file
//! - `rollup` - Force rollups
//! - `recover` - Replay the pending log
//! - `dump-pending` - List pending log entries for debugging

mod commands;

use chunkdb_core::Range;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ChunkDB command-line store tools.
#[derive(Parser)]
#[command(name = "chunkdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Display store metadata and chunk files
    Inspect {
        /// List every chunk file
        #[arg(short, long)]
        chunks: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify the chunk layout and chunk file integrity
    Verify,

    /// Force rollups
    Rollup {
        /// Roll up every level-aligned range of every segment
        #[arg(short, long, conflicts_with_all = ["segment", "range"])]
        all: bool,

        /// Grouping number inside the target segment
        #[arg(short, long, requires = "range", allow_negative_numbers = true)]
        segment: Option<i64>,

        /// Range to roll up, as `start_end`
        #[arg(short, long, requires = "segment", allow_hyphen_values = true)]
        range: Option<Range>,
    },

    /// Replay the pending log
    Recover {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending log entries
    DumpPending {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
        Commands::Inspect { chunks, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, chunks, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Rollup {
            all,
            segment,
            range,
        } => {
            let path = cli.path.ok_or("Store path required for rollup")?;
            let mode = match (all, segment, range) {
                (true, _, _) => commands::rollup::Mode::All,
                (false, Some(segment), Some(range)) => commands::rollup::Mode::Target {
                    segment,
                    range,
                },
                _ => commands::rollup::Mode::Scheduled,
            };
            commands::rollup::run(&path, mode)?;
        }
        Commands::Recover { format } => {
            let path = cli.path.ok_or("Store path required for recover")?;
            commands::recover::run(&path, &format)?;
        }
        Commands::DumpPending { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump-pending")?;
            commands::dump_pending::run(&path, limit, &format)?;
        }
        Commands::Version => {
            println!("ChunkDB CLI v{}", env!("CARGO_PKG_VERSION"));
            let (major, minor) = chunkdb_core::FORMAT_VERSION;
            println!("Store format v{major}.{minor}");
        }
    }

    Ok(())
}
