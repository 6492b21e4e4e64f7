//! pmextent Command Line Interface
//!
//! Tool for creating and examining pmextent volume images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// pmextent - copy-on-write extent logs on a persistent block image
#[derive(Parser)]
#[command(
    name = "pmextent",
    about = "pmextent command-line interface",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and format a volume image
    Format(commands::format::FormatArgs),

    /// Write pages to an inode
    Write(commands::write::WriteArgs),

    /// Resolve logical pages to physical blocks
    Lookup(commands::lookup::LookupArgs),

    /// Dump an extent log or the free pool
    Inspect(commands::inspect::InspectArgs),

    /// Compact extent logs
    Compact(commands::compact::CompactArgs),

    /// Show volume statistics
    Stats(commands::stats::StatsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    info!("pmextent CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Format(args) => commands::format::run(args).await,
        Commands::Write(args) => commands::write::run(args).await,
        Commands::Lookup(args) => commands::lookup::run(args).await,
        Commands::Inspect(args) => commands::inspect::run(args).await,
        Commands::Compact(args) => commands::compact::run(args).await,
        Commands::Stats(args) => commands::stats::run(args).await,
    }
}
