//! LayerFS Command Line Interface
//!
//! Mounts a LayerFS engine and drives its clone control channel.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// LayerFS - Layered copy-on-write filesystem with cheap directory clones
#[derive(Parser)]
#[command(
    name = "layerfs",
    about = "LayerFS command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "LayerFS Contributors"
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
    /// Mount a LayerFS filesystem
    Mount(commands::mount::MountArgs),

    /// Clone a directory of a mounted filesystem into a new layer
    Clone(commands::clone::CloneArgs),

    /// Remove a clone by its root directory
    Remove(commands::clone::RemoveArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("LayerFS CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Mount(args) => commands::mount::run(args),
        Commands::Clone(args) => commands::clone::run_clone(args),
        Commands::Remove(args) => commands::clone::run_remove(args),
    }
}
