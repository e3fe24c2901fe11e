use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the watch-time budget daemon.
#[derive(Debug, Parser)]
#[command(author, version, about = "Daily Shorts watch-time budget daemon and dashboard", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./shorts-budget.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Serve the browser extension without the terminal dashboard; stop with Ctrl-C.
    #[arg(long)]
    pub headless: bool,
}
