use anyhow::{Context, Result};
use clap::Parser;
use shorts_budget::{app, cli, config};
use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::AppConfig::load(cli.config_path.as_deref())?;
    init_tracing(&config.log_path())?;
    let app = app::App::new(config, cli.headless).await?;
    app.run().await
}

fn init_tracing(log_path: &Path) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Keep the TUI clean: write all tracing output to a file instead of the terminal.
    let writer = Mutex::new(open_log(log_path)?);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(())
}

fn open_log(log_path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open {} for tracing output", log_path.display()))
}
