//! CLI entry point for hashfetch.

use anyhow::{Context, Result};
use clap::Parser;
use hashfetch_core::EngineConfig;
use tracing::debug;

mod app;
mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let (mut config, source) =
        EngineConfig::resolve(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = &cli.db {
        config.paths.database.clone_from(db);
    }
    match &source {
        Some(path) => debug!(path = %path.display(), "configuration loaded"),
        None => debug!("no configuration file found, using defaults"),
    }
    debug!(database = %config.paths.database.display(), "hashfetch starting");

    app::run(cli.command, &config, cli.quiet).await
}
