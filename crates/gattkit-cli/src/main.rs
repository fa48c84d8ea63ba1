//! gattkit - Bluetooth Low Energy GATT command-line tool

use std::path::Path;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use gattkit_cli::{cli::Cli, commands::CommandDispatcher, config::CliAppConfig, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = CliAppConfig::load_with_overrides(
        cli.config.as_deref().map(Path::new),
        cli.verbose.then_some(true),
        cli.backend,
        cli.adapter.clone(),
    )?;

    // Initialize logging
    setup_logging(config.cli.verbose);
    debug!("Configuration: {:?}", config);

    if let Err(e) = CommandDispatcher::execute(cli.command, config).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Setup logging from `RUST_LOG`, falling back to the verbosity flag
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
