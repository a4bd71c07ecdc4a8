use anyhow::Context;
use clap::Parser;
use kubemetrics::cli::{commands, Cli};
use kubemetrics::lifecycle;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    info!("Starting kubemetrics v{}", kubemetrics::VERSION);

    let command = match cli.command {
        Some(command) => command,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    };

    let token = CancellationToken::new();
    tokio::spawn(lifecycle::shutdown_on_signal(token.clone()));

    let result = commands::handle_command(command, token)
        .await
        .context("metrics server failed");

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
