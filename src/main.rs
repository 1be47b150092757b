//! Palisade Agent - Main entry point
//!
//! Endpoint backup agent reporting to a remote control plane.

use anyhow::Result;
use clap::Parser;
use palisade_agent::{agent::Agent, config::Config, daemon::shutdown::ShutdownCoordinator, utils};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting palisade-agent v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Control plane: {}", config.api.url);
    tracing::info!("Backup target: {}", config.backup.path.display());

    // Create shutdown coordinator
    let coordinator = ShutdownCoordinator::new();
    let shutdown = coordinator.token();

    let agent = Agent::new(config)?;
    tracing::info!("Hostname: {}", agent.hostname());

    let mut agent_handle = tokio::spawn(agent.run(shutdown.clone()));

    // Wait for shutdown signal (or an early agent exit)
    tokio::select! {
        _ = coordinator.wait() => {}
        result = &mut agent_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow::anyhow!("agent task panicked: {e}")),
            };
        }
    }

    // Graceful shutdown with timeout
    match tokio::time::timeout(std::time::Duration::from_secs(10), &mut agent_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Agent shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Agent error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Agent task panicked: {}", e),
        Err(_) => tracing::warn!("Agent shutdown timeout, forcing exit"),
    }

    Ok(())
}
