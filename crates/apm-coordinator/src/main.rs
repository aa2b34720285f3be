//! apm-coordinator - launches and supervises AI agent instances.

use agent_pm_coordinator::{Coordinator, CoordinatorLock};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process orchestrator for the agent-pm task-management server.
#[derive(Parser, Debug)]
#[command(name = "apm-coordinator")]
#[command(about = "Launches and supervises AI agent instances for the agent-pm server")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    agent_pm_coordinator_core::logging::init(level);

    let config = agent_pm_coordinator_core::config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    info!(config = %args.config.display(), "loaded configuration");

    // Exactly one coordinator per configuration identity; contention is the
    // one fatal startup condition (process exit code 1).
    let mut lock =
        CoordinatorLock::acquire(&config.lock_identity()).context("coordinator startup aborted")?;

    let cancel = CancellationToken::new();
    let cancel_for_signals = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("failed to listen for Ctrl+C");
            info!("received Ctrl+C");
        }

        cancel_for_signals.cancel();
    });

    let mut coordinator = Coordinator::new(config)?;
    coordinator.run(cancel).await;

    lock.release();
    info!("coordinator shutdown complete");
    Ok(())
}
