#![warn(missing_docs)]

//! ClaudeFS pNFS layout manager daemon

use anyhow::{Context, Result};
use clap::Parser;
use claudefs_pnfs::{LayoutManager, LayoutManagerConfig, RecallAcknowledged, RecallEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line of the layout manager daemon
#[derive(Debug, Parser)]
#[command(name = "cfs-pnfs", version, about = "ClaudeFS pNFS layout manager")]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "CFS_PNFS_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => LayoutManagerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LayoutManagerConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if cli.check {
        tracing::info!(devices = config.devices.len(), "configuration is valid");
        return Ok(());
    }

    tracing::info!("ClaudeFS pNFS layout manager starting...");

    let (manager, mut events) = LayoutManager::from_config(config)?;
    let manager = Arc::new(manager);
    tracing::info!(
        devices = manager.registry().len(),
        return_on_close = manager.config().return_on_close,
        "layout manager ready"
    );

    // Callbacks go to the session layer; until one is attached, log them.
    let callback_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RecallEvent::RecallIssued {
                    client_id,
                    file_id,
                    stateid,
                    range,
                    reason,
                    ..
                } => tracing::info!(
                    client = %client_id,
                    file = %file_id,
                    %stateid,
                    %range,
                    ?reason,
                    "CB_LAYOUTRECALL"
                ),
                RecallEvent::LayoutRevoked {
                    client_id,
                    file_id,
                    stateid,
                } => tracing::warn!(
                    client = %client_id,
                    file = %file_id,
                    %stateid,
                    "layout revoked"
                ),
            }
        }
    });

    let (_ack_tx, ack_rx) = mpsc::unbounded_channel::<RecallAcknowledged>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = manager.spawn_maintenance(ack_rx, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    maintenance.await?;

    let stats = manager.stats();
    tracing::info!(
        granted = stats.layouts_granted,
        returned = stats.layouts_returned,
        revoked = stats.layouts_revoked,
        recalls = stats.recalls_issued,
        "ClaudeFS pNFS layout manager stopped"
    );
    drop(manager);
    callback_handle.abort();

    Ok(())
}
