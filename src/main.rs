//! Partition Cache - host process
//!
//! Builds the engine from the environment, restores persisted partitions and
//! runs the background maintenance tasks until shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use partition_cache::cache::{CacheStore, CompactionQueue, ExpirationScanner};
use partition_cache::{spawn_compaction_task, spawn_expiration_task, Config};

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the store, failing if the host cannot back the budget
/// 4. Recover persisted partition metadata
/// 5. Start the expiration and compaction tasks
/// 6. Wait for SIGINT/SIGTERM, then cancel the tasks and wait for them
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partition_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting partition cache");

    let config = Config::from_env();
    info!(
        "Configuration loaded: max_cache_size={}, max_key_size={}, max_value_size={}, scan_interval={}ms",
        config.max_cache_size,
        config.max_key_size,
        config.max_value_size,
        config.expiration_scan_interval_ms
    );

    let (compaction_queue, compaction_receiver) = CompactionQueue::new();
    let store = CacheStore::builder(config.clone())
        .compaction_trigger(compaction_queue)
        .build()
        .context("failed to initialize cache store")?;
    let store = Arc::new(store);

    store
        .recover()
        .context("failed to recover partition metadata")?;

    let cancel = CancellationToken::new();
    let expiration_handle = spawn_expiration_task(
        Arc::clone(&store),
        Arc::new(ExpirationScanner::new(config.key_expiration_samples)),
        config.expiration_scan_interval(),
        config.expiration_scan_budget(),
        cancel.clone(),
    );
    let compaction_handle =
        spawn_compaction_task(Arc::clone(&store), compaction_receiver, cancel.clone());
    info!("Background tasks started");

    shutdown_signal().await?;

    cancel.cancel();
    expiration_handle
        .await
        .context("expiration task failed")?;
    compaction_handle
        .await
        .context("compaction task failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        }
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
    Ok(())
}
