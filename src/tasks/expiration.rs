//! Expiration Task
//!
//! Background task that periodically runs the expiration scanner.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{current_timestamp_ms, CacheStore, ExpirationScanner};

/// Spawns a background task that runs one expiration scan per interval.
///
/// Each scan runs on the blocking pool so sampling never stalls the async
/// workers. A scan that panics is logged and the next interval retries.
///
/// # Arguments
/// * `store` - Shared store to scan
/// * `scanner` - Scanner keeping the round-robin position between runs
/// * `interval` - Pause between scans
/// * `budget` - Wall-clock budget of a single scan
/// * `cancel` - Stops the loop, and any running scan at its next partition
///
/// # Returns
/// A JoinHandle that completes once the task observed cancellation.
pub fn spawn_expiration_task(
    store: Arc<CacheStore>,
    scanner: Arc<ExpirationScanner>,
    interval: Duration,
    budget: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting expiration task with interval of {}ms",
            interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let run = {
                let store = Arc::clone(&store);
                let scanner = Arc::clone(&scanner);
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || {
                    scanner.run(&store, current_timestamp_ms(), budget, &cancel)
                })
            };

            match run.await {
                Ok(report) if report.keys_expired > 0 => {
                    info!(
                        "Expiration scan: removed {} expired entries from {} partitions",
                        report.keys_expired, report.partitions_visited
                    );
                }
                Ok(_) => debug!("Expiration scan: no expired entries found"),
                Err(err) => warn!(error = %err, "Expiration scan failed"),
            }
        }

        info!("Expiration task stopped");
    })
}
