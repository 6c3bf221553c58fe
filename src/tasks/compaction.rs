//! Compaction Task
//!
//! Drains compaction requests and runs them one at a time.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{current_timestamp_ms, CacheStore, CompactionReceiver};
use crate::error::CacheError;

/// Spawns a task that compacts each partition sent through the queue.
///
/// Requests are handled sequentially on the blocking pool. A partition
/// deleted before its turn is skipped.
///
/// # Arguments
/// * `store` - Shared store owning the partitions
/// * `receiver` - Receiving side of the store's `CompactionQueue`
/// * `cancel` - Stops the loop, and a running compaction between rounds
pub fn spawn_compaction_task(
    store: Arc<CacheStore>,
    mut receiver: CompactionReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting compaction task");

        loop {
            let partition = tokio::select! {
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(partition) => partition,
                    None => break,
                },
            };

            let run = {
                let store = Arc::clone(&store);
                let cancel = cancel.clone();
                let partition = partition.clone();
                tokio::task::spawn_blocking(move || {
                    store.compact_partition(&partition, current_timestamp_ms(), &cancel)
                })
            };

            match run.await {
                Ok(Ok(report)) => info!(
                    partition = %partition,
                    evicted = report.evicted,
                    items_after = report.items_after,
                    "Compacted partition"
                ),
                Ok(Err(CacheError::PartitionDoesNotExist)) => {
                    debug!(partition = %partition, "Skipped compaction of deleted partition");
                }
                Ok(Err(err)) => warn!(partition = %partition, error = %err, "Compaction failed"),
                Err(err) => warn!(partition = %partition, error = %err, "Compaction panicked"),
            }
        }

        info!("Compaction task stopped");
    })
}
