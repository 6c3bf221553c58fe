//! Compaction Module
//!
//! Brings a partition back under its budget after reconfiguration shrank it,
//! by evicting in bounded batches until the target is met.

use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheKey, Partition};

/// Largest number of entries one eviction round may remove.
const MAX_EVICTIONS_PER_ROUND: usize = 4096;

/// Requests compaction of a partition from whoever schedules it.
pub trait CompactionTrigger: Send + Sync + Debug {
    fn request(&self, partition: &CacheKey);
}

/// Receiving side of a `CompactionQueue`.
pub type CompactionReceiver = mpsc::UnboundedReceiver<CacheKey>;

/// Trigger backed by an unbounded channel, drained by the compaction task.
#[derive(Debug)]
pub struct CompactionQueue {
    sender: mpsc::UnboundedSender<CacheKey>,
}

impl CompactionQueue {
    pub fn new() -> (Arc<Self>, CompactionReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl CompactionTrigger for CompactionQueue {
    fn request(&self, partition: &CacheKey) {
        if self.sender.send(partition.clone()).is_err() {
            warn!(partition = %partition, "Compaction requested but no compaction task is running");
        }
    }
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub items_before: usize,
    pub items_after: usize,
    /// Entries removed by the run
    pub evicted: usize,
    pub cancelled: bool,
}

// == Compact ==
/// Evicts from `partition` until it is under budget, eviction stalls, or
/// `cancel` fires between rounds.
pub fn compact(partition: &Partition, now: u64, cancel: &CancellationToken) -> CompactionReport {
    let items_before = partition.len();
    let mut report = CompactionReport {
        items_before,
        ..CompactionReport::default()
    };

    while partition.eviction_enabled() && partition.is_over_budget() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let removed = partition.evict(round_size(partition), now);
        if removed == 0 {
            break;
        }
        report.evicted += removed;
    }

    report.items_after = partition.len();
    debug!(
        partition = %partition.key(),
        items_before = report.items_before,
        items_after = report.items_after,
        evicted = report.evicted,
        cancelled = report.cancelled,
        "Compaction finished"
    );
    report
}

/// Entries to evict in one round: the byte excess divided by the average
/// entry size, at least one.
fn round_size(partition: &Partition) -> usize {
    let stats = partition.stats();
    let (used, limit) = if partition.is_bounded() {
        (stats.total_size(), partition.max_cache_size())
    } else {
        let global = stats.global();
        (global.unreserved_size(), global.unreserved_budget())
    };
    let items = stats.item_count().max(1);
    let average = (stats.total_size() / items).max(1);
    let excess = used.saturating_sub(limit);

    let count = (excess / average).saturating_add(1);
    usize::try_from(count)
        .unwrap_or(MAX_EVICTIONS_PER_ROUND)
        .clamp(1, MAX_EVICTIONS_PER_ROUND)
}
