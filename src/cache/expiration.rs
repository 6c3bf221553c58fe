//! Expiration Scanner Module
//!
//! Eager removal of expired entries nobody reads anymore. Each run samples
//! random entries per partition, resuming where the previous run stopped and
//! staying within a wall-clock budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::CacheStore;

/// Why a run ended before visiting every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStop {
    Budget,
    Cancelled,
}

/// Outcome of one scanner run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub partitions_visited: usize,
    pub keys_sampled: usize,
    pub keys_expired: usize,
    pub stopped: Option<ScanStop>,
}

// == Expiration Scanner ==
/// Round-robin sampler over the partition table.
///
/// Runs must not overlap; the scheduler invoking `run` guarantees that.
#[derive(Debug)]
pub struct ExpirationScanner {
    samples: usize,
    cursor: AtomicUsize,
}

impl ExpirationScanner {
    /// # Arguments
    /// * `samples` - Entries sampled per partition per round
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Index of the partition the next run starts from.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Runs one scan.
    ///
    /// A partition is sampled again while at least a tenth of its last
    /// sample was expired. Cancellation is checked between partitions only;
    /// the budget is also checked between rounds on the same partition.
    ///
    /// # Arguments
    /// * `store` - Store whose partitions are scanned
    /// * `now` - Access time in milliseconds used for the expiry check
    /// * `budget` - Wall-clock time the run may take
    /// * `cancel` - Stops the run at the next partition boundary
    pub fn run(
        &self,
        store: &CacheStore,
        now: u64,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> ScanReport {
        let deadline = Instant::now() + budget;
        let partitions = store.partitions_snapshot();
        let mut report = ScanReport::default();
        if partitions.is_empty() {
            return report;
        }

        let start = self.cursor() % partitions.len();
        for offset in 0..partitions.len() {
            if cancel.is_cancelled() {
                report.stopped = Some(ScanStop::Cancelled);
                break;
            }
            if Instant::now() >= deadline {
                report.stopped = Some(ScanStop::Budget);
                break;
            }

            let index = (start + offset) % partitions.len();
            let partition = &partitions[index];
            self.cursor.store(index + 1, Ordering::Release);
            report.partitions_visited += 1;

            if partition.expiration_interval_ms() == 0 || partition.is_empty() {
                continue;
            }
            loop {
                let sampled = self.samples.min(partition.len());
                if sampled == 0 {
                    break;
                }
                let candidates = partition.sample_expired(self.samples, now);
                let expired = partition.expire(&candidates, now);
                report.keys_sampled += sampled;
                report.keys_expired += expired;

                if candidates.len() * 10 < sampled || Instant::now() >= deadline {
                    break;
                }
            }
        }

        debug!(
            partitions_visited = report.partitions_visited,
            keys_sampled = report.keys_sampled,
            keys_expired = report.keys_expired,
            stopped = ?report.stopped,
            "Expiration scan finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, ExpirationMode, FixedMemory, PartitionMetadata};
    use crate::config::Config;
    use bytes::Bytes;
    use std::sync::Arc;

    fn store() -> CacheStore {
        CacheStore::builder(Config {
            max_cache_size: 1 << 24,
            ..Config::default()
        })
        .host_memory(Arc::new(FixedMemory(None)))
        .build()
        .unwrap()
    }

    fn fill(store: &CacheStore, partition: &str, interval_ms: u64, count: usize, now: u64) {
        let key = CacheKey::from(partition);
        store
            .put_partition(
                &key,
                PartitionMetadata::new().with_expiration(interval_ms, ExpirationMode::Sliding),
            )
            .unwrap();
        let items: Vec<(CacheKey, Bytes)> = (0..count)
            .map(|i| (CacheKey::from(format!("k{}", i)), Bytes::from_static(b"v")))
            .collect();
        store
            .put_many(&key, &items, crate::cache::PutMode::Upsert, now)
            .unwrap();
    }

    #[test]
    fn test_scan_removes_all_expired_entries() {
        let store = store();
        fill(&store, "sessions", 100, 500, 0);
        let scanner = ExpirationScanner::new(20);

        let report = scanner.run(&store, 1_000, Duration::from_secs(10), &CancellationToken::new());

        assert_eq!(report.keys_expired, 500);
        assert_eq!(report.stopped, None);
        assert_eq!(store.statistics().item_count, 0);
    }

    #[test]
    fn test_scan_leaves_live_entries() {
        let store = store();
        fill(&store, "sessions", 100, 50, 0);
        fill(&store, "forever", 0, 50, 0);
        let scanner = ExpirationScanner::new(20);

        let report = scanner.run(&store, 50, Duration::from_secs(10), &CancellationToken::new());

        assert_eq!(report.keys_expired, 0);
        assert_eq!(report.partitions_visited, 2);
        assert_eq!(store.statistics().item_count, 100);
    }

    #[test]
    fn test_cancelled_scan_visits_nothing() {
        let store = store();
        fill(&store, "sessions", 100, 10, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = ExpirationScanner::new(20).run(&store, 1_000, Duration::from_secs(1), &cancel);
        assert_eq!(report.stopped, Some(ScanStop::Cancelled));
        assert_eq!(report.partitions_visited, 0);
    }

    #[test]
    fn test_cursor_round_robins() {
        let store = store();
        fill(&store, "a", 100, 1, 0);
        fill(&store, "b", 100, 1, 0);
        let scanner = ExpirationScanner::new(5);

        scanner.run(&store, 10, Duration::ZERO, &CancellationToken::new());
        assert_eq!(scanner.cursor(), 0);

        scanner.run(&store, 10, Duration::from_secs(1), &CancellationToken::new());
        assert_eq!(scanner.cursor(), 2);
    }
}
