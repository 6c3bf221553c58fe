//! Cache Statistics Module
//!
//! Lock-free counters tracked per partition and rolled up into global
//! runtime statistics, plus the capacity accounting used for admission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Why an entry left a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Deleted,
    Evicted,
    Expired,
}

// == Runtime Statistics ==
/// Global statistics and budget accounting shared by every partition.
///
/// `unreserved_size` is the byte usage of unbounded partitions, which compete
/// for whatever the reserved sizes of bounded partitions leave over.
#[derive(Debug)]
pub struct RuntimeStatistics {
    max_cache_size: u64,
    item_count: AtomicU64,
    total_size: AtomicU64,
    unreserved_size: AtomicU64,
    reserved_size: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl RuntimeStatistics {
    pub fn new(max_cache_size: u64) -> Self {
        Self {
            max_cache_size,
            item_count: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            unreserved_size: AtomicU64::new(0),
            reserved_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    pub fn item_count(&self) -> u64 {
        self.item_count.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn reserved_size(&self) -> u64 {
        self.reserved_size.load(Ordering::Acquire)
    }

    pub fn unreserved_size(&self) -> u64 {
        self.unreserved_size.load(Ordering::Acquire)
    }

    /// Budget left for unbounded partitions once reservations are honored.
    pub fn unreserved_budget(&self) -> u64 {
        self.max_cache_size.saturating_sub(self.reserved_size())
    }

    // == Available Capacity ==
    /// Configured maximum minus the larger of used and reserved bytes.
    pub fn available_capacity(&self) -> u64 {
        self.max_cache_size
            .saturating_sub(self.total_size().max(self.reserved_size()))
    }

    /// Admits `delta` more bytes of unbounded usage if the budget allows it.
    pub fn try_grow_unreserved(&self, delta: u64) -> bool {
        let budget = self.unreserved_budget();
        self.unreserved_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(delta)
                    .filter(|next| *next <= budget)
            })
            .is_ok()
    }

    fn add_unreserved(&self, n: u64) {
        self.unreserved_size.fetch_add(n, Ordering::AcqRel);
    }

    fn release_unreserved(&self, n: u64) {
        saturating_sub(&self.unreserved_size, n);
    }

    // == Reservations ==
    /// Reserves `amount` bytes for a bounded partition.
    ///
    /// `credit` is unbounded usage that leaves the shared pool as part of the
    /// same reconfiguration (a partition switching from unbounded to bounded).
    pub fn try_reserve(&self, amount: u64, credit: u64) -> bool {
        let shared = self.unreserved_size().saturating_sub(credit);
        let max = self.max_cache_size;
        self.reserved_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(amount)
                    .filter(|next| next.saturating_add(shared) <= max)
            })
            .is_ok()
    }

    pub fn release_reserved(&self, amount: u64) {
        saturating_sub(&self.reserved_size, amount);
    }

    // == Snapshot ==
    pub fn snapshot(&self) -> RuntimeStats {
        let hits = self.hits.load(Ordering::Acquire);
        let misses = self.misses.load(Ordering::Acquire);
        RuntimeStats {
            item_count: self.item_count(),
            total_size: self.total_size(),
            reserved_size: self.reserved_size(),
            max_cache_size: self.max_cache_size,
            available_capacity: self.available_capacity(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Acquire),
            expirations: self.expirations.load(Ordering::Acquire),
            hit_rate: hit_rate(hits, misses),
        }
    }
}

// == Partition Statistics ==
/// Per-partition counters. Every change is mirrored into the global
/// `RuntimeStatistics`.
///
/// Size and item counters only change while the owning partition's write lock
/// is held; hit/miss counters are updated from readers.
#[derive(Debug)]
pub struct PartitionStatistics {
    global: Arc<RuntimeStatistics>,
    hits: AtomicU64,
    misses: AtomicU64,
    item_count: AtomicU64,
    total_size: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    deletions: AtomicU64,
    last_hit: AtomicU64,
}

impl PartitionStatistics {
    pub fn new(global: Arc<RuntimeStatistics>) -> Self {
        Self {
            global,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            item_count: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            deletions: AtomicU64::new(0),
            last_hit: AtomicU64::new(0),
        }
    }

    pub fn global(&self) -> &Arc<RuntimeStatistics> {
        &self.global
    }

    pub fn item_count(&self) -> u64 {
        self.item_count.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Acquire)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Acquire)
    }

    /// Time of the most recent hit, 0 if never hit.
    pub fn last_hit(&self) -> u64 {
        self.last_hit.load(Ordering::Acquire)
    }

    // == Record Hit / Miss ==
    pub fn record_hit(&self, now: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_hit.fetch_max(now, Ordering::AcqRel);
        self.global.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.global.misses.fetch_add(1, Ordering::Relaxed);
    }

    // == Item Accounting ==
    pub fn record_insert(&self) {
        self.item_count.fetch_add(1, Ordering::AcqRel);
        self.global.item_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_removal(&self, cause: RemovalCause) {
        saturating_sub(&self.item_count, 1);
        saturating_sub(&self.global.item_count, 1);
        match cause {
            RemovalCause::Deleted => {
                self.deletions.fetch_add(1, Ordering::Relaxed);
            }
            RemovalCause::Evicted => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.global.evictions.fetch_add(1, Ordering::Relaxed);
            }
            RemovalCause::Expired => {
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.global.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // == Size Accounting ==
    /// Admits `delta` more bytes against the partition's budget.
    ///
    /// Bounded partitions (`max_size > 0`) check their own reservation;
    /// unbounded ones check the shared global budget.
    pub fn try_grow(&self, delta: u64, max_size: u64) -> bool {
        if delta == 0 {
            return true;
        }
        if max_size > 0 {
            if self.total_size().saturating_add(delta) > max_size {
                return false;
            }
        } else if !self.global.try_grow_unreserved(delta) {
            return false;
        }
        self.total_size.fetch_add(delta, Ordering::AcqRel);
        self.global.total_size.fetch_add(delta, Ordering::AcqRel);
        true
    }

    /// Releases `n` bytes.
    pub fn shrink(&self, n: u64, max_size: u64) {
        if n == 0 {
            return;
        }
        saturating_sub(&self.total_size, n);
        saturating_sub(&self.global.total_size, n);
        if max_size == 0 {
            self.global.release_unreserved(n);
        }
    }

    /// Moves this partition's usage between the shared and reserved pools
    /// when it switches between unbounded and bounded.
    pub fn convert(&self, old_max: u64, new_max: u64) {
        let size = self.total_size();
        match (old_max == 0, new_max == 0) {
            (true, false) => self.global.release_unreserved(size),
            (false, true) => self.global.add_unreserved(size),
            _ => {}
        }
    }

    // == Reset ==
    /// Clears the activity counters after a flush.
    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Release);
        self.misses.store(0, Ordering::Release);
        self.evictions.store(0, Ordering::Release);
        self.expirations.store(0, Ordering::Release);
        self.deletions.store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> PartitionStats {
        let hits = self.hits.load(Ordering::Acquire);
        let misses = self.misses.load(Ordering::Acquire);
        PartitionStats {
            hits,
            misses,
            item_count: self.item_count(),
            total_size: self.total_size(),
            evictions: self.evictions(),
            expirations: self.expirations(),
            deletions: self.deletions.load(Ordering::Acquire),
            last_hit: self.last_hit(),
            hit_rate: hit_rate(hits, misses),
        }
    }
}

// == Snapshots ==
/// Point-in-time copy of a partition's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionStats {
    pub hits: u64,
    pub misses: u64,
    pub item_count: u64,
    pub total_size: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub deletions: u64,
    pub last_hit: u64,
    pub hit_rate: f64,
}

/// Point-in-time copy of the global counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeStats {
    pub item_count: u64,
    pub total_size: u64,
    pub reserved_size: u64,
    pub max_cache_size: u64,
    pub available_capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

/// Returns hits / (hits + misses), or 0.0 if no requests have been made.
fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(n))
    });
}
