//! Eviction Policy Module
//!
//! Candidate selection for partitions over budget. Exact LRU order over
//! millions of entries is too expensive to maintain, so the LRU policy
//! samples random entries and orders only the sample.

use std::collections::BTreeMap;
use std::fmt::Debug;

use rand::Rng;

use crate::cache::metadata::EvictionPolicyKind;
use crate::cache::pool::ScratchPool;
use crate::cache::{CacheKey, CacheValue};

/// An entry proposed for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub last_access: u64,
}

/// Clock and expiration rule used while sampling.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryCheck {
    pub now: u64,
    pub interval_ms: u64,
}

impl ExpiryCheck {
    pub fn is_expired(&self, value: &CacheValue) -> bool {
        value.is_expired(self.now, self.interval_ms)
    }
}

// == Eviction Policy Trait ==
pub trait EvictionPolicy: Send + Sync + Debug {
    fn kind(&self) -> EvictionPolicyKind;

    /// Returns candidates ordered by eviction preference, oldest first.
    ///
    /// The caller removes from the front until its target is met, so the list
    /// may be longer than `count`.
    fn select_candidates(
        &self,
        entries: &BTreeMap<CacheKey, CacheValue>,
        count: usize,
        expiry: ExpiryCheck,
        pool: &ScratchPool,
    ) -> Vec<EvictionCandidate>;
}

/// Builds the policy instance for a partition.
pub fn policy_for(kind: EvictionPolicyKind, samples_per_key: usize) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::NoEviction => Box::new(NoEviction),
        EvictionPolicyKind::ApproximateLru => Box::new(ApproximateLru::new(samples_per_key)),
    }
}

// == No Eviction ==
/// Never proposes anything; writers over budget get `InsufficientCapacity`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn kind(&self) -> EvictionPolicyKind {
        EvictionPolicyKind::NoEviction
    }

    fn select_candidates(
        &self,
        _entries: &BTreeMap<CacheKey, CacheValue>,
        _count: usize,
        _expiry: ExpiryCheck,
        _pool: &ScratchPool,
    ) -> Vec<EvictionCandidate> {
        Vec::new()
    }
}

// == Approximate LRU ==
#[derive(Debug, Clone, Copy)]
pub struct ApproximateLru {
    samples_per_key: usize,
}

impl ApproximateLru {
    pub fn new(samples_per_key: usize) -> Self {
        Self {
            samples_per_key: samples_per_key.max(1),
        }
    }
}

impl EvictionPolicy for ApproximateLru {
    fn kind(&self) -> EvictionPolicyKind {
        EvictionPolicyKind::ApproximateLru
    }

    fn select_candidates(
        &self,
        entries: &BTreeMap<CacheKey, CacheValue>,
        count: usize,
        expiry: ExpiryCheck,
        pool: &ScratchPool,
    ) -> Vec<EvictionCandidate> {
        let len = entries.len();
        if count == 0 || len == 0 {
            return Vec::new();
        }

        let sample_size = self.samples_per_key.saturating_mul(count);
        let mut candidates = if sample_size >= len {
            // Full scan
            entries
                .iter()
                .map(|(key, value)| EvictionCandidate {
                    key: key.clone(),
                    last_access: value.last_access(),
                })
                .collect::<Vec<_>>()
        } else {
            let mut indices = pool.rent(sample_size);
            fill_sorted_sample(&mut indices, sample_size, len);
            collect_sampled(entries, &indices, expiry, |sampled, expired| {
                sampled || expired
            })
        };

        candidates.sort_by_key(|c| c.last_access);
        candidates
    }
}

/// Fills `buffer` with up to `samples` distinct random indices in `[0, len)`,
/// sorted ascending.
pub(crate) fn fill_sorted_sample(buffer: &mut Vec<usize>, samples: usize, len: usize) {
    buffer.clear();
    if len == 0 {
        return;
    }
    if samples >= len {
        buffer.extend(0..len);
        return;
    }
    let mut rng = rand::thread_rng();
    buffer.extend((0..samples).map(|_| rng.gen_range(0..len)));
    buffer.sort_unstable();
    buffer.dedup();
}

/// Single forward scan over `entries`, stopping after the last sampled index.
///
/// `keep(sampled, expired)` decides which visited entries are collected.
pub(crate) fn collect_sampled<F>(
    entries: &BTreeMap<CacheKey, CacheValue>,
    indices: &[usize],
    expiry: ExpiryCheck,
    keep: F,
) -> Vec<EvictionCandidate>
where
    F: Fn(bool, bool) -> bool,
{
    let mut found = Vec::with_capacity(indices.len());
    let mut wanted = indices.iter().copied().peekable();

    for (idx, (key, value)) in entries.iter().enumerate() {
        let Some(&next) = wanted.peek() else {
            break;
        };
        let expired = expiry.is_expired(value);
        let sampled = idx == next;
        if sampled {
            wanted.next();
        }
        if keep(sampled, expired) {
            found.push(EvictionCandidate {
                key: key.clone(),
                last_access: value.last_access(),
            });
        }
    }
    found
}
