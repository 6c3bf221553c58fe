//! Partition Module
//!
//! A named shard of the key space: its entries, statistics, metadata,
//! eviction policy and watch predicates, all guarded by one reader/writer
//! lock.
//!
//! Every operation takes the caller's notion of `now` (milliseconds) instead
//! of sampling the clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::cache::eviction::{
    collect_sampled, fill_sorted_sample, policy_for, EvictionPolicy, ExpiryCheck,
};
use crate::cache::metadata::{EvictionPolicyKind, PartitionMetadata};
use crate::cache::pattern::GlobPattern;
use crate::cache::pool::ScratchPool;
use crate::cache::stats::{PartitionStatistics, RemovalCause};
use crate::cache::{CacheKey, CacheValue};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::watch::{EventType, WatchList, WatchPredicate};

/// Conditional behavior of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Insert or overwrite
    Upsert,
    /// Only overwrite live keys
    IfExists,
    /// Only insert keys that are absent or expired
    IfNotExists,
}

/// Size limits and sampling knobs shared by all partitions.
#[derive(Debug, Clone, Copy)]
pub struct PartitionLimits {
    pub max_key_size: usize,
    pub max_value_size: usize,
    pub key_eviction_samples: usize,
}

impl From<&Config> for PartitionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_key_size: config.max_key_size,
            max_value_size: config.max_value_size,
            key_eviction_samples: config.key_eviction_samples,
        }
    }
}

/// What an eviction run should achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionGoal {
    /// Get usage strictly under the budget
    BelowLimit,
    /// Make room for this many more bytes
    Room(u64),
}

/// Result of a write that may have been refused for lack of space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission<T> {
    Done(T),
    NeedsRoom(u64),
}

/// One page of a key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyScan {
    pub keys: Vec<CacheKey>,
    /// Offset to pass for the next page, None when exhausted
    pub next_offset: Option<usize>,
}

struct PartitionState {
    entries: BTreeMap<CacheKey, CacheValue>,
    metadata: PartitionMetadata,
    eviction: Box<dyn EvictionPolicy>,
    watchers: WatchList,
}

impl PartitionState {
    fn expiry(&self, now: u64) -> ExpiryCheck {
        ExpiryCheck {
            now,
            interval_ms: self.metadata.expiration_interval_ms,
        }
    }
}

// == Partition ==
pub struct Partition {
    key: CacheKey,
    state: RwLock<PartitionState>,
    stats: PartitionStatistics,
    limits: PartitionLimits,
    pool: Arc<ScratchPool>,
    /// Serializes reconfiguration and its metadata I/O, separately from `state`
    config_lock: Mutex<()>,
    /// Mirrors of metadata fields readable without the data lock
    max_cache_size: AtomicU64,
    evicts: AtomicBool,
    deleted: AtomicBool,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("key", &self.key)
            .field("item_count", &self.stats.item_count())
            .field("total_size", &self.stats.total_size())
            .finish()
    }
}

impl Partition {
    // == Constructor ==
    pub fn new(
        key: CacheKey,
        metadata: PartitionMetadata,
        stats: PartitionStatistics,
        limits: PartitionLimits,
        pool: Arc<ScratchPool>,
    ) -> Self {
        let eviction = policy_for(metadata.eviction_policy, limits.key_eviction_samples);
        Self {
            key,
            max_cache_size: AtomicU64::new(metadata.max_cache_size),
            evicts: AtomicBool::new(
                metadata.eviction_policy != EvictionPolicyKind::NoEviction,
            ),
            state: RwLock::new(PartitionState {
                entries: BTreeMap::new(),
                metadata,
                eviction,
                watchers: WatchList::new(),
            }),
            stats,
            limits,
            pool,
            config_lock: Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn stats(&self) -> &PartitionStatistics {
        &self.stats
    }

    pub fn metadata(&self) -> PartitionMetadata {
        self.state.read().metadata.clone()
    }

    /// Reserved budget, 0 when unbounded. Lock-free.
    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size.load(Ordering::Acquire)
    }

    pub fn is_bounded(&self) -> bool {
        self.max_cache_size() > 0
    }

    /// Whether the active policy can free space. Lock-free.
    pub fn eviction_enabled(&self) -> bool {
        self.evicts.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock_config(&self) -> MutexGuard<'_, ()> {
        self.config_lock.lock()
    }

    // == Get ==
    /// Looks up a live value.
    ///
    /// An expired entry is removed on the spot and reported as a miss.
    /// `touch` refreshes the access time unless expiration is absolute.
    pub fn get(&self, key: &CacheKey, now: u64, touch: bool, count_stats: bool) -> Option<Bytes> {
        {
            let state = self.state.read();
            match state.entries.get(key) {
                None => {
                    if count_stats {
                        self.stats.record_miss();
                    }
                    return None;
                }
                Some(value) if !state.expiry(now).is_expired(value) => {
                    if touch && !state.metadata.is_absolute() {
                        value.touch(now);
                    }
                    if count_stats {
                        self.stats.record_hit(now);
                    }
                    return Some(value.payload().clone());
                }
                Some(_) => {}
            }
        }

        self.expire(std::slice::from_ref(key), now);
        if count_stats {
            self.stats.record_miss();
        }
        None
    }

    // == Get Many ==
    /// Returns the live entries among `keys` in one read-locked pass.
    ///
    /// Expired entries seen during the pass are removed together afterwards.
    pub fn get_many(&self, keys: &[CacheKey], now: u64) -> Vec<(CacheKey, Bytes)> {
        let mut found = Vec::with_capacity(keys.len());
        let mut expired = Vec::new();
        {
            let state = self.state.read();
            let expiry = state.expiry(now);
            let absolute = state.metadata.is_absolute();
            for key in keys {
                match state.entries.get(key) {
                    Some(value) if expiry.is_expired(value) => {
                        expired.push(key.clone());
                        self.stats.record_miss();
                    }
                    Some(value) => {
                        if !absolute {
                            value.touch(now);
                        }
                        self.stats.record_hit(now);
                        found.push((key.clone(), value.payload().clone()));
                    }
                    None => self.stats.record_miss(),
                }
            }
        }
        if !expired.is_empty() {
            self.expire(&expired, now);
        }
        found
    }

    // == Touch ==
    /// Refreshes a live key's access time. Absolute partitions keep their
    /// deadline but still report success for live keys.
    pub fn touch(&self, key: &CacheKey, now: u64) -> Result<()> {
        {
            let state = self.state.read();
            match state.entries.get(key) {
                None => return Err(CacheError::KeyDoesNotExist),
                Some(value) if !state.expiry(now).is_expired(value) => {
                    if !state.metadata.is_absolute() {
                        value.touch(now);
                    }
                    return Ok(());
                }
                Some(_) => {}
            }
        }
        self.expire(std::slice::from_ref(key), now);
        Err(CacheError::KeyDoesNotExist)
    }

    // == TTL ==
    /// Remaining lifetime of a live key in milliseconds, None if it never expires.
    pub fn ttl(&self, key: &CacheKey, now: u64) -> Result<Option<u64>> {
        {
            let state = self.state.read();
            let interval = state.metadata.expiration_interval_ms;
            match state.entries.get(key) {
                None => return Err(CacheError::KeyDoesNotExist),
                Some(value) if !value.is_expired(now, interval) => {
                    return Ok(value.ttl_remaining_ms(now, interval));
                }
                Some(_) => {}
            }
        }
        self.expire(std::slice::from_ref(key), now);
        Err(CacheError::KeyDoesNotExist)
    }

    // == Put ==
    /// Writes a batch without evicting. Over-budget batches fail with
    /// `InsufficientCapacity`.
    pub fn put_many(&self, items: &[(CacheKey, Bytes)], mode: PutMode, now: u64) -> Result<usize> {
        match self.write_many(items, mode, now)? {
            Admission::Done(written) => Ok(written),
            Admission::NeedsRoom(bytes) => Err(self.insufficient(bytes)),
        }
    }

    /// Validates the whole batch, admits its aggregate size delta, then
    /// applies it. Nothing is written unless every item passes.
    pub(crate) fn write_many(
        &self,
        items: &[(CacheKey, Bytes)],
        mode: PutMode,
        now: u64,
    ) -> Result<Admission<usize>> {
        for (key, value) in items {
            self.validate_key(key)?;
            self.validate_value(value)?;
        }
        // Later duplicates win; the rest keep their batch order
        let last: HashMap<&CacheKey, usize> =
            items.iter().enumerate().map(|(i, (k, _))| (k, i)).collect();
        let batch: Vec<(&CacheKey, &Bytes)> = items
            .iter()
            .enumerate()
            .filter(|(i, (k, _))| last.get(k) == Some(i))
            .map(|(_, (k, v))| (k, v))
            .collect();

        let mut guard = self.state.write();
        let state = &mut *guard;
        self.ensure_live()?;
        let expiry = state.expiry(now);

        let mut new_bytes = 0u64;
        let mut old_bytes = 0u64;
        for (key, value) in &batch {
            let existing = state.entries.get(*key);
            let live = existing.is_some_and(|v| !expiry.is_expired(v));
            match mode {
                PutMode::IfNotExists if live => return Err(CacheError::KeyAlreadyExists),
                PutMode::IfExists if !live => return Err(CacheError::KeyDoesNotExist),
                _ => {}
            }
            new_bytes += entry_size(key, value.len());
            if let Some(old) = existing {
                old_bytes += entry_size(key, old.len());
            }
        }

        let max_size = state.metadata.max_cache_size;
        if new_bytes > old_bytes && !self.stats.try_grow(new_bytes - old_bytes, max_size) {
            return Ok(Admission::NeedsRoom(new_bytes - old_bytes));
        }

        let absolute = state.metadata.is_absolute();
        for (key, payload) in batch.iter() {
            let value = CacheValue::new((*payload).clone(), now);
            match state.entries.insert((*key).clone(), value) {
                Some(old) if expiry.is_expired(&old) => {
                    self.stats.record_removal(RemovalCause::Expired);
                    self.stats.record_insert();
                    state
                        .watchers
                        .publish(&self.key, key, None, EventType::Expire);
                }
                Some(old) => {
                    if absolute {
                        if let Some(value) = state.entries.get(*key) {
                            value.set_last_access(old.last_access());
                        }
                    }
                }
                None => self.stats.record_insert(),
            }
            state
                .watchers
                .publish(&self.key, key, Some(*payload), EventType::Write);
        }

        if old_bytes > new_bytes {
            self.stats.shrink(old_bytes - new_bytes, max_size);
        }
        Ok(Admission::Done(batch.len()))
    }

    // == Delete ==
    /// Removes one key. An entry found already expired is counted as an
    /// expiration and reported as `KeyDoesNotExist`.
    pub fn delete(&self, key: &CacheKey, now: u64) -> Result<()> {
        match self.delete_many(std::slice::from_ref(key), now)? {
            0 => Err(CacheError::KeyDoesNotExist),
            _ => Ok(()),
        }
    }

    /// Removes keys, returning how many were live.
    pub fn delete_many(&self, keys: &[CacheKey], now: u64) -> Result<usize> {
        for key in keys {
            self.validate_key(key)?;
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        self.ensure_live()?;
        let expiry = state.expiry(now);
        let max_size = state.metadata.max_cache_size;

        let mut removed = 0;
        for key in keys {
            let Some(value) = state.entries.remove(key) else {
                continue;
            };
            self.stats.shrink(entry_size(key, value.len()), max_size);
            if expiry.is_expired(&value) {
                self.stats.record_removal(RemovalCause::Expired);
                state.watchers.publish(&self.key, key, None, EventType::Expire);
            } else {
                self.stats.record_removal(RemovalCause::Deleted);
                state.watchers.publish(&self.key, key, None, EventType::Delete);
                removed += 1;
            }
        }
        Ok(removed)
    }

    // == Expire ==
    /// Removes the given keys that are expired at `now`; live keys are left
    /// alone. Returns how many were removed.
    pub fn expire(&self, keys: &[CacheKey], now: u64) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let expiry = state.expiry(now);
        if expiry.interval_ms == 0 {
            return 0;
        }
        let max_size = state.metadata.max_cache_size;

        let mut removed = 0;
        for key in keys {
            if !state.entries.get(key).is_some_and(|v| expiry.is_expired(v)) {
                continue;
            }
            if let Some(value) = state.entries.remove(key) {
                self.stats.shrink(entry_size(key, value.len()), max_size);
                self.stats.record_removal(RemovalCause::Expired);
                state.watchers.publish(&self.key, key, None, EventType::Expire);
                removed += 1;
            }
        }
        removed
    }

    // == Evict ==
    /// Removes up to `count` entries chosen by the eviction policy, stopping
    /// as soon as usage is under budget.
    pub fn evict(&self, count: usize, now: u64) -> usize {
        self.evict_with_goal(count, now, EvictionGoal::BelowLimit)
    }

    pub fn evict_with_goal(&self, count: usize, now: u64, goal: EvictionGoal) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let max_size = state.metadata.max_cache_size;
        if count == 0 || !self.over_target(max_size, goal) {
            return 0;
        }

        let expiry = state.expiry(now);
        let candidates = state
            .eviction
            .select_candidates(&state.entries, count, expiry, &self.pool);

        let mut removed = 0;
        for candidate in candidates {
            if removed >= count || !self.over_target(max_size, goal) {
                break;
            }
            let Some(value) = state.entries.remove(&candidate.key) else {
                continue;
            };
            self.stats
                .shrink(entry_size(&candidate.key, value.len()), max_size);
            let event = if expiry.is_expired(&value) {
                self.stats.record_removal(RemovalCause::Expired);
                EventType::Expire
            } else {
                self.stats.record_removal(RemovalCause::Evicted);
                EventType::Evict
            };
            state.watchers.publish(&self.key, &candidate.key, None, event);
            removed += 1;
        }
        removed
    }

    /// Whether usage is at or over the budget this partition draws from.
    pub fn is_over_budget(&self) -> bool {
        self.over_target(self.max_cache_size(), EvictionGoal::BelowLimit)
    }

    fn over_target(&self, max_size: u64, goal: EvictionGoal) -> bool {
        let (used, limit) = if max_size > 0 {
            (self.stats.total_size(), max_size)
        } else {
            let global = self.stats.global();
            (global.unreserved_size(), global.unreserved_budget())
        };
        match goal {
            EvictionGoal::BelowLimit => used > 0 && used >= limit,
            EvictionGoal::Room(bytes) => used.saturating_add(bytes) > limit,
        }
    }

    // == Increment ==
    /// Adds `delta` to an integer value and returns the result.
    ///
    /// Absent or expired keys are created holding `delta`.
    pub fn try_increment(&self, key: &CacheKey, delta: i64, now: u64) -> Result<i64> {
        match self.increment_inner(key, delta, now)? {
            Admission::Done(value) => Ok(value),
            Admission::NeedsRoom(bytes) => Err(self.insufficient(bytes)),
        }
    }

    pub(crate) fn increment_inner(
        &self,
        key: &CacheKey,
        delta: i64,
        now: u64,
    ) -> Result<Admission<i64>> {
        self.validate_key(key)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        self.ensure_live()?;
        let expiry = state.expiry(now);
        let absolute = state.metadata.is_absolute();
        let max_size = state.metadata.max_cache_size;

        if let Some(value) = state.entries.get_mut(key) {
            if !expiry.is_expired(value) {
                let updated = value.increment(delta)?;
                if !absolute {
                    value.touch(now);
                }
                let payload = value.payload().clone();
                self.stats.record_hit(now);
                state
                    .watchers
                    .publish(&self.key, key, Some(&payload), EventType::Write);
                return Ok(Admission::Done(updated));
            }
        }

        if let Some(stale) = state.entries.remove(key) {
            self.stats.shrink(entry_size(key, stale.len()), max_size);
            self.stats.record_removal(RemovalCause::Expired);
            state.watchers.publish(&self.key, key, None, EventType::Expire);
        }

        let value = CacheValue::from_i64(delta, now);
        let size = entry_size(key, value.len());
        if !self.stats.try_grow(size, max_size) {
            return Ok(Admission::NeedsRoom(size));
        }
        let payload = value.payload().clone();
        state.entries.insert(key.clone(), value);
        self.stats.record_miss();
        self.stats.record_insert();
        state
            .watchers
            .publish(&self.key, key, Some(&payload), EventType::Write);
        Ok(Admission::Done(delta))
    }

    // == Flush ==
    /// Drops every entry, firing a Delete event per key, and resets the
    /// activity counters. Metadata is kept.
    pub fn flush(&self) -> usize {
        let mut guard = self.state.write();
        self.clear_locked(&mut guard)
    }

    /// Flushes and marks the partition dead so writers still holding a
    /// handle are refused.
    pub(crate) fn retire(&self) -> usize {
        let mut guard = self.state.write();
        self.deleted.store(true, Ordering::Release);
        self.clear_locked(&mut guard)
    }

    fn clear_locked(&self, state: &mut PartitionState) -> usize {
        let entries = std::mem::take(&mut state.entries);
        let max_size = state.metadata.max_cache_size;
        let mut bytes = 0u64;
        for (key, value) in &entries {
            bytes += entry_size(key, value.len());
            self.stats.record_removal(RemovalCause::Deleted);
            state.watchers.publish(&self.key, key, None, EventType::Delete);
        }
        self.stats.shrink(bytes, max_size);
        self.stats.reset_counters();
        entries.len()
    }

    // == Reconfigure ==
    /// Applies new metadata in place, swapping the eviction policy if it
    /// changed and moving usage between the shared and reserved pools.
    /// Returns the previous metadata.
    pub(crate) fn apply_metadata(&self, metadata: &PartitionMetadata) -> PartitionMetadata {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let previous = state.metadata.clone();

        self.stats
            .convert(previous.max_cache_size, metadata.max_cache_size);
        if previous.eviction_policy != metadata.eviction_policy {
            state.eviction = policy_for(metadata.eviction_policy, self.limits.key_eviction_samples);
        }
        state.metadata.apply(metadata);

        self.max_cache_size
            .store(metadata.max_cache_size, Ordering::Release);
        self.evicts.store(
            metadata.eviction_policy != EvictionPolicyKind::NoEviction,
            Ordering::Release,
        );
        previous
    }

    // == Expiration Sampling ==
    /// Samples `samples` random positions and returns the keys there that
    /// are expired. Index generation happens before the read lock is taken.
    pub fn sample_expired(&self, samples: usize, now: u64) -> Vec<CacheKey> {
        let len = self.stats.item_count() as usize;
        if len == 0 || samples == 0 {
            return Vec::new();
        }
        let mut indices = self.pool.rent(samples.min(len));
        fill_sorted_sample(&mut indices, samples, len);

        let state = self.state.read();
        let expiry = state.expiry(now);
        if expiry.interval_ms == 0 {
            return Vec::new();
        }
        collect_sampled(&state.entries, &indices, expiry, |sampled, expired| {
            sampled && expired
        })
        .into_iter()
        .map(|c| c.key)
        .collect()
    }

    pub fn expiration_interval_ms(&self) -> u64 {
        self.state.read().metadata.expiration_interval_ms
    }

    // == Scan ==
    /// Lists live keys matching `pattern` in key order.
    pub fn scan_keys(&self, pattern: &GlobPattern, count: usize, offset: usize, now: u64) -> KeyScan {
        let state = self.state.read();
        let expiry = state.expiry(now);
        let mut matching = state
            .entries
            .iter()
            .filter(|(key, value)| !expiry.is_expired(value) && pattern.matches(key.as_bytes()))
            .map(|(key, _)| key)
            .skip(offset);

        let keys: Vec<CacheKey> = matching.by_ref().take(count).cloned().collect();
        let next_offset = matching.next().map(|_| offset + keys.len());
        KeyScan { keys, next_offset }
    }

    // == Watch Predicates ==
    /// Attaches a predicate. Returns true if it was new rather than a
    /// replacement.
    pub fn add_watch(&self, predicate: WatchPredicate) -> Result<bool> {
        let mut state = self.state.write();
        self.ensure_live()?;
        Ok(state.watchers.add(predicate))
    }

    pub fn remove_watch(&self, owner_id: u64, watch_id: u64) -> bool {
        self.state.write().watchers.remove(owner_id, watch_id)
    }

    pub fn remove_watches_of(&self, owner_id: u64) -> usize {
        self.state.write().watchers.remove_owner(owner_id)
    }

    /// Drops predicates whose subscriber has gone away, then returns how
    /// many remain.
    pub fn prune_watches(&self) -> usize {
        let mut state = self.state.write();
        state.watchers.prune_closed();
        state.watchers.len()
    }

    pub fn watch_count(&self) -> usize {
        self.state.read().watchers.len()
    }

    // == Validation ==
    fn validate_key(&self, key: &CacheKey) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::MissingKey);
        }
        if key.len() > self.limits.max_key_size {
            return Err(CacheError::KeyTooLarge {
                size: key.len(),
                max: self.limits.max_key_size,
            });
        }
        Ok(())
    }

    fn validate_value(&self, value: &Bytes) -> Result<()> {
        if value.is_empty() {
            return Err(CacheError::MissingValue);
        }
        if value.len() > self.limits.max_value_size {
            return Err(CacheError::ValueTooLarge {
                size: value.len(),
                max: self.limits.max_value_size,
            });
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            Err(CacheError::PartitionDoesNotExist)
        } else {
            Ok(())
        }
    }

    fn insufficient(&self, bytes: u64) -> CacheError {
        CacheError::InsufficientCapacity(format!(
            "partition {} cannot admit {} more bytes",
            self.key, bytes
        ))
    }
}

/// Bytes an entry counts against its budget.
pub(crate) fn entry_size(key: &CacheKey, value_len: usize) -> u64 {
    (key.len() + value_len) as u64
}
