//! Cache Store Module
//!
//! The partition table and the inbound operation surface: implicit partition
//! creation, admission with cross-partition eviction, partition
//! reconfiguration and the watch entry points.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::compaction::{compact, CompactionReport, CompactionTrigger};
use crate::cache::memory::{HostMemory, SystemMemory};
use crate::cache::metadata::PartitionMetadata;
use crate::cache::partition::{
    Admission, EvictionGoal, KeyScan, Partition, PartitionLimits, PutMode,
};
use crate::cache::pattern::GlobPattern;
use crate::cache::pool::ScratchPool;
use crate::cache::stats::{PartitionStatistics, PartitionStats, RuntimeStatistics, RuntimeStats};
use crate::cache::CacheKey;
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::persistence::{
    validate_partition_key, FileMetadataStore, MetadataStore, NullMetadataStore,
};
use crate::watch::{EventFilter, WatchPredicate, WatchReceiver, WatcherChannel};

/// Eviction rounds a single write may trigger before giving up.
const MAX_ADMISSION_ATTEMPTS: usize = 16;

/// Upper bound on entries evicted to admit one write.
const MAX_EVICTIONS_PER_ADMISSION: u64 = 1024;

// == Builder ==
/// Assembles a `CacheStore` with its collaborators.
#[derive(Debug)]
pub struct CacheStoreBuilder {
    config: Config,
    persistence: Option<Arc<dyn MetadataStore>>,
    host_memory: Option<Arc<dyn HostMemory>>,
    compaction: Option<Arc<dyn CompactionTrigger>>,
}

impl CacheStoreBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            persistence: None,
            host_memory: None,
            compaction: None,
        }
    }

    /// Overrides the metadata store. Defaults to a `FileMetadataStore` when
    /// `metadata_dir` is configured, otherwise a no-op store.
    pub fn persistence(mut self, persistence: Arc<dyn MetadataStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Overrides the host memory probe. Defaults to `SystemMemory`.
    pub fn host_memory(mut self, host_memory: Arc<dyn HostMemory>) -> Self {
        self.host_memory = Some(host_memory);
        self
    }

    pub fn compaction_trigger(mut self, trigger: Arc<dyn CompactionTrigger>) -> Self {
        self.compaction = Some(trigger);
        self
    }

    /// Builds the store.
    ///
    /// Fails with `InsufficientCapacity` when the global budget exceeds the
    /// memory the host reports as available.
    pub fn build(self) -> Result<CacheStore> {
        let host_memory = self
            .host_memory
            .unwrap_or_else(|| Arc::new(SystemMemory));
        if !host_memory.can_commit(self.config.max_cache_size) {
            return Err(CacheError::InsufficientCapacity(format!(
                "cache budget of {} bytes exceeds {:?} bytes of available host memory",
                self.config.max_cache_size,
                host_memory.available_bytes()
            )));
        }

        let configured = (self.persistence, &self.config.metadata_dir);
        let persistence: Arc<dyn MetadataStore> = match configured {
            (Some(persistence), _) => persistence,
            (None, Some(dir)) => Arc::new(FileMetadataStore::open(dir)?),
            (None, None) => Arc::new(NullMetadataStore),
        };

        Ok(CacheStore {
            stats: Arc::new(RuntimeStatistics::new(self.config.max_cache_size)),
            limits: PartitionLimits::from(&self.config),
            partitions: DashMap::new(),
            pool: Arc::new(ScratchPool::new()),
            persistence,
            host_memory,
            compaction: self.compaction,
            next_watcher_id: AtomicU64::new(1),
            config: self.config,
        })
    }
}

// == Cache Store ==
/// Partition table plus the shared statistics, scratch pool and
/// collaborators every partition uses.
#[derive(Debug)]
pub struct CacheStore {
    config: Config,
    partitions: DashMap<CacheKey, Arc<Partition>>,
    stats: Arc<RuntimeStatistics>,
    limits: PartitionLimits,
    pool: Arc<ScratchPool>,
    persistence: Arc<dyn MetadataStore>,
    host_memory: Arc<dyn HostMemory>,
    compaction: Option<Arc<dyn CompactionTrigger>>,
    next_watcher_id: AtomicU64,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store with default collaborators.
    pub fn new(config: Config) -> Result<Self> {
        CacheStoreBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> CacheStoreBuilder {
        CacheStoreBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Looks up a partition handle.
    pub fn partition(&self, key: &CacheKey) -> Option<Arc<Partition>> {
        self.partitions.get(key).map(|p| Arc::clone(p.value()))
    }

    /// Every partition, ordered by key.
    pub(crate) fn partitions_snapshot(&self) -> Vec<Arc<Partition>> {
        let mut partitions: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|p| Arc::clone(p.value()))
            .collect();
        partitions.sort_by(|a, b| a.key().cmp(b.key()));
        partitions
    }

    fn existing(&self, key: &CacheKey) -> Result<Arc<Partition>> {
        validate_partition_key(key)?;
        self.partition(key).ok_or(CacheError::PartitionDoesNotExist)
    }

    /// Returns the partition, creating it with default metadata if absent.
    /// Concurrent callers always end up with the same instance.
    fn partition_or_create(&self, key: &CacheKey) -> Result<Arc<Partition>> {
        validate_partition_key(key)?;
        if let Some(partition) = self.partition(key) {
            return Ok(partition);
        }
        let mut created = false;
        let partition = Arc::clone(
            self.partitions
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(self.new_partition(key.clone(), PartitionMetadata::new()))
                })
                .value(),
        );
        if created {
            info!(partition = %key, "Created partition implicitly");
        }
        Ok(partition)
    }

    /// Runs a write against the live partition named `key`, creating it
    /// first when `create` is set. A handle retired by a concurrent
    /// `delete_partition` is looked up again, so the write lands in the
    /// partition that replaces it.
    fn with_live_partition<T>(
        &self,
        key: &CacheKey,
        create: bool,
        mut write: impl FnMut(&Arc<Partition>) -> Result<T>,
    ) -> Result<T> {
        loop {
            let target = if create {
                self.partition_or_create(key)?
            } else {
                self.existing(key)?
            };
            match write(&target) {
                Err(CacheError::PartitionDoesNotExist) if target.is_deleted() => continue,
                result => return result,
            }
        }
    }

    fn new_partition(&self, key: CacheKey, metadata: PartitionMetadata) -> Partition {
        Partition::new(
            key,
            metadata,
            PartitionStatistics::new(Arc::clone(&self.stats)),
            self.limits,
            Arc::clone(&self.pool),
        )
    }

    // == Get ==
    /// Reads a live value. A missing partition reads as absent.
    pub fn get(&self, partition: &CacheKey, key: &CacheKey, now: u64) -> Result<Option<Bytes>> {
        validate_partition_key(partition)?;
        if key.is_empty() {
            return Err(CacheError::MissingKey);
        }
        Ok(self
            .partition(partition)
            .and_then(|p| p.get(key, now, true, true)))
    }

    /// Reads every live key among `keys`, skipping absent ones.
    pub fn get_many(
        &self,
        partition: &CacheKey,
        keys: &[CacheKey],
        now: u64,
    ) -> Result<Vec<(CacheKey, Bytes)>> {
        validate_partition_key(partition)?;
        Ok(self
            .partition(partition)
            .map(|p| p.get_many(keys, now))
            .unwrap_or_default())
    }

    // == Put ==
    pub fn put(&self, partition: &CacheKey, key: CacheKey, value: Bytes, now: u64) -> Result<()> {
        self.put_many(partition, &[(key, value)], PutMode::Upsert, now)
            .map(|_| ())
    }

    pub fn put_if_exists(
        &self,
        partition: &CacheKey,
        key: CacheKey,
        value: Bytes,
        now: u64,
    ) -> Result<()> {
        self.put_many(partition, &[(key, value)], PutMode::IfExists, now)
            .map(|_| ())
    }

    pub fn put_if_not_exists(
        &self,
        partition: &CacheKey,
        key: CacheKey,
        value: Bytes,
        now: u64,
    ) -> Result<()> {
        self.put_many(partition, &[(key, value)], PutMode::IfNotExists, now)
            .map(|_| ())
    }

    /// Writes a batch atomically with respect to validation and conditions.
    ///
    /// Creates the partition on first write, except for `IfExists` puts,
    /// which cannot succeed against a partition that does not exist yet.
    /// When the budget is exhausted, entries are evicted (possibly from a
    /// different unbounded partition) and the write is retried.
    ///
    /// # Arguments
    /// * `partition` - Target partition name
    /// * `items` - Key/value pairs; a repeated key keeps its last value
    /// * `mode` - Conditional behavior applied to every key
    /// * `now` - Access time in milliseconds
    pub fn put_many(
        &self,
        partition: &CacheKey,
        items: &[(CacheKey, Bytes)],
        mode: PutMode,
        now: u64,
    ) -> Result<usize> {
        let create = mode != PutMode::IfExists;
        self.with_live_partition(partition, create, |target| {
            self.admit(target, now, || target.write_many(items, mode, now))
        })
        .map_err(|err| match (mode, err) {
            (PutMode::IfExists, CacheError::PartitionDoesNotExist) => CacheError::KeyDoesNotExist,
            (_, err) => err,
        })
    }

    // == Delete ==
    pub fn delete(&self, partition: &CacheKey, key: &CacheKey, now: u64) -> Result<()> {
        self.existing(partition)?.delete(key, now)
    }

    /// Deletes keys, returning how many were live.
    pub fn delete_many(&self, partition: &CacheKey, keys: &[CacheKey], now: u64) -> Result<usize> {
        self.existing(partition)?.delete_many(keys, now)
    }

    // == Touch / TTL ==
    pub fn touch(&self, partition: &CacheKey, key: &CacheKey, now: u64) -> Result<()> {
        self.existing(partition)?.touch(key, now)
    }

    /// Remaining lifetime in milliseconds, None for keys that never expire.
    pub fn ttl(&self, partition: &CacheKey, key: &CacheKey, now: u64) -> Result<Option<u64>> {
        self.existing(partition)?.ttl(key, now)
    }

    // == Increment ==
    /// Adds `delta` to an 8-byte integer value, creating it if absent.
    pub fn increment(
        &self,
        partition: &CacheKey,
        key: &CacheKey,
        delta: i64,
        now: u64,
    ) -> Result<i64> {
        self.with_live_partition(partition, true, |target| {
            self.admit(target, now, || target.increment_inner(key, delta, now))
        })
    }

    pub fn decrement(
        &self,
        partition: &CacheKey,
        key: &CacheKey,
        delta: i64,
        now: u64,
    ) -> Result<i64> {
        self.increment(partition, key, delta.wrapping_neg(), now)
    }

    // == Admission ==
    fn admit<T>(
        &self,
        partition: &Arc<Partition>,
        now: u64,
        mut attempt: impl FnMut() -> Result<Admission<T>>,
    ) -> Result<T> {
        let mut needed = 0;
        for _ in 0..MAX_ADMISSION_ATTEMPTS {
            match attempt()? {
                Admission::Done(value) => return Ok(value),
                Admission::NeedsRoom(bytes) => {
                    needed = bytes;
                    if !self.make_room(partition, bytes, now) {
                        break;
                    }
                }
            }
        }
        warn!(
            partition = %partition.key(),
            bytes = needed,
            "Rejected write for insufficient capacity"
        );
        Err(CacheError::InsufficientCapacity(format!(
            "partition {} cannot admit {} more bytes",
            partition.key(),
            needed
        )))
    }

    /// Evicts enough entries to admit `bytes` into `partition`. Returns false
    /// when nothing could be freed.
    fn make_room(&self, partition: &Arc<Partition>, bytes: u64, now: u64) -> bool {
        if !partition.eviction_enabled() {
            return false;
        }
        let limit = if partition.is_bounded() {
            partition.max_cache_size()
        } else {
            self.stats.unreserved_budget()
        };
        if bytes > limit {
            return false;
        }

        let victim = self.get_eviction_candidate_partition(partition);
        let goal = EvictionGoal::Room(bytes);
        let removed = victim.evict_with_goal(eviction_count(&victim, bytes), now, goal);
        if removed > 0 {
            debug!(
                partition = %partition.key(),
                victim = %victim.key(),
                removed,
                "Evicted to admit write"
            );
            return true;
        }
        if !Arc::ptr_eq(&victim, partition) {
            return partition.evict_with_goal(eviction_count(partition, bytes), now, goal) > 0;
        }
        false
    }

    // == Eviction Candidate ==
    /// Picks the partition to evict from when `current` needs room.
    ///
    /// Bounded partitions only ever evict from themselves. For an unbounded
    /// partition, a sample of unbounded, eviction-enabled, non-empty
    /// partitions is compared by last hit time and the least recently hit
    /// one is chosen. Only lock-free counters are read.
    pub fn get_eviction_candidate_partition(&self, current: &Arc<Partition>) -> Arc<Partition> {
        if current.is_bounded() {
            return Arc::clone(current);
        }
        let samples = self.config.partition_eviction_samples.max(1);
        let mut rng = rand::thread_rng();
        self.partitions
            .iter()
            .filter(|entry| {
                let p = entry.value();
                !p.is_bounded()
                    && p.eviction_enabled()
                    && !p.is_deleted()
                    && p.stats().item_count() > 0
            })
            .choose_multiple(&mut rng, samples)
            .into_iter()
            .min_by_key(|entry| entry.value().stats().last_hit())
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::clone(current))
    }

    // == Put Partition ==
    /// Creates a partition with `metadata` or reconfigures an existing one.
    pub fn put_partition(&self, key: &CacheKey, metadata: PartitionMetadata) -> Result<()> {
        validate_partition_key(key)?;
        match self.partition(key) {
            Some(partition) => self.reconfigure(&partition, &metadata),
            None => self.create_partition(key, metadata, true),
        }
    }

    fn create_partition(
        &self,
        key: &CacheKey,
        metadata: PartitionMetadata,
        persist: bool,
    ) -> Result<()> {
        let reserve = metadata.max_cache_size;
        if reserve > 0 {
            self.check_host_memory(key, reserve)?;
            if !self.stats.try_reserve(reserve, 0) {
                return Err(self.reservation_refused(key, reserve));
            }
        }

        let partition = match self.partitions.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                // Lost a creation race; treat as a reconfiguration
                let existing = Arc::clone(occupied.get());
                drop(occupied);
                self.stats.release_reserved(reserve);
                return self.reconfigure(&existing, &metadata);
            }
            Entry::Vacant(vacant) => {
                // Metadata reaches the store before the partition is visible
                if persist && metadata.persisted {
                    if let Err(err) = self.persistence.persist(key, &metadata) {
                        self.stats.release_reserved(reserve);
                        return Err(err);
                    }
                }
                let partition = Arc::new(self.new_partition(key.clone(), metadata));
                vacant.insert(Arc::clone(&partition));
                partition
            }
        };

        let metadata = partition.metadata();
        info!(
            partition = %key,
            max_cache_size = metadata.max_cache_size,
            expiration_interval_ms = metadata.expiration_interval_ms,
            "Created partition"
        );
        Ok(())
    }

    fn reconfigure(&self, partition: &Arc<Partition>, metadata: &PartitionMetadata) -> Result<()> {
        let key = partition.key();
        let _config = partition.lock_config();
        if partition.is_deleted() {
            return Err(CacheError::PartitionDoesNotExist);
        }

        let old_max = partition.max_cache_size();
        let new_max = metadata.max_cache_size;
        if new_max > old_max {
            let growth = new_max - old_max;
            // Usage of an unbounded partition leaves the shared pool once it
            // becomes bounded
            let credit = if old_max == 0 {
                partition.stats().total_size()
            } else {
                0
            };
            self.check_host_memory(key, growth)?;
            if !self.stats.try_reserve(growth, credit) {
                return Err(self.reservation_refused(key, growth));
            }
        }

        let mut next = partition.metadata();
        let was_persisted = next.persisted;
        next.apply(metadata);
        let stored = if next.persisted {
            self.persistence.persist(key, &next)
        } else if was_persisted {
            self.persistence.delete(key)
        } else {
            Ok(())
        };
        if let Err(err) = stored {
            if new_max > old_max {
                self.stats.release_reserved(new_max - old_max);
            }
            warn!(partition = %key, error = %err, "Kept previous configuration");
            return Err(err);
        }

        partition.apply_metadata(&next);
        if new_max < old_max {
            self.stats.release_reserved(old_max - new_max);
        }

        if partition.eviction_enabled() && partition.is_over_budget() {
            match &self.compaction {
                Some(trigger) => trigger.request(key),
                None => debug!(partition = %key, "Partition over budget with no compaction scheduler"),
            }
        }

        info!(
            partition = %key,
            old_max_cache_size = old_max,
            max_cache_size = new_max,
            "Reconfigured partition"
        );
        Ok(())
    }

    fn check_host_memory(&self, key: &CacheKey, bytes: u64) -> Result<()> {
        if self.host_memory.can_commit(bytes) {
            return Ok(());
        }
        warn!(partition = %key, bytes, "Host memory cannot back partition reservation");
        Err(CacheError::InsufficientCapacity(format!(
            "host memory cannot back {} bytes for partition {}",
            bytes, key
        )))
    }

    fn reservation_refused(&self, key: &CacheKey, bytes: u64) -> CacheError {
        warn!(
            partition = %key,
            bytes,
            available = self.stats.available_capacity(),
            "Rejected partition reservation"
        );
        CacheError::InsufficientCapacity(format!(
            "cannot reserve {} bytes for partition {}, {} available",
            bytes,
            key,
            self.stats.available_capacity()
        ))
    }

    // == Delete Partition ==
    /// Removes a partition and its entries, firing Delete events.
    ///
    /// Refused with `PartitionInUse` while watch predicates are attached.
    pub fn delete_partition(&self, key: &CacheKey) -> Result<()> {
        let partition = self.existing(key)?;
        let _config = partition.lock_config();

        let watching = partition.prune_watches();
        if watching > 0 {
            return Err(CacheError::PartitionInUse(watching));
        }
        let removed = self
            .partitions
            .remove_if(key, |_, p| Arc::ptr_eq(p, &partition) && p.watch_count() == 0);
        if removed.is_none() {
            return match partition.watch_count() {
                0 => Err(CacheError::PartitionDoesNotExist),
                watching => Err(CacheError::PartitionInUse(watching)),
            };
        }

        let flushed = partition.retire();
        self.stats.release_reserved(partition.max_cache_size());
        if partition.metadata().persisted {
            self.persistence.delete(key)?;
        }
        info!(partition = %key, flushed, "Deleted partition");
        Ok(())
    }

    // == Flush ==
    /// Drops every entry of one partition, keeping its configuration.
    pub fn flush_partition(&self, key: &CacheKey) -> Result<usize> {
        let flushed = self.existing(key)?.flush();
        debug!(partition = %key, flushed, "Flushed partition");
        Ok(flushed)
    }

    pub fn flush_all(&self) -> usize {
        let flushed: usize = self
            .partitions_snapshot()
            .iter()
            .map(|p| p.flush())
            .sum();
        debug!(flushed, "Flushed all partitions");
        flushed
    }

    // == Scans ==
    /// Partition names matching `pattern`, in order, at most `count`.
    pub fn scan_partitions(&self, pattern: &GlobPattern, count: usize) -> Vec<CacheKey> {
        let mut names: Vec<CacheKey> = self
            .partitions
            .iter()
            .filter(|p| pattern.matches(p.key().as_bytes()))
            .map(|p| p.key().clone())
            .collect();
        names.sort();
        names.truncate(count);
        names
    }

    pub fn scan_keys(
        &self,
        partition: &CacheKey,
        pattern: &GlobPattern,
        count: usize,
        offset: usize,
        now: u64,
    ) -> Result<KeyScan> {
        Ok(self.existing(partition)?.scan_keys(pattern, count, offset, now))
    }

    // == Watch ==
    /// Opens a subscriber channel with a store-unique id.
    pub fn open_watcher(&self) -> (Arc<WatcherChannel>, WatchReceiver) {
        WatcherChannel::new(self.next_watcher_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Detaches every predicate routed to `channel`. Returns how many.
    pub fn close_watcher(&self, channel: &WatcherChannel) -> usize {
        let removed: usize = self
            .partitions_snapshot()
            .iter()
            .map(|p| p.remove_watches_of(channel.id()))
            .sum();
        debug!(watcher_id = channel.id(), removed, "Closed watcher");
        removed
    }

    /// Attaches a predicate to an existing partition. Re-adding the same
    /// watch id replaces the previous predicate.
    ///
    /// # Arguments
    /// * `channel` - Subscriber that receives the events
    /// * `watch_id` - Subscriber-chosen id echoed in every event
    /// * `partition` - Partition to observe
    /// * `key` - Single key to observe, or None for the whole partition
    /// * `filter` - Event types to deliver; empty delivers all
    pub fn watch(
        &self,
        channel: &Arc<WatcherChannel>,
        watch_id: u64,
        partition: &CacheKey,
        key: Option<CacheKey>,
        filter: EventFilter,
    ) -> Result<()> {
        let target = self.existing(partition)?;
        target.add_watch(WatchPredicate {
            owner: Arc::clone(channel),
            watch_id,
            partition: partition.clone(),
            key,
            filter,
        })?;
        Ok(())
    }

    /// Removes one predicate. Returns false if it was not attached.
    pub fn unwatch(
        &self,
        channel: &WatcherChannel,
        watch_id: u64,
        partition: &CacheKey,
    ) -> Result<bool> {
        Ok(self.existing(partition)?.remove_watch(channel.id(), watch_id))
    }

    // == Statistics ==
    pub fn statistics(&self) -> RuntimeStats {
        self.stats.snapshot()
    }

    pub fn partition_statistics(&self, key: &CacheKey) -> Result<PartitionStats> {
        Ok(self.existing(key)?.stats().snapshot())
    }

    pub fn partition_metadata(&self, key: &CacheKey) -> Result<PartitionMetadata> {
        Ok(self.existing(key)?.metadata())
    }

    // == Compaction ==
    /// Evicts from a partition until it fits its budget again.
    pub fn compact_partition(
        &self,
        key: &CacheKey,
        now: u64,
        cancel: &CancellationToken,
    ) -> Result<CompactionReport> {
        let partition = self.existing(key)?;
        Ok(compact(&partition, now, cancel))
    }

    // == Recovery ==
    /// Re-creates persisted partitions. Partitions that cannot be admitted
    /// are logged and skipped. Returns how many were restored.
    pub fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for (key, metadata) in self.persistence.recover()? {
            if let Err(err) = validate_partition_key(&key) {
                warn!(partition = %key, error = %err, "Skipping persisted partition");
                continue;
            }
            let result = match self.partition(&key) {
                Some(existing) => self.reconfigure(&existing, &metadata),
                None => self.create_partition(&key, metadata, false),
            };
            match result {
                Ok(()) => restored += 1,
                Err(err) => warn!(partition = %key, error = %err, "Failed to restore partition"),
            }
        }
        info!(restored, "Recovered persisted partitions");
        Ok(restored)
    }
}

/// Entries to evict from `victim` to free roughly `bytes`.
fn eviction_count(victim: &Partition, bytes: u64) -> usize {
    let stats = victim.stats();
    let average = (stats.total_size() / stats.item_count().max(1)).max(1);
    let count = (bytes / average + 1).min(MAX_EVICTIONS_PER_ADMISSION);
    count as usize
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::FixedMemory;
    use crate::cache::metadata::{EvictionPolicyKind, ExpirationMode};
    use crate::watch::EventType;

    fn store_with(max_cache_size: u64) -> CacheStore {
        let config = Config {
            max_cache_size,
            ..Config::default()
        };
        CacheStore::builder(config)
            .host_memory(Arc::new(FixedMemory(None)))
            .build()
            .unwrap()
    }

    fn store() -> CacheStore {
        store_with(1 << 20)
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::from(k)
    }

    fn value(v: &str) -> Bytes {
        Bytes::copy_from_slice(v.as_bytes())
    }

    #[test]
    fn test_build_rejects_budget_over_host_memory() {
        let result = CacheStore::builder(Config::default())
            .host_memory(Arc::new(FixedMemory(Some(1024))))
            .build();
        assert!(matches!(result, Err(CacheError::InsufficientCapacity(_))));
    }

    #[test]
    fn test_put_creates_partition_implicitly() {
        let store = store();
        store.put(&key("p"), key("k"), value("v"), 0).unwrap();

        assert_eq!(store.partition_count(), 1);
        assert_eq!(store.get(&key("p"), &key("k"), 1).unwrap().unwrap(), "v");
        assert_eq!(store.partition_metadata(&key("p")).unwrap().max_cache_size, 0);
    }

    #[test]
    fn test_get_on_missing_partition_is_absent() {
        let store = store();
        assert!(store.get(&key("nope"), &key("k"), 0).unwrap().is_none());
        assert_eq!(store.partition_count(), 0);
    }

    #[test]
    fn test_partition_key_validation() {
        let store = store();
        assert!(matches!(
            store.put(&key(""), key("k"), value("v"), 0),
            Err(CacheError::MissingPartitionKey)
        ));
        assert!(matches!(
            store.put(&key("a/b"), key("k"), value("v"), 0),
            Err(CacheError::InvalidPartitionKey(_))
        ));
    }

    #[test]
    fn test_put_if_exists_on_missing_partition() {
        let store = store();
        assert!(matches!(
            store.put_if_exists(&key("p"), key("k"), value("v"), 0),
            Err(CacheError::KeyDoesNotExist)
        ));
        assert_eq!(store.partition_count(), 0);
    }

    #[test]
    fn test_operations_on_missing_partition() {
        let store = store();
        assert!(matches!(
            store.delete(&key("p"), &key("k"), 0),
            Err(CacheError::PartitionDoesNotExist)
        ));
        assert!(matches!(
            store.touch(&key("p"), &key("k"), 0),
            Err(CacheError::PartitionDoesNotExist)
        ));
        assert!(matches!(
            store.delete_partition(&key("p")),
            Err(CacheError::PartitionDoesNotExist)
        ));
    }

    #[test]
    fn test_put_partition_reserves_capacity() {
        let store = store_with(1_000);
        store
            .put_partition(&key("a"), PartitionMetadata::new().with_max_cache_size(600))
            .unwrap();

        assert_eq!(store.statistics().reserved_size, 600);
        let result = store.put_partition(&key("b"), PartitionMetadata::new().with_max_cache_size(500));
        assert!(matches!(result, Err(CacheError::InsufficientCapacity(_))));
        assert!(store.partition(&key("b")).is_none());
    }

    #[test]
    fn test_put_partition_rejects_host_memory_shortfall() {
        let config = Config {
            max_cache_size: 1_000,
            ..Config::default()
        };
        let store = CacheStore::builder(config)
            .host_memory(Arc::new(FixedMemory(Some(1_000))))
            .build()
            .unwrap();
        let result = store.put_partition(&key("a"), PartitionMetadata::new().with_max_cache_size(2_000));
        assert!(matches!(result, Err(CacheError::InsufficientCapacity(_))));
    }

    #[test]
    fn test_reconfigure_adjusts_reservation() {
        let store = store_with(1_000);
        let p = key("p");
        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(300))
            .unwrap();
        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(700))
            .unwrap();
        assert_eq!(store.statistics().reserved_size, 700);

        let result = store.put_partition(&p, PartitionMetadata::new().with_max_cache_size(1_200));
        assert!(matches!(result, Err(CacheError::InsufficientCapacity(_))));
        assert_eq!(store.statistics().reserved_size, 700);

        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(100))
            .unwrap();
        assert_eq!(store.statistics().reserved_size, 100);
    }

    #[test]
    fn test_reconfigure_keeps_create_date() {
        let store = store();
        let p = key("p");
        store.put_partition(&p, PartitionMetadata::new()).unwrap();
        let created = store.partition_metadata(&p).unwrap().create_date();

        store
            .put_partition(
                &p,
                PartitionMetadata::new().with_expiration(500, ExpirationMode::Absolute),
            )
            .unwrap();
        let metadata = store.partition_metadata(&p).unwrap();
        assert_eq!(metadata.create_date(), created);
        assert_eq!(metadata.expiration_interval_ms, 500);
    }

    #[test]
    fn test_bounded_partition_evicts_itself() {
        let store = store();
        let p = key("p");
        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(100))
            .unwrap();
        for i in 0..20 {
            store
                .put(&p, key(&format!("key{:02}", i)), value("0123456789"), i)
                .unwrap();
        }

        let stats = store.partition_statistics(&p).unwrap();
        assert!(stats.total_size <= 100);
        assert!(stats.evictions > 0);
        assert!(store.get(&p, &key("key19"), 100).unwrap().is_some());
    }

    #[test]
    fn test_no_eviction_partition_reports_insufficient_capacity() {
        let store = store();
        let p = key("p");
        store
            .put_partition(
                &p,
                PartitionMetadata::new()
                    .with_max_cache_size(20)
                    .with_eviction_policy(EvictionPolicyKind::NoEviction),
            )
            .unwrap();
        store.put(&p, key("a"), value("0123456789"), 0).unwrap();

        let result = store.put(&p, key("b"), value("0123456789"), 1);
        assert!(matches!(result, Err(CacheError::InsufficientCapacity(_))));
        assert!(store.get(&p, &key("a"), 2).unwrap().is_some());
    }

    #[test]
    fn test_unbounded_write_evicts_least_recently_hit_partition() {
        let store = store_with(200);
        let cold = key("cold");
        let hot = key("hot");
        for i in 0..5 {
            store.put(&cold, key(&format!("c{}", i)), value("0123456789"), i).unwrap();
        }
        for i in 0..5 {
            store.put(&hot, key(&format!("h{}", i)), value("0123456789"), 10 + i).unwrap();
        }
        store.get(&hot, &key("h0"), 50).unwrap();

        // 10 entries of 12 bytes used; 8 more entries need 96 bytes
        for i in 5..13 {
            store.put(&hot, key(&format!("h{}", i)), value("0123456789"), 60 + i).unwrap();
        }

        let stats = store.statistics();
        assert!(stats.total_size <= 200);
        assert!(store.partition_statistics(&cold).unwrap().evictions > 0);
    }

    #[test]
    fn test_increment_and_decrement() {
        let store = store();
        let p = key("p");
        assert_eq!(store.increment(&p, &key("n"), 10, 0).unwrap(), 10);
        assert_eq!(store.decrement(&p, &key("n"), 3, 1).unwrap(), 7);

        store.put(&p, key("s"), value("abcd"), 2).unwrap();
        assert!(matches!(
            store.increment(&p, &key("s"), 1, 3),
            Err(CacheError::InvalidTypeOperation(4))
        ));
    }

    #[test]
    fn test_delete_partition_blocked_by_watch() {
        let store = store();
        let p = key("p");
        store.put(&p, key("k"), value("v"), 0).unwrap();
        let (channel, _rx) = store.open_watcher();
        store.watch(&channel, 1, &p, None, EventFilter::empty()).unwrap();

        assert!(matches!(
            store.delete_partition(&p),
            Err(CacheError::PartitionInUse(1))
        ));
        assert!(store.unwatch(&channel, 1, &p).unwrap());
        store.delete_partition(&p).unwrap();

        assert!(store.get(&p, &key("k"), 1).unwrap().is_none());
        assert_eq!(store.statistics().total_size, 0);
        assert_eq!(store.statistics().item_count, 0);
    }

    #[test]
    fn test_delete_partition_prunes_dropped_watchers() {
        let store = store();
        let p = key("p");
        store.put_partition(&p, PartitionMetadata::new()).unwrap();
        let (channel, rx) = store.open_watcher();
        store.watch(&channel, 1, &p, None, EventFilter::empty()).unwrap();
        drop(rx);

        store.delete_partition(&p).unwrap();
        assert!(store.partition(&p).is_none());
    }

    #[test]
    fn test_delete_partition_releases_reservation() {
        let store = store_with(1_000);
        let p = key("p");
        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(800))
            .unwrap();
        store.delete_partition(&p).unwrap();
        assert_eq!(store.statistics().reserved_size, 0);
        assert_eq!(store.statistics().available_capacity, 1_000);
    }

    #[test]
    fn test_watch_receives_write_and_delete() {
        let store = store();
        let p = key("p");
        store.put_partition(&p, PartitionMetadata::new()).unwrap();
        let (channel, mut rx) = store.open_watcher();
        store
            .watch(&channel, 9, &p, Some(key("k")), EventFilter::empty())
            .unwrap();

        store.put(&p, key("k"), value("v"), 0).unwrap();
        store.put(&p, key("other"), value("v"), 0).unwrap();
        store.delete(&p, &key("k"), 1).unwrap();

        let write = rx.try_recv().unwrap();
        assert_eq!((write.watch_id, write.event_type), (9, EventType::Write));
        assert_eq!(write.value, Some(value("v")));
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::Delete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_watch_on_missing_partition() {
        let store = store();
        let (channel, _rx) = store.open_watcher();
        let result = store.watch(&channel, 1, &key("p"), None, EventFilter::empty());
        assert!(matches!(result, Err(CacheError::PartitionDoesNotExist)));
    }

    #[test]
    fn test_close_watcher_detaches_everywhere() {
        let store = store();
        for name in ["a", "b"] {
            store.put_partition(&key(name), PartitionMetadata::new()).unwrap();
        }
        let (channel, _rx) = store.open_watcher();
        store.watch(&channel, 1, &key("a"), None, EventFilter::empty()).unwrap();
        store.watch(&channel, 2, &key("b"), None, EventFilter::WRITE).unwrap();

        assert_eq!(store.close_watcher(&channel), 2);
        assert_eq!(channel.predicate_count(), 0);
        store.delete_partition(&key("a")).unwrap();
    }

    #[test]
    fn test_scan_partitions() {
        let store = store();
        for name in ["users-eu", "users-us", "orders"] {
            store.put_partition(&key(name), PartitionMetadata::new()).unwrap();
        }
        let pattern = GlobPattern::new("users-*");
        assert_eq!(
            store.scan_partitions(&pattern, 10),
            vec![key("users-eu"), key("users-us")]
        );
        assert_eq!(store.scan_partitions(&GlobPattern::any(), 1), vec![key("orders")]);
    }

    #[test]
    fn test_flush_all_keeps_partitions() {
        let store = store();
        store.put(&key("a"), key("k"), value("v"), 0).unwrap();
        store.put(&key("b"), key("k"), value("v"), 0).unwrap();

        assert_eq!(store.flush_all(), 2);
        assert_eq!(store.partition_count(), 2);
        assert_eq!(store.statistics().total_size, 0);
    }

    #[test]
    fn test_shrinking_partition_requests_compaction() {
        let (queue, mut receiver) = crate::cache::CompactionQueue::new();
        let store = CacheStore::builder(Config {
            max_cache_size: 1 << 20,
            ..Config::default()
        })
        .host_memory(Arc::new(FixedMemory(None)))
        .compaction_trigger(queue)
        .build()
        .unwrap();
        let p = key("p");
        for i in 0..10 {
            store.put(&p, key(&format!("k{}", i)), value("0123456789"), i).unwrap();
        }

        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(50))
            .unwrap();
        assert_eq!(receiver.try_recv().unwrap(), p);

        let report = store.compact_partition(&p, 100, &CancellationToken::new()).unwrap();
        assert!(store.partition_statistics(&p).unwrap().total_size < 50);
        assert_eq!(report.evicted, report.items_before - report.items_after);
    }

    #[test]
    fn test_get_many_and_delete_many() {
        let store = store();
        let p = key("p");
        let items = vec![(key("a"), value("1")), (key("b"), value("2")), (key("c"), value("3"))];
        store.put_many(&p, &items, PutMode::Upsert, 0).unwrap();

        let found = store.get_many(&p, &[key("c"), key("x"), key("a")], 1).unwrap();
        assert_eq!(found, vec![(key("c"), value("3")), (key("a"), value("1"))]);
        assert!(store.get_many(&key("nope"), &[key("a")], 1).unwrap().is_empty());

        assert_eq!(store.delete_many(&p, &[key("a"), key("x"), key("b")], 2).unwrap(), 2);
        assert_eq!(store.partition_statistics(&p).unwrap().item_count, 1);
        assert!(matches!(
            store.delete_many(&key("nope"), &[key("a")], 2),
            Err(CacheError::PartitionDoesNotExist)
        ));
    }

    #[test]
    fn test_writes_survive_concurrent_partition_deletion() {
        let store = store_with(1 << 24);
        let p = key("p");
        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    let _ = store.delete_partition(&p);
                }
            });

            for i in 0..20_000u64 {
                let written = store.put(&p, key(&format!("k{}", i % 64)), value("v"), i);
                assert!(written.is_ok(), "put {} failed: {:?}", i, written);
                let counted = store.increment(&p, &key("counter"), 1, i);
                assert!(counted.is_ok(), "increment {} failed: {:?}", i, counted);
            }
            stop.store(true, Ordering::Relaxed);
        });

        let live: u64 = store.partitions_snapshot().iter().map(|p| p.stats().total_size()).sum();
        assert_eq!(live, store.statistics().total_size);
    }

    #[derive(Debug)]
    struct ReadOnlyMetadataStore;

    impl MetadataStore for ReadOnlyMetadataStore {
        fn persist(&self, _partition: &CacheKey, _metadata: &PartitionMetadata) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }

        fn delete(&self, _partition: &CacheKey) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }

        fn recover(&self) -> Result<Vec<(CacheKey, PartitionMetadata)>> {
            Ok(Vec::new())
        }
    }

    fn read_only_store() -> CacheStore {
        CacheStore::builder(Config {
            max_cache_size: 1_000,
            ..Config::default()
        })
        .host_memory(Arc::new(FixedMemory(None)))
        .persistence(Arc::new(ReadOnlyMetadataStore))
        .build()
        .unwrap()
    }

    #[test]
    fn test_failed_persist_keeps_previous_configuration() {
        let store = read_only_store();
        let p = key("p");
        store
            .put_partition(&p, PartitionMetadata::new().with_max_cache_size(300))
            .unwrap();

        let result = store.put_partition(
            &p,
            PartitionMetadata::new()
                .with_max_cache_size(600)
                .with_persisted(true),
        );
        assert!(matches!(result, Err(CacheError::Persistence(_))));

        let metadata = store.partition_metadata(&p).unwrap();
        assert_eq!(metadata.max_cache_size, 300);
        assert!(!metadata.persisted);
        assert_eq!(store.statistics().reserved_size, 300);
    }

    #[test]
    fn test_failed_persist_does_not_create_partition() {
        let store = read_only_store();
        let result = store.put_partition(
            &key("p"),
            PartitionMetadata::new()
                .with_max_cache_size(200)
                .with_persisted(true),
        );
        assert!(matches!(result, Err(CacheError::Persistence(_))));
        assert_eq!(store.partition_count(), 0);
        assert_eq!(store.statistics().reserved_size, 0);
    }
}
