//! Partition Metadata Module
//!
//! Per-partition configuration: expiration rule, eviction policy and
//! capacity reservation. This is the only state ever persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the expiration countdown behaves on access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExpirationMode {
    /// Every access restarts the countdown
    #[default]
    Sliding,
    /// Expires a fixed interval after creation regardless of access
    Absolute,
}

/// Which eviction policy a partition runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicyKind {
    /// Writes over budget fail with `InsufficientCapacity`
    NoEviction,
    /// Sampling-based approximate LRU
    #[default]
    ApproximateLru,
}

// == Partition Metadata ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    /// Creation time, fixed for the partition's lifetime
    create_date: DateTime<Utc>,
    /// Expiration interval in milliseconds, 0 = never
    pub expiration_interval_ms: u64,
    pub expiration_mode: ExpirationMode,
    pub eviction_policy: EvictionPolicyKind,
    /// Reserved byte budget, 0 = unbounded (draws from the global budget)
    pub max_cache_size: u64,
    /// Whether this metadata is written to the metadata store
    pub persisted: bool,
}

impl PartitionMetadata {
    /// Default metadata used for implicitly created partitions.
    pub fn new() -> Self {
        Self {
            create_date: Utc::now(),
            expiration_interval_ms: 0,
            expiration_mode: ExpirationMode::Sliding,
            eviction_policy: EvictionPolicyKind::ApproximateLru,
            max_cache_size: 0,
            persisted: false,
        }
    }

    pub fn with_expiration(mut self, interval_ms: u64, mode: ExpirationMode) -> Self {
        self.expiration_interval_ms = interval_ms;
        self.expiration_mode = mode;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicyKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn create_date(&self) -> DateTime<Utc> {
        self.create_date
    }

    pub fn is_bounded(&self) -> bool {
        self.max_cache_size > 0
    }

    pub fn expires(&self) -> bool {
        self.expiration_interval_ms > 0
    }

    pub fn is_absolute(&self) -> bool {
        self.expiration_mode == ExpirationMode::Absolute
    }

    /// Copies every mutable field from `other`, keeping the create date.
    pub fn apply(&mut self, other: &PartitionMetadata) {
        self.expiration_interval_ms = other.expiration_interval_ms;
        self.expiration_mode = other.expiration_mode;
        self.eviction_policy = other.eviction_policy;
        self.max_cache_size = other.max_cache_size;
        self.persisted = other.persisted;
    }
}

impl Default for PartitionMetadata {
    fn default() -> Self {
        Self::new()
    }
}
