//! Cache Module
//!
//! Partitioned in-memory storage with capacity budgets, sliding or absolute
//! expiration and sampled LRU eviction.

mod compaction;
mod eviction;
mod expiration;
mod key;
mod memory;
mod metadata;
mod partition;
mod pattern;
mod pool;
mod stats;
mod store;
mod value;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use compaction::{
    compact, CompactionQueue, CompactionReceiver, CompactionReport, CompactionTrigger,
};
pub use eviction::{
    policy_for, ApproximateLru, EvictionCandidate, EvictionPolicy, ExpiryCheck, NoEviction,
};
pub use expiration::{ExpirationScanner, ScanReport, ScanStop};
pub use key::CacheKey;
pub use memory::{FixedMemory, HostMemory, SystemMemory};
pub use metadata::{EvictionPolicyKind, ExpirationMode, PartitionMetadata};
pub use partition::{EvictionGoal, KeyScan, Partition, PartitionLimits, PutMode};
pub use pattern::GlobPattern;
pub use pool::ScratchPool;
pub use stats::{PartitionStatistics, PartitionStats, RemovalCause, RuntimeStatistics, RuntimeStats};
pub use store::{CacheStore, CacheStoreBuilder};
pub use value::{current_timestamp_ms, CacheValue};
