//! Partition Cache - A partitioned in-memory cache engine
//!
//! Named partitions with their own byte budgets, sliding or absolute
//! expiration, approximate LRU eviction and per-key change notification.

pub mod cache;
pub mod config;
pub mod error;
pub mod persistence;
pub mod tasks;
pub mod watch;

pub use cache::{CacheKey, CacheStore, CacheStoreBuilder, PartitionMetadata};
pub use config::Config;
pub use error::{CacheError, Result, ResultCode};
pub use tasks::{spawn_compaction_task, spawn_expiration_task};
