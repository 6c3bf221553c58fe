//! Configuration Module
//!
//! Handles loading and managing engine configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// == Defaults ==
const DEFAULT_MAX_CACHE_SIZE: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_KEY_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_KEY_EVICTION_SAMPLES: usize = 5;
const DEFAULT_KEY_EXPIRATION_SAMPLES: usize = 20;
const DEFAULT_PARTITION_EVICTION_SAMPLES: usize = 5;
const DEFAULT_EXPIRATION_SCAN_INTERVAL_MS: u64 = 1000;
const DEFAULT_EXPIRATION_SCAN_BUDGET_MS: u64 = 25;

/// Engine configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Global byte budget shared by all partitions
    pub max_cache_size: u64,
    /// Largest accepted key in bytes
    pub max_key_size: usize,
    /// Largest accepted value in bytes
    pub max_value_size: usize,
    /// Sampled entries per requested eviction
    pub key_eviction_samples: usize,
    /// Sampled entries per expiration scan round
    pub key_expiration_samples: usize,
    /// Partitions inspected when picking a cross-partition eviction victim
    pub partition_eviction_samples: usize,
    /// Interval between background expiration scans in milliseconds
    pub expiration_scan_interval_ms: u64,
    /// Wall-clock budget of a single expiration scan in milliseconds
    pub expiration_scan_budget_ms: u64,
    /// Directory for persisted partition metadata, None disables persistence
    pub metadata_dir: Option<PathBuf>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_CACHE_SIZE` - Global budget in bytes (default: 1 GiB)
    /// - `MAX_KEY_SIZE` - Maximum key size (default: 64 KiB)
    /// - `MAX_VALUE_SIZE` - Maximum value size (default: 16 MiB)
    /// - `KEY_EVICTION_SAMPLES` - Samples per evicted key (default: 5)
    /// - `KEY_EXPIRATION_SAMPLES` - Samples per expiration round (default: 20)
    /// - `PARTITION_EVICTION_SAMPLES` - Partitions per victim search (default: 5)
    /// - `EXPIRATION_SCAN_INTERVAL_MS` - Scan frequency (default: 1000)
    /// - `EXPIRATION_SCAN_BUDGET_MS` - Scan time budget (default: 25)
    /// - `METADATA_DIR` - Metadata directory (default: unset)
    pub fn from_env() -> Self {
        Self {
            max_cache_size: env_or("MAX_CACHE_SIZE", DEFAULT_MAX_CACHE_SIZE),
            max_key_size: env_or("MAX_KEY_SIZE", DEFAULT_MAX_KEY_SIZE),
            max_value_size: env_or("MAX_VALUE_SIZE", DEFAULT_MAX_VALUE_SIZE),
            key_eviction_samples: env_or("KEY_EVICTION_SAMPLES", DEFAULT_KEY_EVICTION_SAMPLES),
            key_expiration_samples: env_or(
                "KEY_EXPIRATION_SAMPLES",
                DEFAULT_KEY_EXPIRATION_SAMPLES,
            ),
            partition_eviction_samples: env_or(
                "PARTITION_EVICTION_SAMPLES",
                DEFAULT_PARTITION_EVICTION_SAMPLES,
            ),
            expiration_scan_interval_ms: env_or(
                "EXPIRATION_SCAN_INTERVAL_MS",
                DEFAULT_EXPIRATION_SCAN_INTERVAL_MS,
            ),
            expiration_scan_budget_ms: env_or(
                "EXPIRATION_SCAN_BUDGET_MS",
                DEFAULT_EXPIRATION_SCAN_BUDGET_MS,
            ),
            metadata_dir: env::var("METADATA_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Interval between background expiration scans.
    pub fn expiration_scan_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_scan_interval_ms)
    }

    /// Time budget of one expiration scan.
    pub fn expiration_scan_budget(&self) -> Duration {
        Duration::from_millis(self.expiration_scan_budget_ms)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            key_eviction_samples: DEFAULT_KEY_EVICTION_SAMPLES,
            key_expiration_samples: DEFAULT_KEY_EXPIRATION_SAMPLES,
            partition_eviction_samples: DEFAULT_PARTITION_EVICTION_SAMPLES,
            expiration_scan_interval_ms: DEFAULT_EXPIRATION_SCAN_INTERVAL_MS,
            expiration_scan_budget_ms: DEFAULT_EXPIRATION_SCAN_BUDGET_MS,
            metadata_dir: None,
        }
    }
}
