//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the engine's invariants over generated inputs and
//! random operation sequences.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::cache::{
    CacheKey, CacheStore, EvictionPolicyKind, ExpirationMode, ExpirationScanner, FixedMemory,
    PartitionMetadata, PutMode,
};
use crate::config::Config;
use crate::error::CacheError;

// == Test Configuration ==
const TEST_MAX_CACHE_SIZE: u64 = 2048;
const BOUNDED_PARTITION_SIZE: u64 = 512;
const EXPIRATION_INTERVAL_MS: u64 = 50;

const PARTITIONS: [&str; 3] = ["bounded", "shared", "expiring"];

fn test_store(max_cache_size: u64) -> CacheStore {
    CacheStore::builder(Config {
        max_cache_size,
        ..Config::default()
    })
    .host_memory(Arc::new(FixedMemory(None)))
    .build()
    .unwrap()
}

/// Store with one bounded, one shared and one expiring partition.
fn mixed_store() -> CacheStore {
    let store = test_store(TEST_MAX_CACHE_SIZE);
    store
        .put_partition(
            &CacheKey::from(PARTITIONS[0]),
            PartitionMetadata::new().with_max_cache_size(BOUNDED_PARTITION_SIZE),
        )
        .unwrap();
    store
        .put_partition(&CacheKey::from(PARTITIONS[1]), PartitionMetadata::new())
        .unwrap();
    store
        .put_partition(
            &CacheKey::from(PARTITIONS[2]),
            PartitionMetadata::new()
                .with_expiration(EXPIRATION_INTERVAL_MS, ExpirationMode::Sliding),
        )
        .unwrap();
    store
}

// == Strategies ==
/// Generates valid cache keys (non-empty, within length limit)
fn valid_key_strategy() -> impl Strategy<Value = CacheKey> {
    "[a-zA-Z0-9_:]{1,64}".prop_map(CacheKey::from)
}

/// Generates arbitrary non-empty payloads
fn valid_value_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 1..256).prop_map(Bytes::from)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Put { partition: usize, key: u8, len: usize },
    Get { partition: usize, key: u8 },
    Delete { partition: usize, key: u8 },
    Increment { partition: usize, key: u8 },
    Advance { ms: u64 },
    Scan,
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    let partition = 0..PARTITIONS.len();
    let key = 0u8..24;
    prop_oneof![
        4 => (partition.clone(), key.clone(), 1usize..96)
            .prop_map(|(partition, key, len)| CacheOp::Put { partition, key, len }),
        2 => (partition.clone(), key.clone())
            .prop_map(|(partition, key)| CacheOp::Get { partition, key }),
        2 => (partition.clone(), key.clone())
            .prop_map(|(partition, key)| CacheOp::Delete { partition, key }),
        1 => (partition, key)
            .prop_map(|(partition, key)| CacheOp::Increment { partition, key }),
        1 => (1u64..40).prop_map(|ms| CacheOp::Advance { ms }),
        1 => Just(CacheOp::Scan),
    ]
}

fn op_key(key: u8) -> CacheKey {
    CacheKey::from(format!("key-{}", key))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Property: Round-trip
    // Storing a pair and reading it back returns the exact bytes written.
    #[test]
    fn prop_roundtrip_storage(key in valid_key_strategy(), value in valid_value_strategy()) {
        let store = test_store(1 << 20);
        let partition = CacheKey::from("p");

        store.put(&partition, key.clone(), value.clone(), 0).unwrap();

        let retrieved = store.get(&partition, &key, 1).unwrap();
        prop_assert_eq!(retrieved, Some(value), "Round-trip value mismatch");
    }

    // Property: Put-if-not-exists never overwrites
    // On a live key it always fails with KeyAlreadyExists and leaves the
    // stored value untouched.
    #[test]
    fn prop_put_if_not_exists_conflict(
        key in valid_key_strategy(),
        original in valid_value_strategy(),
        other in valid_value_strategy()
    ) {
        let store = test_store(1 << 20);
        let partition = CacheKey::from("p");
        store.put(&partition, key.clone(), original.clone(), 0).unwrap();

        let result = store.put_if_not_exists(&partition, key.clone(), other, 1);
        prop_assert!(matches!(result, Err(CacheError::KeyAlreadyExists)));
        prop_assert_eq!(store.get(&partition, &key, 2).unwrap(), Some(original));
    }

    // Property: Batch atomicity
    // A batch holding one oversized key writes nothing at all.
    #[test]
    fn prop_batch_atomicity(
        items in prop::collection::vec((valid_key_strategy(), valid_value_strategy()), 1..20),
        position in any::<prop::sample::Index>()
    ) {
        let store = test_store(1 << 20);
        let partition = CacheKey::from("p");
        let oversized = CacheKey::from("k".repeat(Config::default().max_key_size + 1));

        let mut batch = items.clone();
        let at = position.index(batch.len() + 1);
        batch.insert(at, (oversized, Bytes::from_static(b"v")));

        let result = store.put_many(&partition, &batch, PutMode::Upsert, 0);
        prop_assert!(matches!(result, Err(CacheError::KeyTooLarge { .. })), "Unexpected result {:?}", result);
        for (key, _) in &items {
            prop_assert_eq!(store.get(&partition, key, 1).unwrap(), None);
        }
        prop_assert_eq!(store.statistics().total_size, 0);
    }

    // Property: Statistics accuracy
    // Hits and misses match a model of which keys are present.
    #[test]
    fn prop_statistics_accuracy(
        ops in prop::collection::vec(
            (0u8..16, prop::option::of(valid_value_strategy())),
            1..60
        )
    ) {
        let store = test_store(1 << 20);
        let partition = CacheKey::from("p");
        store.put_partition(&partition, PartitionMetadata::new()).unwrap();
        let mut model: HashMap<CacheKey, Bytes> = HashMap::new();
        let mut expected_hits = 0u64;
        let mut expected_misses = 0u64;

        for (now, (key, value)) in ops.into_iter().enumerate() {
            let key = op_key(key);
            match value {
                Some(value) => {
                    store.put(&partition, key.clone(), value.clone(), now as u64).unwrap();
                    model.insert(key, value);
                }
                None => {
                    let found = store.get(&partition, &key, now as u64).unwrap();
                    prop_assert_eq!(found.as_ref(), model.get(&key));
                    if found.is_some() {
                        expected_hits += 1;
                    } else {
                        expected_misses += 1;
                    }
                }
            }
        }

        let stats = store.statistics();
        prop_assert_eq!(stats.hits, expected_hits, "Hits mismatch");
        prop_assert_eq!(stats.misses, expected_misses, "Misses mismatch");
        prop_assert_eq!(stats.item_count, model.len() as u64, "Item count mismatch");
    }
}

// Separate block with fewer cases for the longer operation sequences
proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    // Property: Size accounting
    // After any sequence of puts, deletes, increments, evictions and
    // expirations, partition sizes sum to the global size, and no budget is
    // exceeded.
    #[test]
    fn prop_partition_sizes_sum_to_global(
        ops in prop::collection::vec(cache_op_strategy(), 1..150)
    ) {
        let store = mixed_store();
        let scanner = ExpirationScanner::new(5);
        let mut now = 0u64;

        for op in ops {
            match op {
                CacheOp::Put { partition, key, len } => {
                    let value = Bytes::from(vec![b'x'; len]);
                    let _ = store.put(&CacheKey::from(PARTITIONS[partition]), op_key(key), value, now);
                }
                CacheOp::Get { partition, key } => {
                    store.get(&CacheKey::from(PARTITIONS[partition]), &op_key(key), now).unwrap();
                }
                CacheOp::Delete { partition, key } => {
                    let _ = store.delete(&CacheKey::from(PARTITIONS[partition]), &op_key(key), now);
                }
                CacheOp::Increment { partition, key } => {
                    let _ = store.increment(&CacheKey::from(PARTITIONS[partition]), &op_key(key), 1, now);
                }
                CacheOp::Advance { ms } => now += ms,
                CacheOp::Scan => {
                    scanner.run(&store, now, Duration::from_secs(1), &CancellationToken::new());
                }
            }

            let partitions = store.partitions_snapshot();
            let size_sum: u64 = partitions.iter().map(|p| p.stats().total_size()).sum();
            let item_sum: u64 = partitions.iter().map(|p| p.stats().item_count()).sum();
            let global = store.statistics();

            prop_assert_eq!(size_sum, global.total_size, "Size sum mismatch");
            prop_assert_eq!(item_sum, global.item_count, "Item count mismatch");
            prop_assert!(global.total_size <= TEST_MAX_CACHE_SIZE);
            let bounded = store.partition_statistics(&CacheKey::from(PARTITIONS[0])).unwrap();
            prop_assert!(bounded.total_size <= BOUNDED_PARTITION_SIZE);
        }
    }

    // Property: Eviction bounds
    // Under target nothing is evicted; at or over target at least one and at
    // most the requested number of entries go.
    #[test]
    fn prop_eviction_bounds(
        entries in 1usize..60,
        budget in 16u64..1024,
        count in 1usize..10
    ) {
        let store = test_store(1 << 20);
        let partition = CacheKey::from("p");
        for i in 0..entries {
            store
                .put(&partition, op_key(i as u8), Bytes::from_static(b"0123456789"), i as u64)
                .unwrap();
        }
        let handle = store.partition(&partition).unwrap();
        handle.apply_metadata(
            &PartitionMetadata::new()
                .with_max_cache_size(budget)
                .with_eviction_policy(EvictionPolicyKind::ApproximateLru),
        );

        let over = handle.is_over_budget();
        let before = handle.len();
        let removed = handle.evict(count, 1_000);

        prop_assert!(removed <= count);
        prop_assert_eq!(handle.len(), before - removed);
        if over {
            prop_assert!(removed >= 1);
        } else {
            prop_assert_eq!(removed, 0);
        }
    }
}
