//! Cache Value Module
//!
//! Defines the value holder stored for each key: a payload plus an atomically
//! updated last-access timestamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{CacheError, Result};

/// Size of an integer payload usable by increment/decrement.
pub const INTEGER_PAYLOAD_SIZE: usize = 8;

// == Cache Value ==
/// Represents a single cached payload with its access clock.
///
/// The timestamp is an `AtomicU64` so readers holding only a shared lock on
/// the partition can refresh it. Readers may observe a stale timestamp but
/// never a torn one.
#[derive(Debug)]
pub struct CacheValue {
    /// The stored payload
    payload: Bytes,
    /// Last access time in milliseconds
    last_access: AtomicU64,
}

impl CacheValue {
    // == Constructor ==
    /// Creates a new value accessed at `now`.
    pub fn new(payload: Bytes, now: u64) -> Self {
        Self {
            payload,
            last_access: AtomicU64::new(now),
        }
    }

    /// Creates a value holding an 8-byte little-endian integer.
    pub fn from_i64(value: i64, now: u64) -> Self {
        Self::new(encode_i64(value), now)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the last access time.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    // == Touch ==
    /// Refreshes the access time. Never moves the clock backwards.
    pub fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::AcqRel);
    }

    /// Overrides the access time, used to carry the original creation time
    /// across an overwrite in absolute-expiration partitions.
    pub fn set_last_access(&self, at: u64) {
        self.last_access.store(at, Ordering::Release);
    }

    // == Is Expired ==
    /// Checks if the value has expired.
    ///
    /// An interval of 0 never expires. Otherwise the value is expired once
    /// strictly more than `interval_ms` has elapsed since the last access.
    pub fn is_expired(&self, now: u64, interval_ms: u64) -> bool {
        interval_ms > 0 && now.saturating_sub(self.last_access()) > interval_ms
    }

    // == Time To Live ==
    /// Returns remaining lifetime in milliseconds, or None if it never expires.
    pub fn ttl_remaining_ms(&self, now: u64, interval_ms: u64) -> Option<u64> {
        if interval_ms == 0 {
            return None;
        }
        let deadline = self.last_access().saturating_add(interval_ms);
        Some(deadline.saturating_sub(now))
    }

    /// Decodes the payload as a little-endian integer.
    pub fn as_i64(&self) -> Result<i64> {
        let bytes: [u8; INTEGER_PAYLOAD_SIZE] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| CacheError::InvalidTypeOperation(self.payload.len()))?;
        Ok(i64::from_le_bytes(bytes))
    }

    // == Increment ==
    /// Adds `delta` to an integer payload in place and returns the new value.
    ///
    /// Fails without modifying anything when the payload is not 8 bytes.
    /// Arithmetic wraps on overflow.
    pub fn increment(&mut self, delta: i64) -> Result<i64> {
        let updated = self.as_i64()?.wrapping_add(delta);
        self.payload = encode_i64(updated);
        Ok(updated)
    }
}

impl Clone for CacheValue {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            last_access: AtomicU64::new(self.last_access()),
        }
    }
}

fn encode_i64(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
///
/// This is the clock callers pass as `now` to the engine.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_never_expires_with_zero_interval() {
        let value = CacheValue::new(Bytes::from_static(b"v"), 0);
        assert!(!value.is_expired(u64::MAX, 0));
        assert!(value.ttl_remaining_ms(100, 0).is_none());
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let value = CacheValue::new(Bytes::from_static(b"v"), 1_000);

        // Exactly one interval later the value is still live
        assert!(!value.is_expired(1_100, 100));
        assert!(value.is_expired(1_101, 100));
    }

    #[test]
    fn test_touch_extends_lifetime() {
        let value = CacheValue::new(Bytes::from_static(b"v"), 1_000);
        value.touch(1_080);
        assert!(!value.is_expired(1_150, 100));
        assert_eq!(value.ttl_remaining_ms(1_150, 100), Some(30));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let value = CacheValue::new(Bytes::from_static(b"v"), 1_000);
        value.touch(500);
        assert_eq!(value.last_access(), 1_000);
    }

    #[test]
    fn test_ttl_remaining_expired() {
        let value = CacheValue::new(Bytes::from_static(b"v"), 1_000);
        assert_eq!(value.ttl_remaining_ms(5_000, 100), Some(0));
    }

    #[test]
    fn test_increment_integer_payload() {
        let mut value = CacheValue::from_i64(40, 0);
        assert_eq!(value.increment(2).unwrap(), 42);
        assert_eq!(value.increment(-50).unwrap(), -8);
        assert_eq!(value.as_i64().unwrap(), -8);
    }

    #[test]
    fn test_increment_rejects_non_integer_payload() {
        let mut value = CacheValue::new(Bytes::from_static(b"abcd"), 0);
        let result = value.increment(1);
        assert!(matches!(result, Err(CacheError::InvalidTypeOperation(4))));
        assert_eq!(value.payload().as_ref(), b"abcd");
    }

    #[test]
    fn test_clone_copies_timestamp() {
        let value = CacheValue::new(Bytes::from_static(b"v"), 77);
        let copy = value.clone();
        value.touch(99);
        assert_eq!(copy.last_access(), 77);
    }
}
