//! Scratch Buffer Pool
//!
//! Reusable index buffers for eviction and expiration sampling, shared by
//! every partition and safe to rent from several threads at once.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Buffers kept around for reuse; extra returns are dropped.
const MAX_POOLED_BUFFERS: usize = 16;

// == Scratch Pool ==
#[derive(Debug, Default)]
pub struct ScratchPool {
    buffers: Mutex<Vec<Vec<usize>>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rents an empty buffer with at least `capacity` slots.
    ///
    /// The buffer returns to the pool when the guard drops, on every exit path.
    /// The largest pooled buffer is preferred so capacity tracks the largest
    /// sample seen.
    pub fn rent(&self, capacity: usize) -> PooledBuffer<'_> {
        let mut buffer = self.buffers.lock().pop().unwrap_or_default();
        buffer.clear();
        buffer.reserve(capacity);
        PooledBuffer { pool: self, buffer }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn give_back(&self, mut buffer: Vec<usize>) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
            // Keep the biggest buffer on top for the next rent
            buffers.sort_unstable_by_key(|b| b.capacity());
        }
    }
}

// == Pooled Buffer ==
/// Scoped rental of a scratch buffer.
pub struct PooledBuffer<'a> {
    pool: &'a ScratchPool,
    buffer: Vec<usize>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<usize>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}
