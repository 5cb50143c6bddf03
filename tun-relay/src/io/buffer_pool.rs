//! Fixed-size relay buffer pool
//!
//! Both relay directions of every flow borrow their scratch buffers from a
//! shared [`BufferPool`]. Buffers live in a lock-free
//! `crossbeam_queue::ArrayQueue`; when the queue is empty a fresh buffer is
//! allocated, and when it is full a returned buffer is simply dropped.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tun_relay::io::BufferPool;
//!
//! let pool = Arc::new(BufferPool::new(16, 4096));
//! let buf = pool.get();
//! assert_eq!(buf.len(), 4096);
//! drop(buf); // back into the pool
//! assert_eq!(pool.available(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::Serialize;

/// Default relay buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of buffers kept by the pool
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Counters for pool activity
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl BufferPoolStats {
    /// Number of buffers allocated because the pool was empty
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffers handed out from the pool
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of buffers accepted back into the pool
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Number of buffers discarded (pool full or wrong size)
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Take a point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of [`BufferPoolStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferPoolStatsSnapshot {
    pub allocations: u64,
    pub reuses: u64,
    pub returns: u64,
    pub drops: u64,
}

impl BufferPoolStatsSnapshot {
    /// Fraction of requests served without allocating
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn efficiency(&self) -> f64 {
        let total = self.reuses + self.allocations;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

/// Pool of equally sized byte buffers shared across relay tasks.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a pool that retains at most `capacity` buffers of
    /// `buffer_size` bytes each.
    ///
    /// A zero capacity is bumped to one since `ArrayQueue` rejects it.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            stats: BufferPoolStats::default(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Borrow a buffer of exactly `buffer_size` bytes.
    ///
    /// Reused buffers keep whatever bytes the previous holder left in them;
    /// callers only read back what they wrote.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = match self.buffers.pop() {
            Some(mut buf) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Put a raw buffer back. Buffers whose capacity is smaller than the
    /// pool's size are discarded.
    pub fn put(&self, buffer: Vec<u8>) {
        self.return_buffer(buffer);
    }

    fn return_buffer(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < self.buffer_size {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buffer.clear();
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_full) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Pre-allocate up to `count` buffers.
    pub fn prewarm(&self, count: usize) {
        for _ in 0..count {
            if self.buffers.push(vec![0u8; self.buffer_size]).is_err() {
                break;
            }
        }
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Buffers currently idle in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Mutable access to the backing vector, e.g. for `BufMut` encoders.
    /// The vector is cleared first; its capacity is kept.
    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        let buf = self.buffer.get_or_insert_with(Vec::new);
        buf.clear();
        buf
    }

    /// Copy the first `len` bytes out into an owned `Bytes`, leaving the
    /// buffer to return to the pool.
    #[must_use]
    pub fn copy_to_bytes(&self, len: usize) -> bytes::Bytes {
        let len = len.min(self.len());
        bytes::Bytes::copy_from_slice(&self[..len])
    }

    /// Detach the buffer from the pool.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buffer.take().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}
