//! Lock-free copy buffer pool
//!
//! Every forwarding leg borrows one fixed-size buffer for its whole lifetime.
//! Under connection churn this pool keeps those buffers alive between legs
//! instead of allocating 32 KiB per leg. Idle buffers live in a
//! `crossbeam_queue::ArrayQueue`, so `acquire` and release never take a lock.
//!
//! The pool is an ordinary value. Construct one at startup and hand an
//! `Arc<BufferPool>` to every forwarder; tests build their own small pools and
//! inspect the counters.
//!
//! # Example
//!
//! ```
//! use redir::io::BufferPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(BufferPool::new(16, 32 * 1024));
//!
//! let buffer = pool.acquire();
//! assert_eq!(buffer.len(), 32 * 1024);
//! assert_eq!(pool.outstanding(), 1);
//!
//! // Dropping the buffer releases it back to the pool
//! drop(buffer);
//! assert_eq!(pool.outstanding(), 0);
//! assert_eq!(pool.available(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::config::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Number of new buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from pool
    reuses: AtomicU64,
    /// Number of buffers returned to pool
    returns: AtomicU64,
    /// Number of buffers freed on release (idle set was full)
    drops: AtomicU64,
}

impl BufferPoolStats {
    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of drops
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all stats
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

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStatsSnapshot {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses
    pub reuses: u64,
    /// Number of buffers returned
    pub returns: u64,
    /// Number of buffers freed on release
    pub drops: u64,
}

impl BufferPoolStatsSnapshot {
    /// Get pool efficiency (reuses / (reuses + allocations))
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for efficiency ratio
    pub fn efficiency(&self) -> f64 {
        let total = self.reuses + self.allocations;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

/// Pool of fixed-size copy buffers shared by all forwarding legs.
#[derive(Debug)]
pub struct BufferPool {
    /// Idle buffers
    buffers: ArrayQueue<Box<[u8]>>,
    /// Size of each buffer
    buffer_size: usize,
    /// Buffers currently held by a `PooledBuffer`
    outstanding: AtomicUsize,
    /// Highest value `outstanding` has reached
    high_water: AtomicUsize,
    /// Pool statistics
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Create a pool that keeps at most `capacity` idle buffers of
    /// `buffer_size` bytes each.
    ///
    /// `capacity` bounds only the idle set. `acquire` always succeeds and
    /// allocates when no idle buffer exists.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            outstanding: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            stats: BufferPoolStats::default(),
        }
    }

    /// Create a pool with default settings (1024 idle buffers of 32 KiB)
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Take an idle buffer or allocate a new one.
    ///
    /// The returned `PooledBuffer` is released back to this pool when it is
    /// dropped, on every path including unwinding.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        // Count the borrow before looking at the idle set: a buffer that is
        // being released is still counted as outstanding until it is queued,
        // which keeps allocations <= high_water while nothing is dropped.
        let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(outstanding, Ordering::AcqRel);

        let buffer = if let Some(buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size].into_boxed_slice()
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the idle set. Freed if the idle set is full.
    fn release(&self, buffer: Box<[u8]>) {
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_buf) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Get the buffer size
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the maximum number of idle buffers retained
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Get the current number of idle buffers
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Buffers currently borrowed by legs
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously borrowed buffers seen so far
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    /// Get pool statistics
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

/// A buffer borrowed from the pool.
///
/// Exclusively owned by one leg. Returns to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    /// The underlying buffer (Option for taking on drop)
    buffer: Option<Box<[u8]>>,
    /// Reference to the pool for returning the buffer
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.release(buf);
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

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}
