//! Fixed-capacity byte buffers recycled through a lock-free free list.
//!
//! The gateway owns two pools: one for sniff buffers, which are held for the
//! lifetime of a connection, and one for proxy copy buffers, which are held
//! only for the duration of a single copy call. Buffers never grow; running
//! past capacity is a protocol error raised by the caller.
//!
//! A [`PooledBuf`] is the only handle to a pooled allocation and returns it
//! on drop, so a buffer cannot be returned twice or used after return.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::Serialize;

use crate::error::{GatewayError, Result};

/// Capacity of a sniff buffer. Protocol preambles larger than this are rejected.
pub const SNIFF_BUFFER_SIZE: usize = 32 * 1024;

/// Capacity of a buffered-copy chunk.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of idle buffers a pool keeps around.
pub const DEFAULT_POOL_RETAIN: usize = 256;

/// Counters for a [`BufferPool`].
#[derive(Debug, Default)]
struct PoolCounters {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

/// Point-in-time view of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub allocations: u64,
    pub reuses: u64,
    pub returns: u64,
    /// Buffers released while the free list was full.
    pub drops: u64,
    pub outstanding: usize,
    pub idle: usize,
}

/// A pool of equally sized byte buffers.
pub struct BufferPool {
    free: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,
    /// Maximum buffers handed out at once. `None` never refuses a request.
    limit: Option<usize>,
    outstanding: AtomicUsize,
    counters: PoolCounters,
}

impl BufferPool {
    /// Create a pool that allocates on demand and keeps up to `retain` idle buffers.
    pub fn new(buffer_size: usize, retain: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(retain.max(1)),
            buffer_size,
            limit: None,
            outstanding: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        })
    }

    /// Create a pool that refuses requests once `limit` buffers are outstanding.
    pub fn bounded(buffer_size: usize, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(limit.max(1)),
            buffer_size,
            limit: Some(limit),
            outstanding: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        })
    }

    /// Default sniff pool.
    pub fn sniff() -> Arc<Self> {
        Self::new(SNIFF_BUFFER_SIZE, DEFAULT_POOL_RETAIN)
    }

    /// Default copy pool.
    pub fn copy() -> Arc<Self> {
        Self::new(COPY_BUFFER_SIZE, DEFAULT_POOL_RETAIN)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer, reusing an idle one when available.
    pub fn get(self: &Arc<Self>) -> Result<PooledBuf> {
        let previous = self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = self.limit {
            if previous >= limit {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(GatewayError::PoolExhausted);
            }
        }

        let buf = match self.free.pop() {
            Some(buf) => {
                self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.counters.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };

        Ok(PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    /// Buffers currently handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_size: self.buffer_size,
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            returns: self.counters.returns.load(Ordering::Relaxed),
            drops: self.counters.drops.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
            idle: self.free.len(),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.counters.returns.fetch_add(1, Ordering::Relaxed);
        if self.free.push(buf).is_err() {
            self.counters.drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("limit", &self.limit)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Exclusive handle to a pooled buffer, returned to its pool on drop.
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len()).finish()
    }
}
