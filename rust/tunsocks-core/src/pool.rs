//! Reusable payload buffers
//!
//! Relay loops borrow a fixed-size buffer for their whole lifetime. The
//! borrowed buffer is a guard that goes back to the pool when dropped, so it
//! is released exactly once on every exit path.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Large enough for any UDP datagram carried over IPv4/IPv6
pub const POOL_BUFFER_SIZE: usize = 64 * 1024;

const DEFAULT_MAX_IDLE: usize = 256;

static GLOBAL_POOL: Lazy<Arc<BufferPool>> =
    Lazy::new(|| Arc::new(BufferPool::new(POOL_BUFFER_SIZE, DEFAULT_MAX_IDLE)));

/// Process-wide pool used by handlers that are not given one explicitly
pub fn global_pool() -> Arc<BufferPool> {
    Arc::clone(&GLOBAL_POOL)
}

pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            buffer_size,
            max_idle,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Borrow a zeroed-length-`buffer_size` buffer
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        // Callers only see the slice, so the length is still intact; restore it anyway.
        buf.resize(self.buffer_size, 0);
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push(buf);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently parked in the pool
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Buffers currently borrowed
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// A buffer borrowed from a [`BufferPool`]
pub struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Option<Vec<u8>>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_roundtrip() {
        let pool = Arc::new(BufferPool::new(1500, 4));

        let mut buf = pool.get();
        assert_eq!(buf.len(), 1500);
        buf[0] = 0xAB;
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.idle(), 0);

        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        // Reused buffer keeps its full length
        let buf = pool.get();
        assert_eq!(buf.len(), 1500);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_max_idle() {
        let pool = Arc::new(BufferPool::new(16, 2));
        let bufs: Vec<_> = (0..4).map(|_| pool.get()).collect();
        assert_eq!(pool.outstanding(), 4);
        drop(bufs);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_released_on_panic() {
        let pool = Arc::new(BufferPool::new(16, 2));
        let cloned = Arc::clone(&pool);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _buf = cloned.get();
            panic!("relay loop failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_global_pool_size() {
        assert_eq!(global_pool().buffer_size(), POOL_BUFFER_SIZE);
    }
}
