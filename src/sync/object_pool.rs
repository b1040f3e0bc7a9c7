//! Reusable scratch buffers
//!
//! Record and bitmap reads check a buffer out of the pool, use it for the
//! duration of one call and hand it back on drop.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Bounded pool of byte buffers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool that retains at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Checks out a zero-filled buffer of exactly `len` bytes.
    pub fn checkout(&self, len: usize) -> PooledBuffer<'_> {
        let mut buf = self
            .buffers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        PooledBuffer { pool: self, buf }
    }

    /// Number of idle buffers currently retained.
    pub fn idle(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn give_back(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|p| p.into_inner());
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl PooledBuffer<'_> {
    /// Moves the vector out, e.g. to pass ownership to the file handle.
    /// Pair with [`PooledBuffer::restore`].
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Puts a vector back under this loan.
    pub fn restore(&mut self, buf: Vec<u8>) {
        self.buf = buf;
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 {
            self.pool.give_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_is_zeroed_and_sized() {
        let pool = BufferPool::new(2);
        {
            let mut buf = pool.checkout(8);
            buf[0] = 0xFF;
        }
        let buf = pool.checkout(4);
        assert_eq!(buf.len(), 4);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let pool = BufferPool::new(2);
        {
            let _a = pool.checkout(16);
            let _b = pool.checkout(16);
            let _c = pool.checkout(16);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_take_and_restore() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.checkout(3);
            let mut v = buf.take();
            v[1] = 9;
            buf.restore(v);
            assert_eq!(buf[1], 9);
        }
        assert_eq!(pool.idle(), 1);
    }
}
