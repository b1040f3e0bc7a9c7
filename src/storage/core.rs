//! Shared engine context
//!
//! One `StoreCore` exists per open database. Every storage component borrows
//! it for file access, block growth, locking and scratch buffers.

use super::block::BlockAllocator;
use super::errors::StorageResult;
use super::file::FileHandle;
use crate::sync::{BufferPool, LockPools};

pub struct StoreCore {
    pub file: FileHandle,
    pub blocks: BlockAllocator,
    pub locks: LockPools,
    pub buffers: BufferPool,
}

impl StoreCore {
    pub fn new(
        file: FileHandle,
        boundary: u64,
        lock_shards: usize,
        buffer_pool_size: usize,
        sync_on_write: bool,
    ) -> Self {
        Self {
            blocks: BlockAllocator::new(file.clone(), boundary, sync_on_write),
            file,
            locks: LockPools::new(lock_shards),
            buffers: BufferPool::new(buffer_pool_size),
        }
    }

    /// Reads `len` bytes at `address` into a pooled buffer and passes them to
    /// `f`.
    pub async fn read_with<T>(
        &self,
        address: u64,
        len: usize,
        f: impl FnOnce(&[u8]) -> T,
    ) -> StorageResult<T> {
        let mut buf = self.buffers.checkout(len);
        let filled = self.file.read_into(address, buf.take()).await?;
        buf.restore(filled);
        Ok(f(&buf))
    }
}
