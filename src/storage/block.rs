//! Block allocator
//!
//! The file grows one block at a time under a single lock. The persisted
//! database size in the header only ever moves forward.

use tokio::sync::Mutex;

use super::errors::StorageResult;
use super::file::FileHandle;
use super::layout::{BLOCK_SIZE, DATABASE_SIZE_OFFSET};
use crate::observability::{log_event_with_fields, Event};

#[derive(Debug)]
struct Boundary {
    /// Next address to hand out
    next: u64,
    /// Value last written to the header
    persisted: u64,
}

/// Hands out fresh zero-filled blocks at the end of the file.
#[derive(Debug)]
pub struct BlockAllocator {
    file: FileHandle,
    boundary: Mutex<Boundary>,
    sync_on_write: bool,
}

impl BlockAllocator {
    /// Creates an allocator whose next block starts at `boundary`.
    pub fn new(file: FileHandle, boundary: u64, sync_on_write: bool) -> Self {
        Self {
            file,
            boundary: Mutex::new(Boundary {
                next: boundary,
                persisted: boundary,
            }),
            sync_on_write,
        }
    }

    /// Reads the persisted database size from the header.
    pub async fn load_boundary(file: &FileHandle) -> StorageResult<u64> {
        let size = file.read_i64(DATABASE_SIZE_OFFSET).await?;
        Ok(size.max(0) as u64)
    }

    /// Current file boundary (the address the next block will get).
    pub async fn boundary(&self) -> u64 {
        self.boundary.lock().await.next
    }

    /// Allocates one block and returns its address.
    ///
    /// The boundary moves under the lock; the zero fill happens after the
    /// lock is released. Callers only read addresses they were handed, so
    /// nobody observes the block before its fill completes.
    pub async fn allocate_block(&self) -> StorageResult<u64> {
        let address = {
            let mut boundary = self.boundary.lock().await;
            let address = boundary.next;
            boundary.next += BLOCK_SIZE;
            if boundary.next > boundary.persisted {
                self.file
                    .write_i64(DATABASE_SIZE_OFFSET, boundary.next as i64)
                    .await?;
                boundary.persisted = boundary.next;
            }
            address
        };

        self.file.write_zeros(address, BLOCK_SIZE as usize).await?;
        if self.sync_on_write {
            self.file.sync().await?;
        }

        log_event_with_fields(Event::BlockAllocated, &[("address", address.to_string().as_str())]);
        Ok(address)
    }
}
