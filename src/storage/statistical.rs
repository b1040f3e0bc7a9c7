//! Statistical (fixed-size-record) block
//!
//! ```text
//! +----------------------+
//! | record size (u32)    |
//! | used count  (u32)    |
//! +----------------------+
//! | occupancy bitmap     |  ceil(slots / 8) bytes
//! +----------------------+
//! | slot 0 .. slot n-1   |  record size bytes each
//! +----------------------+
//! ```
//!
//! Free/used state lives only in the bitmap. Freed slots keep their bytes.

use super::core::StoreCore;
use super::errors::{StorageError, StorageResult};
use super::file::to_array;
use super::layout::BLOCK_SIZE;

/// Bytes before the bitmap.
pub const STATISTICAL_HEADER_SIZE: u64 = 8;

/// Largest slot count such that header, bitmap and slots fit in one block.
pub fn slot_count(record_size: u32) -> u32 {
    let size = record_size.max(1) as u64;
    let usable = BLOCK_SIZE - STATISTICAL_HEADER_SIZE;
    let mut n = usable * 8 / (8 * size + 1);
    while n > 0 && STATISTICAL_HEADER_SIZE + bitmap_len(n) + n * size > BLOCK_SIZE {
        n -= 1;
    }
    n as u32
}

fn bitmap_len(slots: u64) -> u64 {
    slots.div_ceil(8)
}

/// Cursor over one statistical block.
pub struct StatisticalBlock<'a> {
    core: &'a StoreCore,
    address: u64,
    record_size: u32,
    slots: u32,
}

impl<'a> StatisticalBlock<'a> {
    pub fn new(core: &'a StoreCore, address: u64, record_size: u32) -> Self {
        Self {
            core,
            address,
            record_size,
            slots: slot_count(record_size),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    fn bitmap_address(&self) -> u64 {
        self.address + STATISTICAL_HEADER_SIZE
    }

    fn data_address(&self) -> u64 {
        self.bitmap_address() + bitmap_len(self.slots as u64)
    }

    /// Address of the slot at `index`.
    pub fn address_of(&self, index: u32) -> u64 {
        self.data_address() + index as u64 * self.record_size as u64
    }

    /// Slot index of `address`, if it is the start of a slot in this block.
    pub fn index_of(&self, address: u64) -> Option<u32> {
        let start = self.data_address();
        if address < start {
            return None;
        }
        let offset = address - start;
        let size = self.record_size as u64;
        if offset % size != 0 || offset / size >= self.slots as u64 {
            return None;
        }
        Some((offset / size) as u32)
    }

    /// Writes a fresh header and clears the bitmap.
    pub async fn initialize(&self) -> StorageResult<()> {
        let _guard = self.core.locks.statistical.write(self.address).await;
        let mut header = Vec::with_capacity(STATISTICAL_HEADER_SIZE as usize);
        header.extend_from_slice(&self.record_size.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        self.core.file.write_bytes(self.address, &header).await?;
        self.core
            .file
            .write_zeros(self.bitmap_address(), bitmap_len(self.slots as u64) as usize)
            .await
    }

    async fn read_header(&self) -> StorageResult<u32> {
        let (size, used) = self
            .core
            .read_with(self.address, STATISTICAL_HEADER_SIZE as usize, |b| {
                (
                    u32::from_le_bytes(to_array(&b[0..4])),
                    u32::from_le_bytes(to_array(&b[4..8])),
                )
            })
            .await?;
        if size != self.record_size {
            return Err(StorageError::corruption_at_offset(
                self.address,
                format!(
                    "statistical block record size {} does not match expected {}",
                    size, self.record_size
                ),
            ));
        }
        Ok(used)
    }

    async fn write_used(&self, used: u32) -> StorageResult<()> {
        self.core.file.write_u32(self.address + 4, used).await
    }

    /// Whether at least one slot is free.
    pub async fn contains_unused(&self) -> StorageResult<bool> {
        let _guard = self.core.locks.statistical.read(self.address).await;
        Ok(self.read_header().await? < self.slots)
    }

    /// Number of occupied slots.
    pub async fn get_used_count(&self) -> StorageResult<u32> {
        let _guard = self.core.locks.statistical.read(self.address).await;
        self.read_header().await
    }

    /// Claims the first free slot. `None` when the block is full.
    pub async fn allocate_record(&self) -> StorageResult<Option<u64>> {
        let _guard = self.core.locks.statistical.write(self.address).await;
        let used = self.read_header().await?;
        if used >= self.slots {
            return Ok(None);
        }

        let len = bitmap_len(self.slots as u64) as usize;
        let free = self
            .core
            .read_with(self.bitmap_address(), len, |bitmap| {
                first_clear_bit(bitmap, self.slots)
            })
            .await?;

        let Some(index) = free else {
            return Err(StorageError::corruption_at_offset(
                self.address,
                format!("used count {} below capacity but bitmap is full", used),
            ));
        };

        let byte_address = self.bitmap_address() + (index / 8) as u64;
        let byte = self.core.file.read_bytes(byte_address, 1).await?[0];
        self.core
            .file
            .write_bytes(byte_address, &[byte | (1 << (index % 8))])
            .await?;
        self.write_used(used + 1).await?;

        Ok(Some(self.address_of(index)))
    }

    /// Marks the slot at `address` free. Returns whether it was in use.
    pub async fn unuse_by_address(&self, address: u64) -> StorageResult<bool> {
        let index = self.index_of(address).ok_or_else(|| StorageError::record_not_found(address))?;
        let _guard = self.core.locks.statistical.write(self.address).await;
        let used = self.read_header().await?;

        let byte_address = self.bitmap_address() + (index / 8) as u64;
        let byte = self.core.file.read_bytes(byte_address, 1).await?[0];
        let mask = 1u8 << (index % 8);
        if byte & mask == 0 {
            return Ok(false);
        }
        self.core
            .file
            .write_bytes(byte_address, &[byte & !mask])
            .await?;
        self.write_used(used.saturating_sub(1)).await?;
        Ok(true)
    }

    /// Whether `address` is the start of an occupied slot.
    pub async fn is_used(&self, address: u64) -> StorageResult<bool> {
        let Some(index) = self.index_of(address) else {
            return Ok(false);
        };
        let _guard = self.core.locks.statistical.read(self.address).await;
        let byte_address = self.bitmap_address() + (index / 8) as u64;
        let byte = self.core.file.read_bytes(byte_address, 1).await?[0];
        Ok(byte & (1 << (index % 8)) != 0)
    }

    /// Indices of every occupied slot, ascending.
    pub async fn get_used_indexes(&self) -> StorageResult<Vec<u32>> {
        let _guard = self.core.locks.statistical.read(self.address).await;
        let len = bitmap_len(self.slots as u64) as usize;
        let slots = self.slots;
        self.core
            .read_with(self.bitmap_address(), len, |bitmap| {
                (0..slots)
                    .filter(|i| bitmap[(*i / 8) as usize] & (1 << (*i % 8)) != 0)
                    .collect()
            })
            .await
    }

    /// Raw bytes of the slot at `index`.
    pub async fn read_by_index(&self, index: u32) -> StorageResult<Vec<u8>> {
        self.core
            .file
            .read_bytes(self.address_of(index), self.record_size as usize)
            .await
    }
}

fn first_clear_bit(bitmap: &[u8], slots: u32) -> Option<u32> {
    for (i, byte) in bitmap.iter().enumerate() {
        if *byte == 0xFF {
            continue;
        }
        let bit = (!*byte).trailing_zeros();
        let index = i as u32 * 8 + bit;
        if index < slots {
            return Some(index);
        }
        return None;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::FIRST_DYNAMIC_BLOCK_ADDRESS;
    use crate::storage::FileHandle;
    use tempfile::TempDir;

    async fn core(dir: &TempDir) -> StoreCore {
        let file = FileHandle::open(&dir.path().join("db.obj")).await.unwrap();
        StoreCore::new(file, FIRST_DYNAMIC_BLOCK_ADDRESS, 8, 4, false)
    }

    #[test]
    fn test_slot_count_fits_block() {
        for size in [1u32, 8, 24, 100, 512, 8480, 65536] {
            let n = slot_count(size) as u64;
            assert!(n > 0);
            assert!(STATISTICAL_HEADER_SIZE + n.div_ceil(8) + n * size as u64 <= BLOCK_SIZE);
            assert!(
                STATISTICAL_HEADER_SIZE + (n + 1).div_ceil(8) + (n + 1) * size as u64 > BLOCK_SIZE
            );
        }
    }

    #[test]
    fn test_first_clear_bit() {
        assert_eq!(first_clear_bit(&[0x00], 8), Some(0));
        assert_eq!(first_clear_bit(&[0xFF, 0x03], 16), Some(10));
        assert_eq!(first_clear_bit(&[0xFF, 0x03], 10), None);
        assert_eq!(first_clear_bit(&[0xFF], 8), None);
    }

    #[tokio::test]
    async fn test_allocate_free_and_reuse() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let block = core.blocks.allocate_block().await.unwrap();
        let stat = StatisticalBlock::new(&core, block, 64);
        stat.initialize().await.unwrap();

        let a = stat.allocate_record().await.unwrap().unwrap();
        let b = stat.allocate_record().await.unwrap().unwrap();
        assert_eq!(b, a + 64);
        assert_eq!(stat.get_used_count().await.unwrap(), 2);
        assert!(stat.is_used(a).await.unwrap());

        assert!(stat.unuse_by_address(a).await.unwrap());
        assert!(!stat.unuse_by_address(a).await.unwrap());
        assert!(!stat.is_used(a).await.unwrap());
        assert_eq!(stat.get_used_indexes().await.unwrap(), vec![1]);

        // First free slot is reused.
        let c = stat.allocate_record().await.unwrap().unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn test_full_block_reports_none() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let block = core.blocks.allocate_block().await.unwrap();
        // Large records keep the slot count small.
        let stat = StatisticalBlock::new(&core, block, 300_000);
        stat.initialize().await.unwrap();

        for _ in 0..stat.slots() {
            assert!(stat.allocate_record().await.unwrap().is_some());
        }
        assert!(!stat.contains_unused().await.unwrap());
        assert!(stat.allocate_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_size_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let block = core.blocks.allocate_block().await.unwrap();
        StatisticalBlock::new(&core, block, 32).initialize().await.unwrap();

        let err = StatisticalBlock::new(&core, block, 64)
            .contains_unused()
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_misaligned_address_is_not_used() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let block = core.blocks.allocate_block().await.unwrap();
        let stat = StatisticalBlock::new(&core, block, 16);
        stat.initialize().await.unwrap();
        let a = stat.allocate_record().await.unwrap().unwrap();

        assert!(!stat.is_used(a + 1).await.unwrap());
        assert!(stat.unuse_by_address(a + 1).await.is_err());
    }
}
