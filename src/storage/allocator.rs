//! Meta allocator
//!
//! Supplies record slots for one schema. The schema's meta-record chain lists
//! every block it owns; the allocator keeps that list cached, plus a queue of
//! blocks that recently had room so allocation under load does not rescan the
//! whole chain each time.
//!
//! # Allocation path
//!
//! 1. Pop a candidate block from the queue and try to claim a slot in it.
//! 2. On an empty queue, take the refill lock and rescan owned blocks for
//!    free capacity.
//! 3. If nothing has room, allocate a new block, register it in the chain and
//!    claim its first slot. Failing that claim is an invariant violation.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::core::StoreCore;
use super::errors::{StorageError, StorageResult};
use super::layout::block_of;
use super::meta::{MetaRecord, META_MAX_BLOCKS, META_RECORD_SIZE};
use super::statistical::StatisticalBlock;
use crate::observability::{log_event_with_fields, Event};

#[derive(Debug, Default)]
struct BlockCache {
    ordered: Vec<u64>,
    members: HashSet<u64>,
}

impl BlockCache {
    fn push(&mut self, block: u64) {
        if self.members.insert(block) {
            self.ordered.push(block);
        }
    }
}

enum Candidate {
    Existing(u64),
    Claimed(u64),
}

/// Record allocator for a single schema.
pub struct MetaAllocator {
    core: Arc<StoreCore>,
    name: String,
    first_meta: u64,
    record_size: u32,
    /// Allocator for `$meta` records; `None` when this is that allocator.
    meta: Option<Arc<MetaAllocator>>,
    blocks: RwLock<Option<BlockCache>>,
    queue: Mutex<VecDeque<u64>>,
    refill: AsyncMutex<()>,
}

impl MetaAllocator {
    pub fn new(
        core: Arc<StoreCore>,
        name: impl Into<String>,
        first_meta: u64,
        record_size: u32,
        meta: Option<Arc<MetaAllocator>>,
    ) -> Self {
        Self {
            core,
            name: name.into(),
            first_meta,
            record_size,
            meta,
            blocks: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            refill: AsyncMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Address of the first meta-record of the chain.
    pub fn first_meta_address(&self) -> u64 {
        self.first_meta
    }

    pub fn core(&self) -> &Arc<StoreCore> {
        &self.core
    }

    fn pop_candidate(&self) -> Option<u64> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    fn push_candidate(&self, block: u64) {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if !queue.contains(&block) {
            queue.push_back(block);
        }
    }

    async fn load_cache(&self) -> StorageResult<()> {
        if self.blocks.read().await.is_some() {
            return Ok(());
        }
        let mut slot = self.blocks.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let mut cache = BlockCache::default();
        let mut node = self.first_meta;
        while node != 0 {
            let _guard = self.core.locks.record.read(node).await;
            let meta = MetaRecord::new(&self.core, node);
            for block in meta.block_addresses().await? {
                cache.push(block);
            }
            node = meta.next().await?;
        }
        *slot = Some(cache);
        Ok(())
    }

    /// Every block this schema owns, in registration order.
    pub async fn get_block_addresses(&self) -> StorageResult<Vec<u64>> {
        self.load_cache().await?;
        Ok(self
            .blocks
            .read()
            .await
            .as_ref()
            .map(|c| c.ordered.clone())
            .unwrap_or_default())
    }

    /// Whether `block` is one of this schema's blocks.
    pub async fn contains_block_address(&self, block: u64) -> StorageResult<bool> {
        self.load_cache().await?;
        Ok(self
            .blocks
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.members.contains(&block)))
    }

    /// Whether `address` lies inside one of this schema's blocks.
    pub async fn owns_address(&self, address: u64) -> StorageResult<bool> {
        match block_of(address) {
            Some(block) => self.contains_block_address(block).await,
            None => Ok(false),
        }
    }

    /// Owned blocks that currently have at least one free slot.
    pub async fn get_free_block_address(&self) -> StorageResult<Vec<u64>> {
        let mut free = Vec::new();
        for block in self.get_block_addresses().await? {
            if StatisticalBlock::new(&self.core, block, self.record_size)
                .contains_unused()
                .await?
            {
                free.push(block);
            }
        }
        Ok(free)
    }

    /// Claims a free record slot and returns its address.
    pub async fn allocate_record(&self) -> StorageResult<u64> {
        loop {
            match self.next_candidate().await? {
                Candidate::Claimed(address) => return Ok(address),
                Candidate::Existing(block) => {
                    let stat = StatisticalBlock::new(&self.core, block, self.record_size);
                    if let Some(address) = stat.allocate_record().await? {
                        self.push_candidate(block);
                        return Ok(address);
                    }
                }
            }
        }
    }

    /// Boxed form of [`MetaAllocator::allocate_record`], for the one place
    /// allocation recurses into another allocator.
    pub fn allocate_record_boxed(&self) -> BoxFuture<'_, StorageResult<u64>> {
        self.allocate_record().boxed()
    }

    async fn next_candidate(&self) -> StorageResult<Candidate> {
        if let Some(block) = self.pop_candidate() {
            return Ok(Candidate::Existing(block));
        }

        let _refill = self.refill.lock().await;
        if let Some(block) = self.pop_candidate() {
            return Ok(Candidate::Existing(block));
        }

        let free = self.get_free_block_address().await?;
        if !free.is_empty() {
            for block in &free {
                self.push_candidate(*block);
            }
            if let Some(block) = self.pop_candidate() {
                return Ok(Candidate::Existing(block));
            }
        }

        let block = self.allocate_statistical_block().await?;
        let stat = StatisticalBlock::new(&self.core, block, self.record_size);
        let address = stat
            .allocate_record()
            .await?
            .ok_or_else(|| StorageError::allocation_invariant(block, self.record_size))?;
        self.push_candidate(block);
        Ok(Candidate::Claimed(address))
    }

    /// Allocates a new block, formats it for this schema's record size and
    /// registers it in the meta-record chain.
    pub async fn allocate_statistical_block(&self) -> StorageResult<u64> {
        self.load_cache().await?;
        let block = self.core.blocks.allocate_block().await?;
        StatisticalBlock::new(&self.core, block, self.record_size)
            .initialize()
            .await?;
        self.add_block_address_to_meta_record(block).await?;
        if let Some(cache) = self.blocks.write().await.as_mut() {
            cache.push(block);
        }
        Ok(block)
    }

    /// Records `block` in the first chain node with a free slot, chaining a
    /// new meta-record when the tail is full.
    pub async fn add_block_address_to_meta_record(&self, block: u64) -> StorageResult<()> {
        let mut node = self.first_meta;
        loop {
            let _guard = self.core.locks.record.write(node).await;
            let meta = MetaRecord::new(&self.core, node);
            let count = meta.block_count().await?;
            if count < META_MAX_BLOCKS {
                return meta.push_block(count, block).await;
            }

            let next = meta.next().await?;
            if next != 0 {
                node = next;
                continue;
            }

            let new_node = match &self.meta {
                Some(meta_allocator) => meta_allocator.allocate_record_boxed().await?,
                // `$meta` chains carve the new node out of the block being
                // registered, which is already formatted for meta-records.
                None => StatisticalBlock::new(&self.core, block, META_RECORD_SIZE)
                    .allocate_record()
                    .await?
                    .ok_or_else(|| StorageError::allocation_invariant(block, META_RECORD_SIZE))?,
            };

            let chained = MetaRecord::new(&self.core, new_node);
            chained
                .write_new(&self.name, self.record_size, 0, self.first_meta)
                .await?;
            chained.push_block(0, block).await?;
            meta.set_next(new_node).await?;

            log_event_with_fields(
                Event::MetaRecordChained,
                &[
                    ("address", new_node.to_string().as_str()),
                    ("type", self.name.as_str()),
                ],
            );
            return Ok(());
        }
    }

    /// Frees the record at `address`. Returns whether it was live.
    pub async fn remove_record(&self, address: u64) -> StorageResult<bool> {
        let block = block_of(address).ok_or_else(|| StorageError::record_not_found(address))?;
        let freed = StatisticalBlock::new(&self.core, block, self.record_size)
            .unuse_by_address(address)
            .await?;
        if freed {
            self.push_candidate(block);
        }
        Ok(freed)
    }

    /// Whether `address` holds a live record of this schema.
    pub async fn is_live(&self, address: u64) -> StorageResult<bool> {
        let Some(block) = block_of(address) else {
            return Ok(false);
        };
        if !self.contains_block_address(block).await? {
            return Ok(false);
        }
        StatisticalBlock::new(&self.core, block, self.record_size)
            .is_used(address)
            .await
    }

    /// Addresses of every live record, ascending by block then slot.
    pub async fn used_addresses(&self) -> StorageResult<Vec<u64>> {
        let mut blocks = self.get_block_addresses().await?;
        blocks.sort_unstable();
        let mut addresses = Vec::new();
        for block in blocks {
            let stat = StatisticalBlock::new(&self.core, block, self.record_size);
            for index in stat.get_used_indexes().await? {
                addresses.push(stat.address_of(index));
            }
        }
        Ok(addresses)
    }

    /// Number of live records.
    pub async fn used_count(&self) -> StorageResult<u64> {
        let mut total = 0u64;
        for block in self.get_block_addresses().await? {
            total += StatisticalBlock::new(&self.core, block, self.record_size)
                .get_used_count()
                .await? as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::FIRST_DYNAMIC_BLOCK_ADDRESS;
    use crate::storage::statistical::slot_count;
    use crate::storage::FileHandle;
    use tempfile::TempDir;

    /// Builds a `$meta` allocator on a fresh block plus a user allocator.
    async fn setup(dir: &TempDir, record_size: u32) -> (Arc<MetaAllocator>, MetaAllocator) {
        let file = FileHandle::open(&dir.path().join("db.obj")).await.unwrap();
        let core = Arc::new(StoreCore::new(file, FIRST_DYNAMIC_BLOCK_ADDRESS, 8, 4, false));

        let meta_block = core.blocks.allocate_block().await.unwrap();
        let stat = StatisticalBlock::new(&core, meta_block, META_RECORD_SIZE);
        stat.initialize().await.unwrap();
        let meta_first = stat.allocate_record().await.unwrap().unwrap();
        let node = MetaRecord::new(&core, meta_first);
        node.write_new("$meta", META_RECORD_SIZE, 0, meta_first).await.unwrap();
        node.push_block(0, meta_block).await.unwrap();
        let meta = Arc::new(MetaAllocator::new(
            Arc::clone(&core),
            "$meta",
            meta_first,
            META_RECORD_SIZE,
            None,
        ));

        let user_first = meta.allocate_record().await.unwrap();
        MetaRecord::new(&core, user_first)
            .write_new("Thing", record_size, 0, user_first)
            .await
            .unwrap();
        let user = MetaAllocator::new(core, "Thing", user_first, record_size, Some(Arc::clone(&meta)));
        (meta, user)
    }

    #[tokio::test]
    async fn test_first_allocation_creates_block() {
        let dir = TempDir::new().unwrap();
        let (_meta, user) = setup(&dir, 32).await;

        assert!(user.get_block_addresses().await.unwrap().is_empty());
        let a = user.allocate_record().await.unwrap();
        let blocks = user.get_block_addresses().await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(block_of(a), Some(blocks[0]));
        assert!(user.is_live(a).await.unwrap());
        assert!(user.owns_address(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_allocation_spills_into_new_block() {
        let dir = TempDir::new().unwrap();
        let size = 200_000;
        let (_meta, user) = setup(&dir, size).await;
        let per_block = slot_count(size) as usize;

        let mut addresses = Vec::new();
        for _ in 0..per_block + 1 {
            addresses.push(user.allocate_record().await.unwrap());
        }
        assert_eq!(user.get_block_addresses().await.unwrap().len(), 2);
        assert_eq!(user.used_count().await.unwrap(), (per_block + 1) as u64);
    }

    #[tokio::test]
    async fn test_freed_slot_is_reused() {
        let dir = TempDir::new().unwrap();
        let (_meta, user) = setup(&dir, 64).await;
        let a = user.allocate_record().await.unwrap();
        let _b = user.allocate_record().await.unwrap();

        assert!(user.remove_record(a).await.unwrap());
        assert!(!user.is_live(a).await.unwrap());
        assert!(!user.remove_record(a).await.unwrap());

        let c = user.allocate_record().await.unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn test_block_list_survives_reload() {
        let dir = TempDir::new().unwrap();
        let (meta, user) = setup(&dir, 64).await;
        let a = user.allocate_record().await.unwrap();

        let reopened = MetaAllocator::new(
            Arc::clone(user.core()),
            "Thing",
            user.first_meta_address(),
            64,
            Some(meta),
        );
        assert!(reopened.is_live(a).await.unwrap());
        assert_eq!(reopened.used_addresses().await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let dir = TempDir::new().unwrap();
        let (_meta, user) = setup(&dir, 100_000).await;
        let user = Arc::new(user);

        let mut handles = Vec::new();
        for _ in 0..40 {
            let user = Arc::clone(&user);
            handles.push(tokio::spawn(async move { user.allocate_record().await.unwrap() }));
        }
        let mut addresses = Vec::new();
        for h in handles {
            addresses.push(h.await.unwrap());
        }
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 40);
        assert_eq!(user.used_count().await.unwrap(), 40);
    }
}
