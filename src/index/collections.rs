//! Address collections behind multimap keys
//!
//! ```text
//! $array chunk: | count (u32) | pad (u32) | next (u64) | 62 x address (u64) |
//! ```
//!
//! An [`AddressChain`] is a list of chunks whose head address never moves.
//! Only the head chunk may be empty, and only when the whole chain is. An
//! [`AddressSet`] is a nested hash table keyed by the CRC32 of the address.
//!
//! Both are mutated only while the owning field table's bucket is
//! write-locked, so they carry no locks of their own.

use crate::storage::{
    hash_key, to_array, ExactValue, HashTable, MetaAllocator, StorageResult, StoreCore,
    INDEX_TABLE_BUCKETS,
};

pub const CHUNK_RECORD_SIZE: u32 = 512;
pub const CHUNK_CAPACITY: usize = 62;
const CHUNK_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Default)]
struct Chunk {
    next: u64,
    slots: Vec<u64>,
}

impl Chunk {
    fn decode(bytes: &[u8]) -> Self {
        let count = (u32::from_le_bytes(to_array(&bytes[0..4])) as usize).min(CHUNK_CAPACITY);
        let next = u64::from_le_bytes(to_array(&bytes[8..16]));
        let slots = bytes[CHUNK_HEADER_SIZE..]
            .chunks_exact(8)
            .take(count)
            .map(|c| u64::from_le_bytes(to_array(c)))
            .collect();
        Self { next, slots }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + self.slots.len() * 8);
        buf.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.next.to_le_bytes());
        for slot in &self.slots {
            buf.extend_from_slice(&slot.to_le_bytes());
        }
        buf
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= CHUNK_CAPACITY
    }
}

/// Chunked list of record addresses rooted at a fixed head chunk.
pub struct AddressChain<'a> {
    core: &'a StoreCore,
    chunks: &'a MetaAllocator,
    head: u64,
}

impl<'a> AddressChain<'a> {
    /// Allocates an empty head chunk.
    pub async fn create(core: &StoreCore, chunks: &MetaAllocator) -> StorageResult<u64> {
        let head = chunks.allocate_record().await?;
        core.file.write_bytes(head, &Chunk::default().encode()).await?;
        Ok(head)
    }

    pub fn new(core: &'a StoreCore, chunks: &'a MetaAllocator, head: u64) -> Self {
        Self { core, chunks, head }
    }

    async fn read_chunk(&self, address: u64) -> StorageResult<Chunk> {
        self.core
            .read_with(address, CHUNK_RECORD_SIZE as usize, Chunk::decode)
            .await
    }

    async fn write_chunk(&self, address: u64, chunk: &Chunk) -> StorageResult<()> {
        self.core.file.write_bytes(address, &chunk.encode()).await
    }

    async fn load(&self) -> StorageResult<Vec<(u64, Chunk)>> {
        let mut out = Vec::new();
        let mut current = self.head;
        while current != 0 {
            let chunk = self.read_chunk(current).await?;
            let next = chunk.next;
            out.push((current, chunk));
            current = next;
        }
        Ok(out)
    }

    /// Appends `address`. With `distinct`, an address already present is not
    /// added again. Returns whether it was added.
    pub async fn add(&self, address: u64, distinct: bool) -> StorageResult<bool> {
        let mut chain = self.load().await?;
        if distinct && chain.iter().any(|(_, c)| c.slots.contains(&address)) {
            return Ok(false);
        }

        if let Some((at, chunk)) = chain.iter_mut().find(|(_, c)| !c.is_full()) {
            chunk.slots.push(address);
            self.write_chunk(*at, chunk).await?;
            return Ok(true);
        }

        let fresh = self.chunks.allocate_record().await?;
        self.write_chunk(
            fresh,
            &Chunk {
                next: 0,
                slots: vec![address],
            },
        )
        .await?;
        if let Some((tail, chunk)) = chain.last_mut() {
            chunk.next = fresh;
            self.write_chunk(*tail, chunk).await?;
        }
        Ok(true)
    }

    /// Removes one occurrence of `address`. Returns whether it was present.
    pub async fn remove(&self, address: u64) -> StorageResult<bool> {
        let mut chain = self.load().await?;
        let Some(position) = chain
            .iter()
            .position(|(_, c)| c.slots.contains(&address))
        else {
            return Ok(false);
        };

        let (at, chunk) = &mut chain[position];
        if let Some(slot) = chunk.slots.iter().position(|a| *a == address) {
            chunk.slots.swap_remove(slot);
        }
        if !chunk.slots.is_empty() {
            self.write_chunk(*at, chunk).await?;
            return Ok(true);
        }

        if position > 0 {
            let emptied = *at;
            let next = chunk.next;
            let (prev_at, prev) = &mut chain[position - 1];
            prev.next = next;
            self.write_chunk(*prev_at, prev).await?;
            self.chunks.remove_record(emptied).await?;
        } else if chunk.next != 0 {
            let follower = chunk.next;
            let moved = self.read_chunk(follower).await?;
            self.write_chunk(self.head, &moved).await?;
            self.chunks.remove_record(follower).await?;
        } else {
            self.write_chunk(self.head, chunk).await?;
        }
        Ok(true)
    }

    /// Every address in chain order.
    pub async fn addresses(&self) -> StorageResult<Vec<u64>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .flat_map(|(_, c)| c.slots)
            .collect())
    }

    pub async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.read_chunk(self.head).await?.slots.is_empty())
    }

    /// Frees every chunk, the head included.
    pub async fn free(&self) -> StorageResult<()> {
        for (at, _) in self.load().await? {
            self.chunks.remove_record(at).await?;
        }
        Ok(())
    }
}

/// Set of record addresses in a nested hash table.
pub struct AddressSet<'a> {
    table: HashTable<'a>,
}

impl<'a> AddressSet<'a> {
    /// Allocates an empty nested table.
    pub async fn create(
        core: &StoreCore,
        tables: &MetaAllocator,
        hashes: &MetaAllocator,
    ) -> StorageResult<u64> {
        let root = tables.allocate_record().await?;
        HashTable::create(core, hashes, root, INDEX_TABLE_BUCKETS).await?;
        Ok(root)
    }

    pub fn new(core: &'a StoreCore, hashes: &'a MetaAllocator, root: u64) -> Self {
        Self {
            table: HashTable::attach(core, hashes, root, INDEX_TABLE_BUCKETS),
        }
    }

    fn hash(address: u64) -> u64 {
        hash_key(&address.to_le_bytes())
    }

    /// Adds `address`; a no-op when present. Returns whether it was added.
    pub async fn add(&self, address: u64) -> StorageResult<bool> {
        let hash = Self::hash(address);
        if self.table.get(hash, &ExactValue(address)).await?.is_some() {
            return Ok(false);
        }
        self.table.insert(hash, address).await?;
        Ok(true)
    }

    pub async fn remove(&self, address: u64) -> StorageResult<bool> {
        self.table.remove_value(Self::hash(address), address).await
    }

    pub async fn addresses(&self) -> StorageResult<Vec<u64>> {
        let mut out: Vec<u64> = self
            .table
            .entries()
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    pub async fn is_empty(&self) -> StorageResult<bool> {
        self.table.is_empty().await
    }

    /// Frees the chain records and the table record itself.
    pub async fn free(&self, tables: &MetaAllocator) -> StorageResult<()> {
        for address in self.addresses().await? {
            self.remove(address).await?;
        }
        tables.remove_record(self.table.root()).await?;
        Ok(())
    }
}
