//! Persistent hash table
//!
//! ```text
//! root:  | bucket count (u32) | reserved (u32) | bucket heads (u64 x count) |
//! chain: $hash record { hash u64 | value u64 | next u64 }
//! ```
//!
//! The table stores `hash -> value` associations where the value is usually
//! a record address. It does not know what a key looks like: callers pass a
//! [`KeyProbe`] that confirms whether a candidate value is the real match.
//!
//! Mutations hold the bucket's writer lock from the `array` pool for the whole
//! critical section, including the caller's create/existing callbacks. Those
//! callbacks may lock buckets of other tables (nested collections) but never a
//! bucket of the same table.

use std::future::Future;

use super::allocator::MetaAllocator;
use super::core::StoreCore;
use super::errors::{StorageError, StorageResult};
use super::file::to_array;

pub const HASH_TABLE_HEADER_SIZE: u64 = 8;
pub const HASH_RECORD_SIZE: u32 = 24;

/// Buckets of a table that owns a whole block (registry, string table).
pub const BLOCK_TABLE_BUCKETS: u32 = 131_071;

/// Buckets of a per-field index table.
pub const INDEX_TABLE_BUCKETS: u32 = 1024;

/// Size of a `$hashtable` record holding an index table.
pub const INDEX_TABLE_RECORD_SIZE: u32 =
    HASH_TABLE_HEADER_SIZE as u32 + INDEX_TABLE_BUCKETS * 8;

/// CRC32 of `bytes`, widened to the table's hash width.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize() as u64
}

/// Confirms that a stored value is the entry the caller is looking for.
pub trait KeyProbe: Sync {
    fn matches(&self, value: u64) -> impl Future<Output = StorageResult<bool>> + Send;
}

/// Probe that matches one exact stored value.
#[derive(Debug, Clone, Copy)]
pub struct ExactValue(pub u64);

impl KeyProbe for ExactValue {
    fn matches(&self, value: u64) -> impl Future<Output = StorageResult<bool>> + Send {
        let expected = self.0;
        async move { Ok(value == expected) }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChainEntry {
    hash: u64,
    value: u64,
    next: u64,
}

impl ChainEntry {
    fn decode(bytes: &[u8]) -> Self {
        Self {
            hash: u64::from_le_bytes(to_array(&bytes[0..8])),
            value: u64::from_le_bytes(to_array(&bytes[8..16])),
            next: u64::from_le_bytes(to_array(&bytes[16..24])),
        }
    }

    fn encode(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.hash.to_le_bytes());
        buf[8..16].copy_from_slice(&self.value.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next.to_le_bytes());
        buf
    }
}

/// Where the link to an entry is stored: a bucket head or a chain `next`.
#[derive(Debug, Clone, Copy)]
enum Link {
    Head(u64),
    Next(u64),
}

impl Link {
    fn address(self) -> u64 {
        match self {
            Link::Head(slot) => slot,
            Link::Next(entry) => entry + 16,
        }
    }
}

/// Cursor over one persistent hash table.
pub struct HashTable<'a> {
    core: &'a StoreCore,
    records: &'a MetaAllocator,
    root: u64,
    buckets: u32,
}

impl<'a> HashTable<'a> {
    /// Writes an empty table at `root`.
    pub async fn create(
        core: &'a StoreCore,
        records: &'a MetaAllocator,
        root: u64,
        buckets: u32,
    ) -> StorageResult<Self> {
        let mut header = Vec::with_capacity(HASH_TABLE_HEADER_SIZE as usize);
        header.extend_from_slice(&buckets.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        core.file.write_bytes(root, &header).await?;
        // Reused slots keep their old bytes.
        core.file
            .write_zeros(root + HASH_TABLE_HEADER_SIZE, buckets as usize * 8)
            .await?;
        Ok(Self {
            core,
            records,
            root,
            buckets,
        })
    }

    /// Cursor over a table whose bucket count is already known.
    pub fn attach(
        core: &'a StoreCore,
        records: &'a MetaAllocator,
        root: u64,
        buckets: u32,
    ) -> Self {
        Self {
            core,
            records,
            root,
            buckets,
        }
    }

    /// Opens an existing table at `root`.
    pub async fn open(
        core: &'a StoreCore,
        records: &'a MetaAllocator,
        root: u64,
    ) -> StorageResult<Self> {
        let buckets = core.file.read_u32(root).await?;
        if buckets == 0 {
            return Err(StorageError::corruption_at_offset(
                root,
                "hash table has zero buckets",
            ));
        }
        Ok(Self {
            core,
            records,
            root,
            buckets,
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    fn bucket_slot(&self, hash: u64) -> u64 {
        self.root + HASH_TABLE_HEADER_SIZE + (hash % self.buckets as u64) * 8
    }

    async fn read_entry(&self, address: u64) -> StorageResult<ChainEntry> {
        self.core
            .read_with(address, HASH_RECORD_SIZE as usize, ChainEntry::decode)
            .await
    }

    /// Finds the entry for `hash` accepted by `probe`, returning its link and
    /// entry address.
    async fn find<P: KeyProbe>(
        &self,
        slot: u64,
        hash: u64,
        probe: &P,
    ) -> StorageResult<Option<(Link, u64, ChainEntry)>> {
        let mut link = Link::Head(slot);
        let mut current = self.core.file.read_u64(slot).await?;
        while current != 0 {
            let entry = self.read_entry(current).await?;
            if entry.hash == hash && probe.matches(entry.value).await? {
                return Ok(Some((link, current, entry)));
            }
            link = Link::Next(current);
            current = entry.next;
        }
        Ok(None)
    }

    /// Looks up the value stored for `hash` that `probe` accepts.
    pub async fn get<P: KeyProbe>(&self, hash: u64, probe: &P) -> StorageResult<Option<u64>> {
        let slot = self.bucket_slot(hash);
        let _guard = self.core.locks.array.read(slot).await;
        Ok(self.find(slot, hash, probe).await?.map(|(_, _, e)| e.value))
    }

    /// Runs `read` on the value `probe` accepts while the bucket stays
    /// read-locked, so nested structures hanging off the value cannot change
    /// underneath it.
    pub async fn get_with<P, F, Fut, T>(
        &self,
        hash: u64,
        probe: &P,
        read: F,
    ) -> StorageResult<Option<T>>
    where
        P: KeyProbe,
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let slot = self.bucket_slot(hash);
        let _guard = self.core.locks.array.read(slot).await;
        match self.find(slot, hash, probe).await? {
            Some((_, _, entry)) => Ok(Some(read(entry.value).await?)),
            None => Ok(None),
        }
    }

    /// Upserts the entry for `hash`.
    ///
    /// When no entry matches, `on_create` supplies the value to insert; when
    /// one does, `on_existing` receives its value and returns the replacement.
    /// Either callback may return `None`: for `on_create` nothing is stored,
    /// for `on_existing` the entry is removed. Returns the value left in the
    /// table.
    pub async fn update<P, C, CF, X, XF, E>(
        &self,
        hash: u64,
        probe: &P,
        on_create: C,
        on_existing: X,
    ) -> Result<Option<u64>, E>
    where
        P: KeyProbe,
        C: FnOnce() -> CF,
        CF: Future<Output = Result<Option<u64>, E>>,
        X: FnOnce(u64) -> XF,
        XF: Future<Output = Result<Option<u64>, E>>,
        E: From<StorageError>,
    {
        let slot = self.bucket_slot(hash);
        let _guard = self.core.locks.array.write(slot).await;

        match self.find(slot, hash, probe).await? {
            Some((link, address, entry)) => match on_existing(entry.value).await? {
                Some(value) => {
                    if value != entry.value {
                        self.core.file.write_u64(address + 8, value).await?;
                    }
                    Ok(Some(value))
                }
                None => {
                    self.unlink(link, address, entry).await?;
                    Ok(None)
                }
            },
            None => match on_create().await? {
                Some(value) => {
                    self.push_front(slot, hash, value).await?;
                    Ok(Some(value))
                }
                None => Ok(None),
            },
        }
    }

    /// Stores `value` for `hash`, overwriting the entry `probe` accepts.
    pub async fn set<P: KeyProbe>(&self, hash: u64, probe: &P, value: u64) -> StorageResult<()> {
        self.update(
            hash,
            probe,
            || async move { Ok::<_, StorageError>(Some(value)) },
            |_| async move { Ok(Some(value)) },
        )
        .await
        .map(|_| ())
    }

    /// Adds an entry without looking for an existing one.
    pub async fn insert(&self, hash: u64, value: u64) -> StorageResult<()> {
        let slot = self.bucket_slot(hash);
        let _guard = self.core.locks.array.write(slot).await;
        self.push_front(slot, hash, value).await
    }

    /// Removes the entry `probe` accepts. Returns the removed value.
    pub async fn remove<P: KeyProbe>(&self, hash: u64, probe: &P) -> StorageResult<Option<u64>> {
        let slot = self.bucket_slot(hash);
        let _guard = self.core.locks.array.write(slot).await;
        match self.find(slot, hash, probe).await? {
            Some((link, address, entry)) => {
                self.unlink(link, address, entry).await?;
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Removes the entry storing exactly `value` under `hash`.
    pub async fn remove_value(&self, hash: u64, value: u64) -> StorageResult<bool> {
        Ok(self.remove(hash, &ExactValue(value)).await?.is_some())
    }

    async fn push_front(&self, slot: u64, hash: u64, value: u64) -> StorageResult<()> {
        let head = self.core.file.read_u64(slot).await?;
        let address = self.records.allocate_record().await?;
        let entry = ChainEntry {
            hash,
            value,
            next: head,
        };
        self.core.file.write_bytes(address, &entry.encode()).await?;
        self.core.file.write_u64(slot, address).await
    }

    async fn unlink(&self, link: Link, address: u64, entry: ChainEntry) -> StorageResult<()> {
        self.core.file.write_u64(link.address(), entry.next).await?;
        self.records.remove_record(address).await?;
        Ok(())
    }

    /// Every `(hash, value)` pair in bucket order.
    ///
    /// Walks without bucket locks; callers use it for scans and diagnostics.
    pub async fn entries(&self) -> StorageResult<Vec<(u64, u64)>> {
        let heads: Vec<u64> = self
            .core
            .read_with(
                self.root + HASH_TABLE_HEADER_SIZE,
                self.buckets as usize * 8,
                |bytes| {
                    bytes
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes(to_array(c)))
                        .filter(|head| *head != 0)
                        .collect()
                },
            )
            .await?;

        let mut out = Vec::new();
        for head in heads {
            let mut current = head;
            while current != 0 {
                let entry = self.read_entry(current).await?;
                out.push((entry.hash, entry.value));
                current = entry.next;
            }
        }
        Ok(out)
    }

    /// Whether the table holds no entries.
    pub async fn is_empty(&self) -> StorageResult<bool> {
        let heads = self
            .core
            .read_with(
                self.root + HASH_TABLE_HEADER_SIZE,
                self.buckets as usize * 8,
                |bytes| bytes.iter().all(|b| *b == 0),
            )
            .await?;
        Ok(heads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::FIRST_DYNAMIC_BLOCK_ADDRESS;
    use crate::storage::meta::{MetaRecord, META_RECORD_SIZE};
    use crate::storage::statistical::StatisticalBlock;
    use crate::storage::FileHandle;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        core: Arc<StoreCore>,
        hash_records: MetaAllocator,
        tables: MetaAllocator,
    }

    async fn fixture(dir: &TempDir) -> Fixture {
        let file = FileHandle::open(&dir.path().join("db.obj")).await.unwrap();
        let core = Arc::new(StoreCore::new(file, FIRST_DYNAMIC_BLOCK_ADDRESS, 8, 4, false));

        let meta_block = core.blocks.allocate_block().await.unwrap();
        let stat = StatisticalBlock::new(&core, meta_block, META_RECORD_SIZE);
        stat.initialize().await.unwrap();
        let first = stat.allocate_record().await.unwrap().unwrap();
        let node = MetaRecord::new(&core, first);
        node.write_new("$meta", META_RECORD_SIZE, 0, first).await.unwrap();
        node.push_block(0, meta_block).await.unwrap();
        let meta = Arc::new(MetaAllocator::new(
            Arc::clone(&core),
            "$meta",
            first,
            META_RECORD_SIZE,
            None,
        ));

        let make = |name: &'static str, size: u32| {
            let meta = Arc::clone(&meta);
            let core = Arc::clone(&core);
            async move {
                let first = meta.allocate_record().await.unwrap();
                MetaRecord::new(&core, first)
                    .write_new(name, size, 0, first)
                    .await
                    .unwrap();
                MetaAllocator::new(core, name, first, size, Some(meta))
            }
        };
        let hash_records = make("$hash", HASH_RECORD_SIZE).await;
        let tables = make("$hashtable", INDEX_TABLE_RECORD_SIZE).await;
        Fixture {
            core,
            hash_records,
            tables,
        }
    }

    #[test]
    fn test_hash_key_is_crc32() {
        assert_eq!(hash_key(b""), 0);
        assert_eq!(hash_key(b"123456789"), 0xCBF4_3926);
    }

    #[tokio::test]
    async fn test_set_get_overwrite_remove() {
        let dir = TempDir::new().unwrap();
        let f = fixture(&dir).await;
        let root = f.tables.allocate_record().await.unwrap();
        let table = HashTable::create(&f.core, &f.hash_records, root, INDEX_TABLE_BUCKETS)
            .await
            .unwrap();

        let any = ExactValue(100);
        table.set(7, &any, 100).await.unwrap();
        assert_eq!(table.get(7, &ExactValue(100)).await.unwrap(), Some(100));
        assert_eq!(table.get(7, &ExactValue(101)).await.unwrap(), None);
        assert_eq!(table.get(8, &ExactValue(100)).await.unwrap(), None);

        assert!(table.remove_value(7, 100).await.unwrap());
        assert!(!table.remove_value(7, 100).await.unwrap());
        assert!(table.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_collisions_resolved_by_probe() {
        let dir = TempDir::new().unwrap();
        let f = fixture(&dir).await;
        let root = f.tables.allocate_record().await.unwrap();
        let table = HashTable::create(&f.core, &f.hash_records, root, INDEX_TABLE_BUCKETS)
            .await
            .unwrap();

        // Same hash, same bucket, different values.
        for v in [10u64, 20, 30] {
            table.set(5, &ExactValue(v), v).await.unwrap();
        }
        for v in [10u64, 20, 30] {
            assert_eq!(table.get(5, &ExactValue(v)).await.unwrap(), Some(v));
        }
        // Remove from the middle of the chain.
        assert!(table.remove_value(5, 20).await.unwrap());
        assert_eq!(table.get(5, &ExactValue(10)).await.unwrap(), Some(10));
        assert_eq!(table.get(5, &ExactValue(30)).await.unwrap(), Some(30));

        let mut entries = table.entries().await.unwrap();
        entries.sort_unstable();
        assert_eq!(entries, vec![(5, 10), (5, 30)]);
    }

    #[tokio::test]
    async fn test_update_callbacks() {
        let dir = TempDir::new().unwrap();
        let f = fixture(&dir).await;
        let root = f.tables.allocate_record().await.unwrap();
        let table = HashTable::create(&f.core, &f.hash_records, root, INDEX_TABLE_BUCKETS)
            .await
            .unwrap();

        struct AnyValue;
        impl KeyProbe for AnyValue {
            fn matches(&self, _value: u64) -> impl Future<Output = StorageResult<bool>> + Send {
                async { Ok(true) }
            }
        }

        // on_create declining leaves the table empty.
        let stored = table
            .update(3, &AnyValue, || async { Ok::<_, StorageError>(None) }, |v| async move {
                Ok(Some(v))
            })
            .await
            .unwrap();
        assert_eq!(stored, None);
        assert!(table.is_empty().await.unwrap());

        let stored = table
            .update(3, &AnyValue, || async { Ok::<_, StorageError>(Some(1)) }, |v| async move {
                Ok(Some(v + 1))
            })
            .await
            .unwrap();
        assert_eq!(stored, Some(1));

        let stored = table
            .update(3, &AnyValue, || async { Ok::<_, StorageError>(Some(1)) }, |v| async move {
                Ok(Some(v + 1))
            })
            .await
            .unwrap();
        assert_eq!(stored, Some(2));

        // on_existing returning None deletes.
        let stored = table
            .update(3, &AnyValue, || async { Ok::<_, StorageError>(None) }, |_| async {
                Ok(None)
            })
            .await
            .unwrap();
        assert_eq!(stored, None);
        assert_eq!(table.get(3, &AnyValue).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_and_reused_root_is_cleared() {
        let dir = TempDir::new().unwrap();
        let f = fixture(&dir).await;
        let root = f.tables.allocate_record().await.unwrap();
        {
            let table = HashTable::create(&f.core, &f.hash_records, root, INDEX_TABLE_BUCKETS)
                .await
                .unwrap();
            table.set(1, &ExactValue(9), 9).await.unwrap();
        }
        let reopened = HashTable::open(&f.core, &f.hash_records, root).await.unwrap();
        assert_eq!(reopened.get(1, &ExactValue(9)).await.unwrap(), Some(9));

        let fresh = HashTable::create(&f.core, &f.hash_records, root, INDEX_TABLE_BUCKETS)
            .await
            .unwrap();
        assert!(fresh.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_sets_on_one_bucket() {
        let dir = TempDir::new().unwrap();
        let f = Arc::new(fixture(&dir).await);
        let root = f.tables.allocate_record().await.unwrap();
        HashTable::create(&f.core, &f.hash_records, root, INDEX_TABLE_BUCKETS)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for v in 1..=32u64 {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                let table = HashTable::open(&f.core, &f.hash_records, root).await.unwrap();
                table.set(42, &ExactValue(v), v).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let table = HashTable::open(&f.core, &f.hash_records, root).await.unwrap();
        assert_eq!(table.entries().await.unwrap().len(), 32);
    }
}
