use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::storage::layout::STRING_SET_BLOCK_ADDRESS;
use crate::storage::{
    hash_key, to_array, ExactValue, HashTable, KeyProbe, MetaAllocator, StorageError,
    StorageResult, StoreCore, BLOCK_TABLE_BUCKETS,
};

/// Payload capacities of the `$string.<class>` schemas, ascending.
pub const STRING_CLASSES: [u32; 6] = [64, 256, 1024, 4096, 16384, 65536];

pub const STRING_ENTRY_HEADER_SIZE: u32 = 16;

/// Index into [`STRING_CLASSES`] of the smallest class holding `len` bytes.
pub fn class_for(len: usize) -> StorageResult<usize> {
    STRING_CLASSES
        .iter()
        .position(|class| len <= *class as usize)
        .ok_or_else(|| {
            StorageError::unsupported_size(format!(
                "string of {} bytes exceeds the largest class of {} bytes",
                len,
                STRING_CLASSES[STRING_CLASSES.len() - 1]
            ))
        })
}

#[derive(Debug, Clone, Copy)]
struct EntryHeader {
    refcount: u32,
    len: u32,
    class: u32,
    crc: u32,
}

impl EntryHeader {
    fn decode(bytes: &[u8]) -> Self {
        Self {
            refcount: u32::from_le_bytes(to_array(&bytes[0..4])),
            len: u32::from_le_bytes(to_array(&bytes[4..8])),
            class: u32::from_le_bytes(to_array(&bytes[8..12])),
            crc: u32::from_le_bytes(to_array(&bytes[12..16])),
        }
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Matches string-table values whose entry holds exactly `text`.
struct TextProbe<'a> {
    core: &'a StoreCore,
    text: &'a [u8],
    crc: u32,
}

impl KeyProbe for TextProbe<'_> {
    fn matches(&self, value: u64) -> impl Future<Output = StorageResult<bool>> + Send {
        async move {
            let header = self
                .core
                .read_with(value, STRING_ENTRY_HEADER_SIZE as usize, EntryHeader::decode)
                .await?;
            if header.len as usize != self.text.len() || header.crc != self.crc {
                return Ok(false);
            }
            let stored = self
                .core
                .read_with(
                    value + STRING_ENTRY_HEADER_SIZE as u64,
                    header.len as usize,
                    |bytes| bytes == self.text,
                )
                .await?;
            Ok(stored)
        }
    }
}

/// The shared, reference-counted string set.
pub struct StringHashSet {
    core: Arc<StoreCore>,
    hash_records: Arc<MetaAllocator>,
    classes: Vec<Arc<MetaAllocator>>,
}

impl StringHashSet {
    /// `classes` must follow the order of [`STRING_CLASSES`].
    pub fn new(
        core: Arc<StoreCore>,
        hash_records: Arc<MetaAllocator>,
        classes: Vec<Arc<MetaAllocator>>,
    ) -> StorageResult<Self> {
        if classes.len() != STRING_CLASSES.len() {
            return Err(StorageError::data_corruption(format!(
                "expected {} string classes, found {}",
                STRING_CLASSES.len(),
                classes.len()
            )));
        }
        Ok(Self {
            core,
            hash_records,
            classes,
        })
    }

    fn table(&self) -> HashTable<'_> {
        HashTable::attach(
            &self.core,
            &self.hash_records,
            STRING_SET_BLOCK_ADDRESS,
            BLOCK_TABLE_BUCKETS,
        )
    }

    /// Handle of the entry holding `text`, creating it when absent, with one
    /// more reference taken.
    pub async fn borrow(&self, text: &str) -> StorageResult<u64> {
        let bytes = text.as_bytes();
        let class = class_for(bytes.len())?;
        let probe = TextProbe {
            core: &self.core,
            text: bytes,
            crc: checksum(bytes),
        };

        let stored = self
            .table()
            .update(
                hash_key(bytes),
                &probe,
                || async move { self.create_entry(class, bytes).await.map(Some) },
                |handle| async move {
                    self.increase(handle).await?;
                    Ok(Some(handle))
                },
            )
            .await?;
        stored.ok_or_else(|| StorageError::data_corruption("string table dropped a new entry"))
    }

    /// Stores `text` as a fresh entry even if an equal one exists, with one
    /// reference taken.
    ///
    /// For callers that deduplicate on their own and need a handle that starts
    /// with exactly one holder. A later [`borrow`](Self::borrow) of equal text
    /// may resolve to the fresh entry.
    pub async fn new_entry(&self, text: &str) -> StorageResult<u64> {
        let bytes = text.as_bytes();
        let class = class_for(bytes.len())?;
        let handle = self.create_entry(class, bytes).await?;
        self.table().insert(hash_key(bytes), handle).await?;
        Ok(handle)
    }

    /// Handle of the entry holding `text`, without taking a reference.
    pub async fn find(&self, text: &str) -> StorageResult<Option<u64>> {
        let bytes = text.as_bytes();
        let probe = TextProbe {
            core: &self.core,
            text: bytes,
            crc: checksum(bytes),
        };
        self.table().get(hash_key(bytes), &probe).await
    }

    /// Text of a live entry.
    pub async fn read(&self, handle: u64) -> StorageResult<String> {
        let header = self.live_header(handle).await?;
        let payload = self
            .core
            .file
            .read_bytes(handle + STRING_ENTRY_HEADER_SIZE as u64, header.len as usize)
            .await?;
        if checksum(&payload) != header.crc {
            return Err(StorageError::corruption_at_offset(
                handle,
                "string checksum mismatch",
            ));
        }
        String::from_utf8(payload)
            .map_err(|_| StorageError::corruption_at_offset(handle, "string is not utf-8"))
    }

    /// Takes one more reference on a live entry.
    pub async fn increase(&self, handle: u64) -> StorageResult<u32> {
        let _guard = self.core.locks.used_count.write(handle).await;
        let count = self.core.file.read_u32(handle).await?;
        if count == 0 {
            return Err(StorageError::record_not_found(handle));
        }
        self.core.file.write_u32(handle, count + 1).await?;
        Ok(count + 1)
    }

    /// Drops one reference. The entry is unlinked and freed when the last
    /// reference goes. Returns the references left.
    pub async fn release(&self, handle: u64) -> StorageResult<u32> {
        let text = self.read(handle).await?;
        let left_after = AtomicU32::new(0);
        let remaining = &left_after;

        self.table()
            .update(
                hash_key(text.as_bytes()),
                &ExactValue(handle),
                || async move { Err(StorageError::record_not_found(handle)) },
                |handle| async move {
                    let left = self.decrement(handle).await?;
                    remaining.store(left, Ordering::Relaxed);
                    Ok(if left == 0 { None } else { Some(handle) })
                },
            )
            .await?;
        Ok(left_after.load(Ordering::Relaxed))
    }

    async fn decrement(&self, handle: u64) -> StorageResult<u32> {
        let _guard = self.core.locks.used_count.write(handle).await;
        let count = self.core.file.read_u32(handle).await?;
        if count <= 1 {
            self.core.file.write_u32(handle, 0).await?;
            let header = self.live_header(handle).await?;
            self.class_allocator(header.class, handle)?
                .remove_record(handle)
                .await?;
            return Ok(0);
        }
        self.core.file.write_u32(handle, count - 1).await?;
        Ok(count - 1)
    }

    /// Reference count of `handle`; zero once it is freed.
    pub async fn refcount(&self, handle: u64) -> StorageResult<u32> {
        match self.live_header(handle).await {
            Ok(header) => Ok(header.refcount),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Number of distinct texts stored.
    pub async fn len(&self) -> StorageResult<usize> {
        Ok(self.table().entries().await?.len())
    }

    pub async fn is_empty(&self) -> StorageResult<bool> {
        self.table().is_empty().await
    }

    async fn create_entry(&self, class: usize, bytes: &[u8]) -> StorageResult<u64> {
        let allocator = &self.classes[class];
        let handle = allocator.allocate_record().await?;

        let mut entry = Vec::with_capacity(STRING_ENTRY_HEADER_SIZE as usize + bytes.len());
        entry.extend_from_slice(&1u32.to_le_bytes());
        entry.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        entry.extend_from_slice(&STRING_CLASSES[class].to_le_bytes());
        entry.extend_from_slice(&checksum(bytes).to_le_bytes());
        entry.extend_from_slice(bytes);
        self.core.file.write_bytes(handle, &entry).await?;
        Ok(handle)
    }

    fn class_allocator(&self, class: u32, handle: u64) -> StorageResult<&Arc<MetaAllocator>> {
        STRING_CLASSES
            .iter()
            .position(|c| *c == class)
            .map(|index| &self.classes[index])
            .ok_or_else(|| StorageError::corruption_at_offset(handle, "unknown string class"))
    }

    async fn live_header(&self, handle: u64) -> StorageResult<EntryHeader> {
        let header = self
            .core
            .read_with(handle, STRING_ENTRY_HEADER_SIZE as usize, EntryHeader::decode)
            .await?;
        let Ok(allocator) = self.class_allocator(header.class, handle) else {
            return Err(StorageError::record_not_found(handle));
        };
        if !allocator.is_live(handle).await? {
            return Err(StorageError::record_not_found(handle));
        }
        Ok(header)
    }
}

/// String set over fresh allocators, with zeroed buckets at the fixed table
/// address.
#[cfg(test)]
pub(crate) async fn test_set(core: &Arc<StoreCore>, meta: &Arc<MetaAllocator>) -> StringHashSet {
    use crate::storage::test_support::allocator;
    use crate::storage::HASH_RECORD_SIZE;

    core.file
        .write_zeros(STRING_SET_BLOCK_ADDRESS, 8 + BLOCK_TABLE_BUCKETS as usize * 8)
        .await
        .unwrap();
    core.file
        .write_u32(STRING_SET_BLOCK_ADDRESS, BLOCK_TABLE_BUCKETS)
        .await
        .unwrap();

    let hashes = allocator(core, meta, "$hash", HASH_RECORD_SIZE).await;
    let mut classes = Vec::new();
    for class in STRING_CLASSES {
        let name = format!("$string.{}", class);
        classes.push(allocator(core, meta, &name, STRING_ENTRY_HEADER_SIZE + class).await);
    }
    StringHashSet::new(Arc::clone(core), hashes, classes).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::meta_fixture;
    use tempfile::TempDir;

    async fn string_set(dir: &TempDir) -> StringHashSet {
        let (core, meta) = meta_fixture(dir).await;
        test_set(&core, &meta).await
    }

    #[test]
    fn test_class_selection() {
        assert_eq!(class_for(0).unwrap(), 0);
        assert_eq!(class_for(64).unwrap(), 0);
        assert_eq!(class_for(65).unwrap(), 1);
        assert_eq!(class_for(65536).unwrap(), 5);
        assert!(class_for(65537).unwrap_err().code().code() == "OBJ_UNSUPPORTED_SIZE");
    }

    #[tokio::test]
    async fn test_borrow_shares_one_entry() {
        let dir = TempDir::new().unwrap();
        let set = string_set(&dir).await;

        let a = set.borrow("Alice").await.unwrap();
        let b = set.borrow("Alice").await.unwrap();
        let c = set.borrow("Bob").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(set.refcount(a).await.unwrap(), 2);
        assert_eq!(set.read(a).await.unwrap(), "Alice");
        assert_eq!(set.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_frees_at_zero() {
        let dir = TempDir::new().unwrap();
        let set = string_set(&dir).await;

        let handle = set.borrow("temp").await.unwrap();
        set.borrow("temp").await.unwrap();

        assert_eq!(set.release(handle).await.unwrap(), 1);
        assert_eq!(set.find("temp").await.unwrap(), Some(handle));
        assert_eq!(set.release(handle).await.unwrap(), 0);

        assert_eq!(set.find("temp").await.unwrap(), None);
        assert_eq!(set.refcount(handle).await.unwrap(), 0);
        assert!(set.read(handle).await.unwrap_err().is_not_found());
        assert!(set.release(handle).await.is_err());
        assert!(set.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_large_text_uses_larger_class() {
        let dir = TempDir::new().unwrap();
        let set = string_set(&dir).await;

        let text = "x".repeat(3000);
        let handle = set.borrow(&text).await.unwrap();
        assert_eq!(set.read(handle).await.unwrap(), text);

        let too_big = "y".repeat(70_000);
        assert!(set.borrow(&too_big).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_string() {
        let dir = TempDir::new().unwrap();
        let set = string_set(&dir).await;
        let handle = set.borrow("").await.unwrap();
        assert_eq!(set.read(handle).await.unwrap(), "");
        assert_eq!(set.borrow("").await.unwrap(), handle);
    }

    #[tokio::test]
    async fn test_new_entry_does_not_deduplicate() {
        let dir = TempDir::new().unwrap();
        let set = string_set(&dir).await;

        let shared = set.borrow("dup").await.unwrap();
        let fresh = set.new_entry("dup").await.unwrap();
        assert_ne!(shared, fresh);
        assert_eq!(set.refcount(fresh).await.unwrap(), 1);

        set.release(fresh).await.unwrap();
        assert_eq!(set.read(shared).await.unwrap(), "dup");
    }

    #[tokio::test]
    async fn test_concurrent_borrows_of_one_text() {
        let dir = TempDir::new().unwrap();
        let set = Arc::new(string_set(&dir).await);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let set = Arc::clone(&set);
            tasks.push(tokio::spawn(async move { set.borrow("shared").await.unwrap() }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        handles.dedup();
        assert_eq!(handles.len(), 1);
        assert_eq!(set.refcount(handles[0]).await.unwrap(), 32);
    }
}
