//! Index maintenance for one mapped field
//!
//! Every mapped field owns a `$hashtable` with 1024 buckets whose root is the
//! field's mapping address.
//!
//! - `master` / `index`: key -> record address. The probe compares the key
//!   with the bytes stored in the candidate record, so no key copy is kept.
//!   Adding an existing key overwrites it; removal matches the exact address.
//! - `index_array`, `index_small_hash_set`: key -> `$kv` record -> address
//!   chain (multiset for arrays, distinct for the small set).
//! - `index_hash_set`: key -> `$kv` record -> nested address table.
//!
//! Collections are mutated inside the field table's bucket critical section.
//! A reference-string key is the 8-byte handle and takes no reference of its
//! own: callers remove index entries before releasing the record's strings.

use std::future::Future;
use std::sync::Arc;

use super::collections::{AddressChain, AddressSet};
use super::errors::{IndexError, IndexResult};
use super::keys::{index_keys, kv_class, KV_WIDTHS};
use crate::schema::{Field, FieldSlot, FieldValue, MapType, SchemaError};
use crate::storage::{
    hash_key, HashTable, KeyProbe, MetaAllocator, StorageError, StorageResult, StoreCore,
    INDEX_TABLE_BUCKETS,
};

/// Native allocators backing every index structure.
pub struct IndexStore {
    core: Arc<StoreCore>,
    hashes: Arc<MetaAllocator>,
    tables: Arc<MetaAllocator>,
    chunks: Arc<MetaAllocator>,
    kv: Vec<Arc<MetaAllocator>>,
}

impl IndexStore {
    /// `kv` must follow the order of [`KV_WIDTHS`].
    pub fn new(
        core: Arc<StoreCore>,
        hashes: Arc<MetaAllocator>,
        tables: Arc<MetaAllocator>,
        chunks: Arc<MetaAllocator>,
        kv: Vec<Arc<MetaAllocator>>,
    ) -> StorageResult<Self> {
        if kv.len() != KV_WIDTHS.len() {
            return Err(StorageError::data_corruption(format!(
                "expected {} key-value classes, found {}",
                KV_WIDTHS.len(),
                kv.len()
            )));
        }
        Ok(Self {
            core,
            hashes,
            tables,
            chunks,
            kv,
        })
    }

    /// Allocates an empty field table and returns its root.
    pub async fn create_table(&self) -> StorageResult<u64> {
        let root = self.tables.allocate_record().await?;
        HashTable::create(&self.core, &self.hashes, root, INDEX_TABLE_BUCKETS).await?;
        Ok(root)
    }

    /// Index of `field`, rooted at its mapping address.
    pub fn field<'a>(&'a self, field: &'a Field, slot: FieldSlot, root: u64) -> FieldIndex<'a> {
        FieldIndex {
            store: self,
            field,
            slot,
            root,
        }
    }
}

/// Matches unique-index values whose record holds `key` in the field slot.
struct RecordProbe<'a> {
    core: &'a StoreCore,
    slot: FieldSlot,
    key: &'a [u8],
}

impl KeyProbe for RecordProbe<'_> {
    fn matches(&self, value: u64) -> impl Future<Output = StorageResult<bool>> + Send {
        async move {
            if self.key.len() != self.slot.size as usize {
                return Ok(false);
            }
            self.core
                .read_with(value + self.slot.offset as u64, self.key.len(), |bytes| {
                    bytes == self.key
                })
                .await
        }
    }
}

/// Matches `$kv` records whose key bytes equal the padded key.
struct KvProbe<'a> {
    core: &'a StoreCore,
    key: &'a [u8],
}

impl KeyProbe for KvProbe<'_> {
    fn matches(&self, value: u64) -> impl Future<Output = StorageResult<bool>> + Send {
        async move {
            self.core
                .read_with(value, self.key.len(), |bytes| bytes == self.key)
                .await
        }
    }
}

pub struct FieldIndex<'a> {
    store: &'a IndexStore,
    field: &'a Field,
    slot: FieldSlot,
    root: u64,
}

impl FieldIndex<'_> {
    fn table(&self) -> HashTable<'_> {
        HashTable::attach(
            &self.store.core,
            &self.store.hashes,
            self.root,
            INDEX_TABLE_BUCKETS,
        )
    }

    fn unsupported(&self) -> IndexError {
        SchemaError::unsupported_type(format!(
            "field {} has no index structure",
            self.field.name
        ))
        .into()
    }

    /// Adds `address` under every key of a stored value.
    pub async fn add(&self, address: u64, value: &FieldValue<u64>) -> IndexResult<()> {
        for key in index_keys(self.field, value)? {
            self.add_key(address, &key).await?;
        }
        Ok(())
    }

    /// Removes `address` from under every key of a stored value.
    pub async fn remove(&self, address: u64, value: &FieldValue<u64>) -> IndexResult<()> {
        for key in index_keys(self.field, value)? {
            self.remove_key(address, &key).await?;
        }
        Ok(())
    }

    pub async fn add_key(&self, address: u64, key: &[u8]) -> IndexResult<()> {
        match self.field.map_type {
            MapType::None => Err(self.unsupported()),
            MapType::Master | MapType::Index => {
                let probe = self.record_probe(key);
                self.table().set(hash_key(key), &probe, address).await?;
                Ok(())
            }
            _ => self.add_to_collection(address, key).await,
        }
    }

    pub async fn remove_key(&self, address: u64, key: &[u8]) -> IndexResult<()> {
        match self.field.map_type {
            MapType::None => Err(self.unsupported()),
            MapType::Master | MapType::Index => {
                self.table().remove_value(hash_key(key), address).await?;
                Ok(())
            }
            _ => self.remove_from_collection(address, key).await,
        }
    }

    /// Record address stored under a unique key.
    pub async fn get(&self, key: &[u8]) -> IndexResult<Option<u64>> {
        if !self.field.map_type.is_unique() {
            return Err(self.unsupported());
        }
        let probe = self.record_probe(key);
        Ok(self.table().get(hash_key(key), &probe).await?)
    }

    /// Every record address stored under `key`.
    pub async fn addresses(&self, key: &[u8]) -> IndexResult<Vec<u64>> {
        match self.field.map_type {
            MapType::None => Err(self.unsupported()),
            MapType::Master | MapType::Index => Ok(self.get(key).await?.into_iter().collect()),
            _ => {
                let (_, padded) = self.kv_key(key)?;
                let probe = KvProbe {
                    core: &self.store.core,
                    key: &padded,
                };
                let width = padded.len() as u64;
                let found = self
                    .table()
                    .get_with(hash_key(&padded), &probe, |kv| async move {
                        let collection = self.store.core.file.read_u64(kv + width).await?;
                        self.collection_addresses(collection).await
                    })
                    .await?;
                Ok(found.unwrap_or_default())
            }
        }
    }

    fn record_probe<'k>(&'k self, key: &'k [u8]) -> RecordProbe<'k> {
        RecordProbe {
            core: &self.store.core,
            slot: self.slot,
            key,
        }
    }

    fn kv_key(&self, key: &[u8]) -> IndexResult<(usize, Vec<u8>)> {
        let class = kv_class(key.len())?;
        let mut padded = key.to_vec();
        padded.resize(KV_WIDTHS[class] as usize, 0);
        Ok((class, padded))
    }

    async fn add_to_collection(&self, address: u64, key: &[u8]) -> IndexResult<()> {
        let (class, padded) = self.kv_key(key)?;
        let padded = padded.as_slice();
        let probe = KvProbe {
            core: &self.store.core,
            key: padded,
        };
        let width = padded.len() as u64;
        let core = &self.store.core;

        self.table()
            .update(
                hash_key(padded),
                &probe,
                || async move {
                    let collection = self.create_collection().await?;
                    self.collection_add(collection, address).await?;

                    let kv = self.store.kv[class].allocate_record().await?;
                    let mut record = padded.to_vec();
                    record.extend_from_slice(&collection.to_le_bytes());
                    core.file.write_bytes(kv, &record).await?;
                    Ok::<_, IndexError>(Some(kv))
                },
                |kv| async move {
                    let collection = core.file.read_u64(kv + width).await?;
                    self.collection_add(collection, address).await?;
                    Ok(Some(kv))
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_from_collection(&self, address: u64, key: &[u8]) -> IndexResult<()> {
        let (class, padded) = self.kv_key(key)?;
        let padded = padded.as_slice();
        let probe = KvProbe {
            core: &self.store.core,
            key: padded,
        };
        let width = padded.len() as u64;
        let core = &self.store.core;

        self.table()
            .update(
                hash_key(padded),
                &probe,
                || async move { Ok::<_, IndexError>(None) },
                |kv| async move {
                    let collection = core.file.read_u64(kv + width).await?;
                    self.collection_remove(collection, address).await?;
                    if !self.collection_is_empty(collection).await? {
                        return Ok(Some(kv));
                    }

                    self.free_collection(collection).await?;
                    self.store.kv[class].remove_record(kv).await?;
                    Ok(None)
                },
            )
            .await?;
        Ok(())
    }

    async fn create_collection(&self) -> StorageResult<u64> {
        let store = self.store;
        match self.field.map_type {
            MapType::IndexHashSet => {
                AddressSet::create(&store.core, &store.tables, &store.hashes).await
            }
            _ => AddressChain::create(&store.core, &store.chunks).await,
        }
    }

    async fn collection_add(&self, collection: u64, address: u64) -> StorageResult<bool> {
        let store = self.store;
        match self.field.map_type {
            MapType::IndexHashSet => {
                AddressSet::new(&store.core, &store.hashes, collection)
                    .add(address)
                    .await
            }
            MapType::IndexSmallHashSet => {
                AddressChain::new(&store.core, &store.chunks, collection)
                    .add(address, true)
                    .await
            }
            _ => {
                AddressChain::new(&store.core, &store.chunks, collection)
                    .add(address, false)
                    .await
            }
        }
    }

    async fn collection_remove(&self, collection: u64, address: u64) -> StorageResult<bool> {
        let store = self.store;
        match self.field.map_type {
            MapType::IndexHashSet => {
                AddressSet::new(&store.core, &store.hashes, collection)
                    .remove(address)
                    .await
            }
            _ => {
                AddressChain::new(&store.core, &store.chunks, collection)
                    .remove(address)
                    .await
            }
        }
    }

    async fn collection_is_empty(&self, collection: u64) -> StorageResult<bool> {
        let store = self.store;
        match self.field.map_type {
            MapType::IndexHashSet => {
                AddressSet::new(&store.core, &store.hashes, collection)
                    .is_empty()
                    .await
            }
            _ => {
                AddressChain::new(&store.core, &store.chunks, collection)
                    .is_empty()
                    .await
            }
        }
    }

    async fn collection_addresses(&self, collection: u64) -> StorageResult<Vec<u64>> {
        let store = self.store;
        match self.field.map_type {
            MapType::IndexHashSet => {
                AddressSet::new(&store.core, &store.hashes, collection)
                    .addresses()
                    .await
            }
            _ => {
                AddressChain::new(&store.core, &store.chunks, collection)
                    .addresses()
                    .await
            }
        }
    }

    async fn free_collection(&self, collection: u64) -> StorageResult<()> {
        let store = self.store;
        match self.field.map_type {
            MapType::IndexHashSet => {
                AddressSet::new(&store.core, &store.hashes, collection)
                    .free(&store.tables)
                    .await
            }
            _ => {
                AddressChain::new(&store.core, &store.chunks, collection)
                    .free()
                    .await
            }
        }
    }
}

/// Index store over fresh allocators.
#[cfg(test)]
pub(crate) async fn test_store(
    core: &Arc<StoreCore>,
    meta: &Arc<MetaAllocator>,
) -> IndexStore {
    use super::collections::CHUNK_RECORD_SIZE;
    use super::keys::kv_record_size;
    use crate::storage::test_support::allocator;
    use crate::storage::{HASH_RECORD_SIZE, INDEX_TABLE_RECORD_SIZE};

    let hashes = allocator(core, meta, "$hash", HASH_RECORD_SIZE).await;
    let tables = allocator(core, meta, "$hashtable", INDEX_TABLE_RECORD_SIZE).await;
    let chunks = allocator(core, meta, "$array", CHUNK_RECORD_SIZE).await;
    let mut kv = Vec::new();
    for width in KV_WIDTHS {
        let name = format!("$kv.{}", width);
        kv.push(allocator(core, meta, &name, kv_record_size(width)).await);
    }
    IndexStore::new(Arc::clone(core), hashes, tables, chunks, kv).unwrap()
}
