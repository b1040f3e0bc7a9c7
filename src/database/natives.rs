//! Native schemas
//!
//! The engine's own structures (meta-records, define-records, hash tables,
//! chain records, address chunks, string entries, multimap keys) are stored
//! as schemas like any other. They are created on first open and found again
//! on later opens by walking the `$meta` schema, whose first meta-record sits
//! in slot 0 of the native meta block.

use std::collections::HashMap;
use std::sync::Arc;

use crate::index::{kv_record_size, CHUNK_RECORD_SIZE, KV_WIDTHS};
use crate::storage::layout::NATIVE_META_BLOCK_ADDRESS;
use crate::storage::{
    MetaAllocator, MetaRecord, StatisticalBlock, StorageError, StorageResult, StoreCore,
    DEFINE_RECORD_SIZE, HASH_RECORD_SIZE, INDEX_TABLE_RECORD_SIZE, META_RECORD_SIZE,
};
use crate::strings::{STRING_CLASSES, STRING_ENTRY_HEADER_SIZE};

pub const META_SCHEMA: &str = "$meta";
pub const DEFINE_SCHEMA: &str = "$define";
pub const HASH_TABLE_SCHEMA: &str = "$hashtable";
pub const HASH_SCHEMA: &str = "$hash";
pub const ARRAY_SCHEMA: &str = "$array";

/// Whether `name` is reserved for native schemas.
pub fn is_native(name: &str) -> bool {
    name.starts_with('$')
}

fn string_schema(class: u32) -> String {
    format!("$string.{}", class)
}

fn kv_schema(width: u32) -> String {
    format!("$kv.{}", width)
}

/// Every native schema except `$meta`, with its record size.
fn native_schemas() -> Vec<(String, u32)> {
    let mut out = vec![
        (DEFINE_SCHEMA.to_string(), DEFINE_RECORD_SIZE),
        (HASH_TABLE_SCHEMA.to_string(), INDEX_TABLE_RECORD_SIZE),
        (HASH_SCHEMA.to_string(), HASH_RECORD_SIZE),
        (ARRAY_SCHEMA.to_string(), CHUNK_RECORD_SIZE),
    ];
    for class in STRING_CLASSES {
        out.push((string_schema(class), STRING_ENTRY_HEADER_SIZE + class));
    }
    for width in KV_WIDTHS {
        out.push((kv_schema(width), kv_record_size(width)));
    }
    out
}

/// Allocators of every native schema.
pub struct Natives {
    pub meta: Arc<MetaAllocator>,
    pub defines: Arc<MetaAllocator>,
    pub tables: Arc<MetaAllocator>,
    pub hashes: Arc<MetaAllocator>,
    pub chunks: Arc<MetaAllocator>,
    pub strings: Vec<Arc<MetaAllocator>>,
    pub kv: Vec<Arc<MetaAllocator>>,
}

impl Natives {
    fn meta_head(core: &StoreCore) -> u64 {
        StatisticalBlock::new(core, NATIVE_META_BLOCK_ADDRESS, META_RECORD_SIZE).address_of(0)
    }

    /// Formats the native meta block and creates every native schema.
    pub async fn bootstrap(core: &Arc<StoreCore>) -> StorageResult<Self> {
        let block = StatisticalBlock::new(core, NATIVE_META_BLOCK_ADDRESS, META_RECORD_SIZE);
        block.initialize().await?;
        let head = block
            .allocate_record()
            .await?
            .ok_or_else(|| {
                StorageError::allocation_invariant(NATIVE_META_BLOCK_ADDRESS, META_RECORD_SIZE)
            })?;

        let node = MetaRecord::new(core, head);
        node.write_new(META_SCHEMA, META_RECORD_SIZE, 0, head).await?;
        node.push_block(0, NATIVE_META_BLOCK_ADDRESS).await?;

        let meta = Arc::new(MetaAllocator::new(
            Arc::clone(core),
            META_SCHEMA,
            head,
            META_RECORD_SIZE,
            None,
        ));

        let mut heads = HashMap::new();
        for (name, record_size) in native_schemas() {
            let first = meta.allocate_record().await?;
            MetaRecord::new(core, first)
                .write_new(&name, record_size, 0, first)
                .await?;
            heads.insert(name, (first, record_size));
        }
        Self::assemble(core, meta, &heads)
    }

    /// Finds the native schemas of an initialized file.
    pub async fn load(core: &Arc<StoreCore>) -> StorageResult<Self> {
        let head = Self::meta_head(core);
        let header = MetaRecord::new(core, head).read_header().await?;
        if header.name != META_SCHEMA || header.first != head {
            return Err(StorageError::corruption_at_offset(
                head,
                "native meta block does not start with the $meta schema",
            ));
        }

        let meta = Arc::new(MetaAllocator::new(
            Arc::clone(core),
            META_SCHEMA,
            head,
            META_RECORD_SIZE,
            None,
        ));

        let mut heads = HashMap::new();
        for address in meta.used_addresses().await? {
            if address == head {
                continue;
            }
            let header = MetaRecord::new(core, address).read_header().await?;
            if is_native(&header.name) && header.first == address {
                heads.insert(header.name, (address, header.record_size));
            }
        }
        Self::assemble(core, meta, &heads)
    }

    fn assemble(
        core: &Arc<StoreCore>,
        meta: Arc<MetaAllocator>,
        heads: &HashMap<String, (u64, u32)>,
    ) -> StorageResult<Self> {
        let open = |name: &str, expected: u32| -> StorageResult<Arc<MetaAllocator>> {
            let (first, record_size) = heads.get(name).copied().ok_or_else(|| {
                StorageError::data_corruption(format!("native schema {} is missing", name))
            })?;
            if record_size != expected {
                return Err(StorageError::corruption_at_offset(
                    first,
                    format!(
                        "native schema {} has record size {}, expected {}",
                        name, record_size, expected
                    ),
                ));
            }
            Ok(Arc::new(MetaAllocator::new(
                Arc::clone(core),
                name,
                first,
                record_size,
                Some(Arc::clone(&meta)),
            )))
        };

        let strings = STRING_CLASSES
            .iter()
            .map(|class| open(&string_schema(*class), STRING_ENTRY_HEADER_SIZE + class))
            .collect::<StorageResult<Vec<_>>>()?;
        let kv = KV_WIDTHS
            .iter()
            .map(|width| open(&kv_schema(*width), kv_record_size(*width)))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Self {
            defines: open(DEFINE_SCHEMA, DEFINE_RECORD_SIZE)?,
            tables: open(HASH_TABLE_SCHEMA, INDEX_TABLE_RECORD_SIZE)?,
            hashes: open(HASH_SCHEMA, HASH_RECORD_SIZE)?,
            chunks: open(ARRAY_SCHEMA, CHUNK_RECORD_SIZE)?,
            strings,
            kv,
            meta,
        })
    }

    /// Native schemas with their first meta-record, `$meta` included.
    pub fn all(&self) -> Vec<Arc<MetaAllocator>> {
        let mut out = vec![
            Arc::clone(&self.meta),
            Arc::clone(&self.defines),
            Arc::clone(&self.tables),
            Arc::clone(&self.hashes),
            Arc::clone(&self.chunks),
        ];
        out.extend(self.strings.iter().cloned());
        out.extend(self.kv.iter().cloned());
        out
    }
}
