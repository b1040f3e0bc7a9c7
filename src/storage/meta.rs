//! Persisted schema metadata records
//!
//! Meta-record (one chain per schema):
//!
//! ```text
//! +-----------------------------+   0
//! | type name (256, NUL padded) |
//! | record size        (u32)    | 256
//! | define address     (u64)    | 260
//! | next meta-record   (u64)    | 268
//! | first meta-record  (u64)    | 276
//! | block count        (u32)    | 284
//! | block addresses 1024 x u64  | 288
//! +-----------------------------+ 8480
//! ```
//!
//! Meta-define-record (field definitions of a user schema):
//!
//! ```text
//! | field count (u32) | pad (u32) | 256 x field entry (24 bytes) |
//! field entry: name handle u64 | type u8 | map role u8 | pad u16 |
//!              array length u32 | mapping address u64
//! ```

use super::core::StoreCore;
use super::errors::{StorageError, StorageResult};
use super::file::to_array;

pub const META_NAME_LEN: usize = 256;
pub const META_MAX_BLOCKS: u32 = 1024;

const OFFSET_RECORD_SIZE: u64 = 256;
const OFFSET_DEFINE: u64 = 260;
const OFFSET_NEXT: u64 = 268;
const OFFSET_FIRST: u64 = 276;
const OFFSET_BLOCK_COUNT: u64 = 284;
const OFFSET_BLOCKS: u64 = 288;

pub const META_HEADER_SIZE: usize = OFFSET_BLOCKS as usize;
pub const META_RECORD_SIZE: u32 = (OFFSET_BLOCKS + META_MAX_BLOCKS as u64 * 8) as u32;

pub const DEFINE_MAX_FIELDS: usize = 256;
pub const DEFINE_ENTRY_SIZE: usize = 24;
pub const DEFINE_RECORD_SIZE: u32 = (8 + DEFINE_MAX_FIELDS * DEFINE_ENTRY_SIZE) as u32;

/// Decoded fixed part of a meta-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHeader {
    pub name: String,
    pub record_size: u32,
    pub define_address: u64,
    pub next: u64,
    pub first: u64,
    pub block_count: u32,
}

impl MetaHeader {
    fn decode(bytes: &[u8]) -> Self {
        let name_end = bytes[..META_NAME_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(META_NAME_LEN);
        Self {
            name: String::from_utf8_lossy(&bytes[..name_end]).into_owned(),
            record_size: u32::from_le_bytes(to_array(&bytes[256..260])),
            define_address: u64::from_le_bytes(to_array(&bytes[260..268])),
            next: u64::from_le_bytes(to_array(&bytes[268..276])),
            first: u64::from_le_bytes(to_array(&bytes[276..284])),
            block_count: u32::from_le_bytes(to_array(&bytes[284..288])),
        }
    }

    fn encode(&self) -> StorageResult<Vec<u8>> {
        let name = self.name.as_bytes();
        if name.len() > META_NAME_LEN {
            return Err(StorageError::unsupported_size(format!(
                "type name '{}' exceeds {} bytes",
                self.name, META_NAME_LEN
            )));
        }
        let mut buf = vec![0u8; META_HEADER_SIZE];
        buf[..name.len()].copy_from_slice(name);
        buf[256..260].copy_from_slice(&self.record_size.to_le_bytes());
        buf[260..268].copy_from_slice(&self.define_address.to_le_bytes());
        buf[268..276].copy_from_slice(&self.next.to_le_bytes());
        buf[276..284].copy_from_slice(&self.first.to_le_bytes());
        buf[284..288].copy_from_slice(&self.block_count.to_le_bytes());
        Ok(buf)
    }
}

/// Cursor over one meta-record node.
pub struct MetaRecord<'a> {
    core: &'a StoreCore,
    address: u64,
}

impl<'a> MetaRecord<'a> {
    pub fn new(core: &'a StoreCore, address: u64) -> Self {
        Self { core, address }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Writes a fresh header with no owned blocks.
    pub async fn write_new(
        &self,
        name: &str,
        record_size: u32,
        define_address: u64,
        first: u64,
    ) -> StorageResult<()> {
        let header = MetaHeader {
            name: name.to_string(),
            record_size,
            define_address,
            next: 0,
            first,
            block_count: 0,
        };
        self.core.file.write_bytes(self.address, &header.encode()?).await
    }

    pub async fn read_header(&self) -> StorageResult<MetaHeader> {
        self.core
            .read_with(self.address, META_HEADER_SIZE, MetaHeader::decode)
            .await
    }

    /// Reads only the type name; used by registry lookups.
    pub async fn read_name(&self) -> StorageResult<String> {
        Ok(self.read_header().await?.name)
    }

    pub async fn block_count(&self) -> StorageResult<u32> {
        self.core.file.read_u32(self.address + OFFSET_BLOCK_COUNT).await
    }

    pub async fn next(&self) -> StorageResult<u64> {
        self.core.file.read_u64(self.address + OFFSET_NEXT).await
    }

    pub async fn set_next(&self, next: u64) -> StorageResult<()> {
        self.core.file.write_u64(self.address + OFFSET_NEXT, next).await
    }

    pub async fn set_define_address(&self, define: u64) -> StorageResult<()> {
        self.core.file.write_u64(self.address + OFFSET_DEFINE, define).await
    }

    /// Block addresses stored in this node.
    pub async fn block_addresses(&self) -> StorageResult<Vec<u64>> {
        let count = self.block_count().await?.min(META_MAX_BLOCKS) as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        self.core
            .read_with(self.address + OFFSET_BLOCKS, count * 8, |bytes| {
                bytes
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes(to_array(c)))
                    .collect()
            })
            .await
    }

    /// Stores `block` at slot `index` and bumps the count.
    pub async fn push_block(&self, index: u32, block: u64) -> StorageResult<()> {
        self.core
            .file
            .write_u64(self.address + OFFSET_BLOCKS + index as u64 * 8, block)
            .await?;
        self.core
            .file
            .write_u32(self.address + OFFSET_BLOCK_COUNT, index + 1)
            .await
    }

    /// Reads the record-size field without decoding the rest.
    pub async fn record_size(&self) -> StorageResult<u32> {
        self.core.file.read_u32(self.address + OFFSET_RECORD_SIZE).await
    }

    /// Reads the chain identity marker.
    pub async fn first(&self) -> StorageResult<u64> {
        self.core.file.read_u64(self.address + OFFSET_FIRST).await
    }
}

/// One persisted field definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefineEntry {
    pub name_handle: u64,
    pub field_type: u8,
    pub map_type: u8,
    pub array_length: u32,
    pub mapping_address: u64,
}

impl DefineEntry {
    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.name_handle.to_le_bytes());
        buf[8] = self.field_type;
        buf[9] = self.map_type;
        buf[10..12].copy_from_slice(&[0, 0]);
        buf[12..16].copy_from_slice(&self.array_length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mapping_address.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            name_handle: u64::from_le_bytes(to_array(&buf[0..8])),
            field_type: buf[8],
            map_type: buf[9],
            array_length: u32::from_le_bytes(to_array(&buf[12..16])),
            mapping_address: u64::from_le_bytes(to_array(&buf[16..24])),
        }
    }
}

/// Cursor over a meta-define-record.
pub struct MetaDefineRecord<'a> {
    core: &'a StoreCore,
    address: u64,
}

impl<'a> MetaDefineRecord<'a> {
    pub fn new(core: &'a StoreCore, address: u64) -> Self {
        Self { core, address }
    }

    pub async fn write(&self, entries: &[DefineEntry]) -> StorageResult<()> {
        if entries.len() > DEFINE_MAX_FIELDS {
            return Err(StorageError::unsupported_size(format!(
                "{} fields exceed the maximum of {}",
                entries.len(),
                DEFINE_MAX_FIELDS
            )));
        }
        let mut buf = vec![0u8; 8 + entries.len() * DEFINE_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        for (i, entry) in entries.iter().enumerate() {
            let start = 8 + i * DEFINE_ENTRY_SIZE;
            entry.encode_into(&mut buf[start..start + DEFINE_ENTRY_SIZE]);
        }
        self.core.file.write_bytes(self.address, &buf).await
    }

    pub async fn read(&self) -> StorageResult<Vec<DefineEntry>> {
        let count = self.core.file.read_u32(self.address).await? as usize;
        if count > DEFINE_MAX_FIELDS {
            return Err(StorageError::corruption_at_offset(
                self.address,
                format!("define-record field count {} out of range", count),
            ));
        }
        self.core
            .read_with(self.address + 8, count * DEFINE_ENTRY_SIZE, |bytes| {
                bytes
                    .chunks_exact(DEFINE_ENTRY_SIZE)
                    .map(DefineEntry::decode)
                    .collect()
            })
            .await
    }
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
    fn test_record_sizes() {
        assert_eq!(META_RECORD_SIZE, 8480);
        assert_eq!(DEFINE_RECORD_SIZE, 6152);
    }

    #[tokio::test]
    async fn test_meta_record_blocks() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let address = core.blocks.allocate_block().await.unwrap();
        let meta = MetaRecord::new(&core, address);

        meta.write_new("Person", 48, 0, address).await.unwrap();
        meta.push_block(0, 1000).await.unwrap();
        meta.push_block(1, 2000).await.unwrap();

        let header = meta.read_header().await.unwrap();
        assert_eq!(header.name, "Person");
        assert_eq!(header.record_size, 48);
        assert_eq!(header.first, address);
        assert_eq!(header.block_count, 2);
        assert_eq!(meta.block_addresses().await.unwrap(), vec![1000, 2000]);
    }

    #[tokio::test]
    async fn test_name_too_long_rejected() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let address = core.blocks.allocate_block().await.unwrap();
        let long = "x".repeat(META_NAME_LEN + 1);
        assert!(MetaRecord::new(&core, address)
            .write_new(&long, 8, 0, address)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_define_record_entries() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir).await;
        let address = core.blocks.allocate_block().await.unwrap();
        let define = MetaDefineRecord::new(&core, address);

        let entries = vec![
            DefineEntry {
                name_handle: 11,
                field_type: 8,
                map_type: 1,
                array_length: 0,
                mapping_address: 4096,
            },
            DefineEntry {
                name_handle: 12,
                field_type: 2,
                map_type: 0,
                array_length: 32,
                mapping_address: 0,
            },
        ];
        define.write(&entries).await.unwrap();
        assert_eq!(define.read().await.unwrap(), entries);
    }
}
