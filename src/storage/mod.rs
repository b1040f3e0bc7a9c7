//! Storage subsystem for objectdb
//!
//! Everything lives in one file addressed by absolute byte offset. The file
//! grows in 1 MiB blocks and never shrinks.
//!
//! # Layers
//!
//! - [`FileHandle`]: positional async reads and writes
//! - [`BlockAllocator`]: serialized file growth
//! - [`StatisticalBlock`]: bitmap-tracked fixed-size slots inside a block
//! - [`MetaRecord`] / [`MetaDefineRecord`]: persisted per-schema metadata
//! - [`MetaAllocator`]: per-schema slot allocation over an owned block chain
//! - [`HashTable`]: persistent hash index rooted at an address
//!
//! # Invariants
//!
//! - A block belongs to exactly one schema once assigned
//! - The persisted database size only moves forward
//! - Slot occupancy lives only in the block bitmap

mod allocator;
mod block;
mod core;
mod errors;
mod file;
mod hash_table;
pub mod layout;
mod meta;
mod statistical;
#[cfg(test)]
pub(crate) mod test_support;

pub use self::core::StoreCore;
pub use allocator::MetaAllocator;
pub use block::BlockAllocator;
pub use errors::{Severity, StorageError, StorageErrorCode, StorageResult};
pub use file::FileHandle;
pub(crate) use file::to_array;
pub use hash_table::{
    hash_key, ExactValue, HashTable, KeyProbe, BLOCK_TABLE_BUCKETS, HASH_RECORD_SIZE,
    INDEX_TABLE_BUCKETS, INDEX_TABLE_RECORD_SIZE,
};
pub use meta::{
    DefineEntry, MetaDefineRecord, MetaHeader, MetaRecord, DEFINE_MAX_FIELDS,
    DEFINE_RECORD_SIZE, META_MAX_BLOCKS, META_NAME_LEN, META_RECORD_SIZE,
};
pub use statistical::{slot_count, StatisticalBlock};
