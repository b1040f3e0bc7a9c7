//! Index subsystem for objectdb
//!
//! Persistent secondary structures for mapped fields. Indexes live in the
//! same file as the records and are maintained inside each mutating call,
//! before the record bytes are written.
//!
//! # Invariants
//!
//! - A unique key resolves to at most one address; later adds overwrite
//! - Multimap keys with no addresses left are removed from their table
//! - Index keys are the exact byte image of the field in the record

mod collections;
mod errors;
mod field_index;
mod keys;

pub use collections::{AddressChain, AddressSet, CHUNK_CAPACITY, CHUNK_RECORD_SIZE};
pub use errors::{IndexError, IndexResult};
#[cfg(test)]
pub(crate) use field_index::test_store;
pub use field_index::{FieldIndex, IndexStore};
pub use keys::{index_keys, kv_class, kv_record_size, lookup_key, KV_WIDTHS};
