//! Reference-counted string storage
//!
//! Variable-length text never lives inside a fixed-size record. Records hold
//! a handle (the entry address) into the shared string set instead, and the
//! set keeps one entry per distinct text with a count of its holders.
//!
//! ```text
//! entry: | refcount (u32) | len (u32) | class (u32) | crc32 (u32) | payload |
//! ```
//!
//! Entries are allocated from size-class schemas `$string.<class>`; the
//! smallest class that fits the text is used. The text-to-handle index is a
//! block-sized hash table at a fixed address.
//!
//! Reference count changes happen under the `used_count` lock of the handle.
//! `borrow` and `release` additionally run inside the string table's bucket
//! lock, so an entry cannot be found and freed at the same time.

mod set;

#[cfg(test)]
pub(crate) use set::test_set;
pub use set::{class_for, StringHashSet, STRING_CLASSES, STRING_ENTRY_HEADER_SIZE};
