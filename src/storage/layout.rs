//! Byte-exact file layout
//!
//! ```text
//! +----------------------------+  0
//! | Initialized flag (bool)    |
//! +----------------------------+  1
//! | Database size (i64 LE)     |
//! +----------------------------+  9  = entry address
//! | Interface hash table       |  1 block
//! +----------------------------+  9 + 1 MiB
//! | Native meta block          |  1 block
//! +----------------------------+  9 + 2 MiB
//! | String hash set table      |  1 block
//! +----------------------------+  9 + 3 MiB
//! | Further blocks, on demand  |  1 block each
//! +----------------------------+
//! ```
//!
//! All integers are little-endian. Blocks are contiguous from the entry
//! address, so every address maps to its owning block by arithmetic alone.

/// Size of one block, the only unit of file growth.
pub const BLOCK_SIZE: u64 = 1 << 20;

pub const INITIALIZED_OFFSET: u64 = 0;
pub const DATABASE_SIZE_OFFSET: u64 = 1;
pub const ENTRY_ADDRESS: u64 = 9;

/// Root of the schema registry hash table.
pub const INTERFACE_TABLE_ADDRESS: u64 = ENTRY_ADDRESS;
/// Statistical block holding the native meta-records.
pub const NATIVE_META_BLOCK_ADDRESS: u64 = ENTRY_ADDRESS + BLOCK_SIZE;
/// Root of the string hash set's hash table.
pub const STRING_SET_BLOCK_ADDRESS: u64 = ENTRY_ADDRESS + 2 * BLOCK_SIZE;
/// File boundary of a freshly bootstrapped database.
pub const FIRST_DYNAMIC_BLOCK_ADDRESS: u64 = ENTRY_ADDRESS + 3 * BLOCK_SIZE;

/// Returns the address of the block containing `address`.
pub fn block_of(address: u64) -> Option<u64> {
    if address < ENTRY_ADDRESS {
        return None;
    }
    Some(ENTRY_ADDRESS + (address - ENTRY_ADDRESS) / BLOCK_SIZE * BLOCK_SIZE)
}
