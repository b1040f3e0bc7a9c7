//! Concurrency primitives shared by the engine
//!
//! - [`LockPool`]: on-demand reader/writer locks keyed by address (or name)
//! - [`LockPools`]: the fixed set of pools every engine component uses
//! - [`BufferPool`]: reusable scratch byte buffers with scoped checkout

mod lock_pool;
mod object_pool;

pub use lock_pool::{LockPool, LockPools, PoolReadGuard, PoolWriteGuard};
pub use object_pool::{BufferPool, PooledBuffer};
