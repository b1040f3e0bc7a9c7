//! Address-keyed reader/writer lock pools
//!
//! Locks are created on demand per key and dropped once nobody holds or waits
//! on them. The key→lock maps are split into a fixed number of shards so that
//! acquiring locks for unrelated addresses never contends on one map mutex.
//! Two different keys never share a lock, so nested acquisition of distinct
//! keys from the same pool cannot self-deadlock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

struct LockEntry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

type Shard<K> = Mutex<HashMap<K, LockEntry>>;

/// A pool of per-key reader/writer locks.
pub struct LockPool<K> {
    name: &'static str,
    shards: Vec<Shard<K>>,
}

impl<K> LockPool<K>
where
    K: Hash + Eq + Clone,
{
    /// Creates a pool with `shard_count` shards (at least one).
    pub fn new(name: &'static str, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            name,
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Pool name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, HashMap<K, LockEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ticket(&self, key: K) -> Ticket<'_, K> {
        let lock = {
            let mut map = self.shard(&key);
            let entry = map.entry(key.clone()).or_insert_with(|| LockEntry {
                lock: Arc::new(RwLock::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };
        Ticket {
            pool: self,
            key,
            lock,
        }
    }

    fn release(&self, key: &K) {
        let mut map = self.shard(key);
        if let Some(entry) = map.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(key);
            }
        }
    }

    /// Acquires the shared lock for `key`.
    pub async fn read(&self, key: K) -> PoolReadGuard<'_, K> {
        let ticket = self.ticket(key);
        let guard = Arc::clone(&ticket.lock).read_owned().await;
        PoolReadGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// Acquires the exclusive lock for `key`.
    pub async fn write(&self, key: K) -> PoolWriteGuard<'_, K> {
        let ticket = self.ticket(key);
        let guard = Arc::clone(&ticket.lock).write_owned().await;
        PoolWriteGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// Number of keys that currently have a live lock.
    pub fn live_locks(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }
}

/// Reference on a pooled lock; returning it may drop the lock from the map.
struct Ticket<'a, K>
where
    K: Hash + Eq + Clone,
{
    pool: &'a LockPool<K>,
    key: K,
    lock: Arc<RwLock<()>>,
}

impl<K> Drop for Ticket<'_, K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

// Field order matters: the lock guard drops before the ticket is returned.

/// Shared guard for a pooled lock.
pub struct PoolReadGuard<'a, K>
where
    K: Hash + Eq + Clone,
{
    _guard: OwnedRwLockReadGuard<()>,
    _ticket: Ticket<'a, K>,
}

/// Exclusive guard for a pooled lock.
pub struct PoolWriteGuard<'a, K>
where
    K: Hash + Eq + Clone,
{
    _guard: OwnedRwLockWriteGuard<()>,
    _ticket: Ticket<'a, K>,
}

/// The lock pools shared by every engine component.
///
/// - `used_count`: reference counts of string entries
/// - `statistical`: occupancy bitmaps of statistical blocks
/// - `record`: records and meta-records
/// - `array`: hash-table buckets, and the multimap collections mutated
///   inside a bucket's critical section
/// - `names`: lazy creation of per-schema runtimes
pub struct LockPools {
    pub used_count: LockPool<u64>,
    pub statistical: LockPool<u64>,
    pub record: LockPool<u64>,
    pub array: LockPool<u64>,
    pub names: LockPool<String>,
}

impl LockPools {
    pub fn new(shard_count: usize) -> Self {
        Self {
            used_count: LockPool::new("used_count", shard_count),
            statistical: LockPool::new("statistical", shard_count),
            record: LockPool::new("record", shard_count),
            array: LockPool::new("array", shard_count),
            names: LockPool::new("names", shard_count),
        }
    }
}
