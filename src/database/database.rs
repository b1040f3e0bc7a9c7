//! Database handle: open, bootstrap and shared state
//!
//! # Open sequence
//!
//! 1. Validate configuration
//! 2. Open the backing file and read the initialized flag
//! 3. Bootstrap a fresh file, or locate the native schemas of an existing one
//! 4. Open the operation log, when configured
//!
//! Bootstrap writes the initialized flag last, so a file whose bootstrap was
//! interrupted is bootstrapped again on the next open.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::errors::{DbError, DbResult};
use super::natives::Natives;
use super::oplog::OpLog;
use super::registry::{NameProbe, SchemaRuntime};
use crate::config::StoreConfig;
use crate::index::{FieldIndex, IndexStore};
use crate::observability::{log_event_with_fields, Event, Logger};
use crate::storage::layout::{
    BLOCK_SIZE, DATABASE_SIZE_OFFSET, ENTRY_ADDRESS, FIRST_DYNAMIC_BLOCK_ADDRESS,
    INITIALIZED_OFFSET, INTERFACE_TABLE_ADDRESS, STRING_SET_BLOCK_ADDRESS,
};
use crate::storage::{
    hash_key, BlockAllocator, FileHandle, HashTable, StorageResult, StoreCore,
    BLOCK_TABLE_BUCKETS,
};
use crate::strings::StringHashSet;

/// An open object store.
pub struct Database {
    pub(super) core: Arc<StoreCore>,
    pub(super) natives: Natives,
    pub(super) strings: StringHashSet,
    pub(super) indexes: IndexStore,
    runtimes: RwLock<HashMap<String, Arc<SchemaRuntime>>>,
    pub(super) oplog: Option<OpLog>,
    config: StoreConfig,
}

impl Database {
    /// Opens the store described by `config`, creating it when the file is
    /// new or was never fully initialized.
    pub async fn open(config: StoreConfig) -> DbResult<Self> {
        config.validate()?;
        if let Some(severity) = config.severity() {
            Logger::set_min_severity(severity);
        }

        let file = FileHandle::open(&config.data_file).await?;
        let initialized =
            file.len().await? > ENTRY_ADDRESS && file.read_bool(INITIALIZED_OFFSET).await?;
        let boundary = if initialized {
            BlockAllocator::load_boundary(&file)
                .await?
                .max(FIRST_DYNAMIC_BLOCK_ADDRESS)
        } else {
            FIRST_DYNAMIC_BLOCK_ADDRESS
        };

        let core = Arc::new(StoreCore::new(
            file,
            boundary,
            config.lock_shards,
            config.buffer_pool_size,
            config.sync_on_write,
        ));
        let natives = if initialized {
            Natives::load(&core).await?
        } else {
            Self::bootstrap(&core).await?
        };

        let strings = StringHashSet::new(
            Arc::clone(&core),
            Arc::clone(&natives.hashes),
            natives.strings.clone(),
        )?;
        let indexes = IndexStore::new(
            Arc::clone(&core),
            Arc::clone(&natives.hashes),
            Arc::clone(&natives.tables),
            Arc::clone(&natives.chunks),
            natives.kv.clone(),
        )?;
        let oplog = match &config.oplog_file {
            Some(path) => Some(OpLog::open(path).await?),
            None => None,
        };

        let path = config.data_file.display().to_string();
        log_event_with_fields(
            Event::DatabaseOpened,
            &[
                ("path", path.as_str()),
                ("boundary", core.blocks.boundary().await.to_string().as_str()),
                ("bootstrapped", (!initialized).to_string().as_str()),
            ],
        );

        Ok(Self {
            core,
            natives,
            strings,
            indexes,
            runtimes: RwLock::new(HashMap::new()),
            oplog,
            config,
        })
    }

    async fn bootstrap(core: &Arc<StoreCore>) -> StorageResult<Natives> {
        core.file.write_bool(INITIALIZED_OFFSET, false).await?;
        core.file
            .write_i64(DATABASE_SIZE_OFFSET, FIRST_DYNAMIC_BLOCK_ADDRESS as i64)
            .await?;
        core.file
            .write_zeros(ENTRY_ADDRESS, 3 * BLOCK_SIZE as usize)
            .await?;

        let natives = Natives::bootstrap(core).await?;

        let registry = HashTable::create(
            core,
            &natives.hashes,
            INTERFACE_TABLE_ADDRESS,
            BLOCK_TABLE_BUCKETS,
        )
        .await?;
        for native in natives.all() {
            let probe = NameProbe::new(core, native.name());
            registry
                .set(
                    hash_key(native.name().as_bytes()),
                    &probe,
                    native.first_meta_address(),
                )
                .await?;
        }
        HashTable::create(
            core,
            &natives.hashes,
            STRING_SET_BLOCK_ADDRESS,
            BLOCK_TABLE_BUCKETS,
        )
        .await?;

        core.file.sync().await?;
        core.file.write_bool(INITIALIZED_OFFSET, true).await?;
        core.file.sync().await?;

        log_event_with_fields(
            Event::DatabaseBootstrapped,
            &[("natives", natives.all().len().to_string().as_str())],
        );
        Ok(natives)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shared string set.
    pub fn strings(&self) -> &StringHashSet {
        &self.strings
    }

    /// Next address the file will grow to.
    pub async fn boundary(&self) -> u64 {
        self.core.blocks.boundary().await
    }

    pub(super) fn registry(&self) -> HashTable<'_> {
        HashTable::attach(
            &self.core,
            &self.natives.hashes,
            INTERFACE_TABLE_ADDRESS,
            BLOCK_TABLE_BUCKETS,
        )
    }

    /// Runtime of a registered schema, loaded once per process.
    pub(super) async fn runtime(&self, type_name: &str) -> DbResult<Arc<SchemaRuntime>> {
        if let Some(runtime) = self.cached_runtime(type_name) {
            return Ok(runtime);
        }
        let _guard = self.core.locks.names.write(type_name.to_string()).await;
        if let Some(runtime) = self.cached_runtime(type_name) {
            return Ok(runtime);
        }
        let runtime = self
            .load_runtime(type_name)
            .await?
            .ok_or_else(|| DbError::UnknownInterface(type_name.to_string()))?;
        self.cache_runtime(Arc::clone(&runtime));
        Ok(runtime)
    }

    pub(super) fn cached_runtime(&self, type_name: &str) -> Option<Arc<SchemaRuntime>> {
        self.runtimes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(type_name)
            .cloned()
    }

    pub(super) fn cache_runtime(&self, runtime: Arc<SchemaRuntime>) {
        self.runtimes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(runtime.name().to_string(), runtime);
    }

    /// Index of field `index` of a schema.
    pub(super) fn field_index<'a>(
        &'a self,
        runtime: &'a SchemaRuntime,
        index: usize,
    ) -> FieldIndex<'a> {
        self.indexes.field(
            runtime.layout.field(index),
            runtime.layout.slot(index),
            runtime.mappings[index],
        )
    }

    /// Flushes the file and the operation log.
    pub async fn close(&self) -> DbResult<()> {
        if let Some(oplog) = &self.oplog {
            oplog.flush().await?;
        }
        self.core.file.sync().await?;
        let path = self.config.data_file.display().to_string();
        log_event_with_fields(Event::DatabaseClosed, &[("path", path.as_str())]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path().join("store.obj"))
    }

    #[tokio::test]
    async fn test_fresh_open_bootstraps() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(config(&dir)).await.unwrap();

        assert!(db.core.file.read_bool(INITIALIZED_OFFSET).await.unwrap());
        assert!(db.boundary().await > FIRST_DYNAMIC_BLOCK_ADDRESS);
        assert_eq!(
            BlockAllocator::load_boundary(&db.core.file).await.unwrap(),
            db.boundary().await
        );
        assert!(db.interfaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_boundary() {
        let dir = TempDir::new().unwrap();
        let first = {
            let db = Database::open(config(&dir)).await.unwrap();
            let boundary = db.boundary().await;
            db.close().await.unwrap();
            boundary
        };
        let db = Database::open(config(&dir)).await.unwrap();
        assert_eq!(db.boundary().await, first);
    }

    #[tokio::test]
    async fn test_interrupted_bootstrap_is_redone() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(config(&dir)).await.unwrap();
            db.core
                .file
                .write_bool(INITIALIZED_OFFSET, false)
                .await
                .unwrap();
        }
        let db = Database::open(config(&dir)).await.unwrap();
        assert!(db.core.file.read_bool(INITIALIZED_OFFSET).await.unwrap());
        assert!(db.interfaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_interface() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(config(&dir)).await.unwrap();
        let err = db.runtime("Nope").await.err().unwrap();
        assert_eq!(err.code(), "OBJ_UNKNOWN_INTERFACE");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.lock_shards = 3;
        assert!(Database::open(config).await.is_err());
    }
}
