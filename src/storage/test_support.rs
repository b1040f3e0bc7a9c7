//! Fixtures for unit tests that need live allocators without a full database.

use std::sync::Arc;

use tempfile::TempDir;

use super::allocator::MetaAllocator;
use super::core::StoreCore;
use super::file::FileHandle;
use super::layout::FIRST_DYNAMIC_BLOCK_ADDRESS;
use super::meta::{MetaRecord, META_RECORD_SIZE};
use super::statistical::StatisticalBlock;

/// A store core with a `$meta` allocator on its first dynamic block.
pub(crate) async fn meta_fixture(dir: &TempDir) -> (Arc<StoreCore>, Arc<MetaAllocator>) {
    let file = FileHandle::open(&dir.path().join("db.obj")).await.unwrap();
    let core = Arc::new(StoreCore::new(file, FIRST_DYNAMIC_BLOCK_ADDRESS, 8, 4, false));

    let block = core.blocks.allocate_block().await.unwrap();
    let stat = StatisticalBlock::new(&core, block, META_RECORD_SIZE);
    stat.initialize().await.unwrap();
    let first = stat.allocate_record().await.unwrap().unwrap();
    let node = MetaRecord::new(&core, first);
    node.write_new("$meta", META_RECORD_SIZE, 0, first).await.unwrap();
    node.push_block(0, block).await.unwrap();

    let meta = Arc::new(MetaAllocator::new(
        Arc::clone(&core),
        "$meta",
        first,
        META_RECORD_SIZE,
        None,
    ));
    (core, meta)
}

/// A fresh allocator named `name` chained under `meta`.
pub(crate) async fn allocator(
    core: &Arc<StoreCore>,
    meta: &Arc<MetaAllocator>,
    name: &str,
    record_size: u32,
) -> Arc<MetaAllocator> {
    let first = meta.allocate_record().await.unwrap();
    MetaRecord::new(core, first)
        .write_new(name, record_size, 0, first)
        .await
        .unwrap();
    Arc::new(MetaAllocator::new(
        Arc::clone(core),
        name,
        first,
        record_size,
        Some(Arc::clone(meta)),
    ))
}
