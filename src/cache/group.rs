//! # Cache Group Context
//!
//! A cache group is a set of logical caches sharing one partition set and
//! one index. The context couples the group's configuration with its data
//! region, work directory, per-partition data stores, and the WAL/TTL
//! switches the defragmenter flips while it owns the group.
//!
//! During defragmentation two contexts for the same group id are alive at
//! once: the old one over the node's default region and a new one over
//! the defragmentation partition region. The coordinator owns both for
//! the duration of one group; pipelines only borrow them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::btree::BTree;
use crate::memory::{DataRegion, PageEvictionMode};
use crate::storage::meta::{index_meta_mut, init_index_meta};
use crate::storage::{GroupId, PartitionId, INDEX_PARTITION};

use super::data_store::CacheDataStore;

#[derive(Debug, Clone)]
pub struct CacheGroupConfig {
    pub grp_id: GroupId,
    pub name: String,
    pub cache_ids: Vec<i32>,
    /// Whether rows carry their cache id inside data pages. Shared groups
    /// inline it; single-cache groups store `UNDEFINED_CACHE_ID`.
    pub store_cache_id_in_data_page: bool,
    pub encrypted: bool,
    pub page_eviction_mode: PageEvictionMode,
    pub user_cache: bool,
}

#[derive(Debug)]
pub struct CacheGroupContext {
    config: CacheGroupConfig,
    data_region: DataRegion,
    work_dir: PathBuf,
    local_wal_enabled: AtomicBool,
    ttl_registered: AtomicBool,
    data_stores: Mutex<BTreeMap<PartitionId, Arc<CacheDataStore>>>,
}

impl CacheGroupContext {
    pub fn new(config: CacheGroupConfig, data_region: DataRegion, work_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            config,
            data_region,
            work_dir,
            local_wal_enabled: AtomicBool::new(true),
            ttl_registered: AtomicBool::new(true),
            data_stores: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn grp_id(&self) -> GroupId {
        self.config.grp_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheGroupConfig {
        &self.config
    }

    pub fn user_cache(&self) -> bool {
        self.config.user_cache
    }

    pub fn store_cache_id_in_data_page(&self) -> bool {
        self.config.store_cache_id_in_data_page
    }

    pub fn data_region(&self) -> &DataRegion {
        &self.data_region
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn local_wal_enabled(&self) -> bool {
        self.local_wal_enabled.load(Ordering::Acquire)
    }

    /// Rewrite traffic must not generate redo; the defragmenter disables
    /// the group's WAL locally before touching it.
    pub fn set_local_wal_enabled(&self, enabled: bool) {
        self.local_wal_enabled.store(enabled, Ordering::Release);
    }

    pub fn ttl_registered(&self) -> bool {
        self.ttl_registered.load(Ordering::Acquire)
    }

    /// TTL cleanup must not race the rewrite of the pending trees.
    pub fn unregister_ttl(&self) {
        self.ttl_registered.store(false, Ordering::Release);
    }

    pub fn add_data_store(&self, store: Arc<CacheDataStore>) {
        self.data_stores.lock().insert(store.part_id(), store);
    }

    pub fn data_store(&self, part: PartitionId) -> Option<Arc<CacheDataStore>> {
        self.data_stores.lock().get(&part).cloned()
    }

    /// Data stores in partition order.
    pub fn data_stores(&self) -> Vec<Arc<CacheDataStore>> {
        self.data_stores.lock().values().cloned().collect()
    }

    /// Starts a freshly constructed group context: formats the index
    /// partition's meta page and allocates the index tree root in this
    /// group's region. The index store must already be registered at
    /// `INDEX_PARTITION`, and the caller holds the checkpoint read lock.
    pub fn start(&self) -> Result<()> {
        let handle = self
            .data_region
            .page_memory()
            .get_store(self.grp_id(), INDEX_PARTITION)?;

        let mut state = handle.state()?;
        init_index_meta(state.page_mut(0)?)?;
        let root = BTree::create(&mut state)?.root_page();
        index_meta_mut(state.page_mut(0)?)?.index_tree_root = root;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PageStoreHandle, StoreKey};
    use crate::storage::meta::index_meta;
    use crate::storage::{MmapStorage, PageStoreState};
    use tempfile::tempdir;

    fn test_config(grp_id: GroupId) -> CacheGroupConfig {
        CacheGroupConfig {
            grp_id,
            name: format!("group-{grp_id}"),
            cache_ids: vec![1],
            store_cache_id_in_data_page: false,
            encrypted: false,
            page_eviction_mode: PageEvictionMode::Disabled,
            user_cache: true,
        }
    }

    #[test]
    fn start_formats_the_index_partition() {
        let dir = tempdir().unwrap();
        let region = DataRegion::new("part", PageEvictionMode::Disabled);

        let storage = MmapStorage::create(dir.path().join("index-dfrg.bin.tmp"), 1).unwrap();
        let handle =
            PageStoreHandle::new(StoreKey::new(10, INDEX_PARTITION), PageStoreState::new(storage));
        region.page_memory().add_store(Arc::clone(&handle));

        let grp = CacheGroupContext::new(test_config(10), region, dir.path().to_path_buf());
        grp.start().unwrap();

        let state = handle.state().unwrap();
        let meta = index_meta(state.page(0).unwrap()).unwrap();
        assert_ne!(meta.index_tree_root, 0);
    }

    #[test]
    fn wal_and_ttl_flags_flip() {
        let dir = tempdir().unwrap();
        let region = DataRegion::new("default", PageEvictionMode::Disabled);
        let grp = CacheGroupContext::new(test_config(1), region, dir.path().to_path_buf());

        assert!(grp.local_wal_enabled());
        assert!(grp.ttl_registered());

        grp.set_local_wal_enabled(false);
        grp.unregister_ttl();

        assert!(!grp.local_wal_enabled());
        assert!(!grp.ttl_registered());
    }
}
