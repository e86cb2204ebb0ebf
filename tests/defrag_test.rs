//! # Defragmentation Integration Tests
//!
//! End-to-end runs of the defragmentation engine over real store files in
//! a temp directory: dense partitions, TTL rows, shared-group counters,
//! the gaps blob, crash-resume, and the fail-fast paths.
//!
//! The fixture builds cache groups through the same cache-store machinery
//! the engine itself uses, runs the `Defragmenter`, then reopens the
//! swapped files and verifies the invariants.

use std::path::Path;
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tempfile::TempDir;

use partdefrag::btree::BTree;
use partdefrag::cache::row::key_hash;
use partdefrag::db::{
    DEFRAGMENTATION_MAPPING_REGION_NAME, DEFRAGMENTATION_PART_REGION_NAME,
};
use partdefrag::defrag::{file_utils, iterate, LinkMap};
use partdefrag::storage::meta::{self, init_partition_meta, partition_meta_mut};
use partdefrag::storage::page_id::{self, GroupId, PartitionId};
use partdefrag::storage::{MmapStorage, PageHeader, PageStoreState, INDEX_PARTITION};
use partdefrag::{
    BTreeIndexing, CacheDataStore, CacheGroupConfig, CacheGroupContext, CheckpointController,
    DataRegion, DataRow, DatabaseManager, DefragmentationError, Defragmenter,
    FilePageStoreManager, Indexing, MaintenanceRegistry, PageEvictionMode,
    DEFRAGMENTATION_MNTC_TASK_NAME,
};
use partdefrag::memory::PageStoreHandle;

struct TestNode {
    db: Arc<DatabaseManager>,
    store_mgr: Arc<FilePageStoreManager>,
    maintenance: Arc<MaintenanceRegistry>,
    default_region: DataRegion,
    part_region: DataRegion,
    mapping_region: DataRegion,
    groups: Vec<Arc<CacheGroupContext>>,
}

fn new_node(root: &Path) -> TestNode {
    let db = Arc::new(DatabaseManager::new());

    let default_region = DataRegion::new("default", PageEvictionMode::Disabled);
    let part_region = DataRegion::new(
        DEFRAGMENTATION_PART_REGION_NAME,
        PageEvictionMode::Disabled,
    );
    let mapping_region = DataRegion::new(
        DEFRAGMENTATION_MAPPING_REGION_NAME,
        PageEvictionMode::Disabled,
    );

    db.add_region(default_region.clone(), true);
    db.add_region(part_region.clone(), false);
    db.add_region(mapping_region.clone(), false);

    let maintenance = Arc::new(MaintenanceRegistry::new());
    maintenance.register_maintenance_task(DEFRAGMENTATION_MNTC_TASK_NAME);

    TestNode {
        db,
        store_mgr: Arc::new(FilePageStoreManager::new(root).unwrap()),
        maintenance,
        default_region,
        part_region,
        mapping_region,
        groups: Vec::new(),
    }
}

fn group_config(grp_id: GroupId, name: &str) -> CacheGroupConfig {
    CacheGroupConfig {
        grp_id,
        name: name.to_string(),
        cache_ids: vec![grp_id as i32],
        store_cache_id_in_data_page: false,
        encrypted: false,
        page_eviction_mode: PageEvictionMode::Disabled,
        user_cache: true,
    }
}

fn add_group(node: &mut TestNode, config: CacheGroupConfig) -> Arc<CacheGroupContext> {
    let work_dir = node
        .store_mgr
        .register_group(config.grp_id, &config.name)
        .unwrap();
    let grp = CacheGroupContext::new(config, node.default_region.clone(), work_dir);
    node.groups.push(Arc::clone(&grp));
    grp
}

/// Creates `part-N.bin`, registers its handle, and returns the opened
/// data store. `initialized = false` leaves the trees unallocated.
fn create_partition(
    node: &TestNode,
    grp: &Arc<CacheGroupContext>,
    part: PartitionId,
    initialized: bool,
) -> Arc<CacheDataStore> {
    let factory = node.store_mgr.page_store_factory(grp.grp_id(), false);
    let handle = factory
        .create_page_store(part, &file_utils::part_file(grp.work_dir(), part))
        .unwrap();

    let store = if initialized {
        CacheDataStore::create(Arc::clone(&handle), part, 2).unwrap()
    } else {
        {
            let mut state = handle.state().unwrap();
            init_partition_meta(state.page_mut(0).unwrap(), 2).unwrap();
        }
        CacheDataStore::open(Arc::clone(&handle), part).unwrap()
    };

    node.default_region.page_memory().add_store(Arc::clone(&handle));
    node.store_mgr.register_store(handle);
    grp.add_data_store(Arc::clone(&store));
    store
}

/// Inserts rows the way the cache layer does: groups that do not inline
/// cache ids per page carry `UNDEFINED_CACHE_ID` throughout, shared
/// groups keep the real id in pages and tree keys alike.
fn insert_rows(
    grp: &CacheGroupContext,
    store: &CacheDataStore,
    cache_id: i32,
    keys: impl Iterator<Item = (Vec<u8>, Vec<u8>, u64)>,
) {
    let effective_cache_id = if grp.store_cache_id_in_data_page() {
        cache_id
    } else {
        partdefrag::cache::UNDEFINED_CACHE_ID
    };

    for (key, value, expire_time) in keys {
        let mut row = DataRow::new(effective_cache_id, key, value, 1, expire_time);
        store.insert_data_row(&mut row).unwrap();
        store.put_tree_row(&row).unwrap();
        if expire_time != 0 {
            store
                .put_pending(effective_cache_id, expire_time, row.link)
                .unwrap();
        }
    }
    store.save_free_list_metadata().unwrap();
}

/// Builds `index.bin` for a group: one tree mapping row key bytes to row
/// links, the shape `BTreeIndexing` rebuilds.
fn build_index(node: &TestNode, grp: &Arc<CacheGroupContext>) {
    let factory = node.store_mgr.page_store_factory(grp.grp_id(), false);
    let handle = factory
        .create_page_store(INDEX_PARTITION, &file_utils::index_file(grp.work_dir()))
        .unwrap();

    {
        let mut state = handle.state().unwrap();
        meta::init_index_meta(state.page_mut(0).unwrap()).unwrap();
        let root = BTree::create(&mut state).unwrap().root_page();
        meta::index_meta_mut(state.page_mut(0).unwrap()).unwrap().index_tree_root = root;
    }

    for store in grp.data_stores() {
        let Some(root) = store.tree_root() else { continue };

        let links = {
            let state = store.handle().state().unwrap();
            let mut links = Vec::new();
            iterate(&state, root, |leaf, idx| {
                links.push(u64::from_be_bytes(leaf.value_at(idx)?.try_into()?));
                Ok(true)
            })
            .unwrap();
            links
        };

        let mut state = handle.state().unwrap();
        for link in links {
            let row = store.read_row(link).unwrap();
            let root = meta::index_meta(state.page(0).unwrap()).unwrap().index_tree_root;
            let mut tree = BTree::new(&mut state, root).unwrap();
            tree.put(&row.key, &link.to_be_bytes()).unwrap();
            if tree.root_page() != root {
                meta::index_meta_mut(state.page_mut(0).unwrap())
                    .unwrap()
                    .index_tree_root = tree.root_page();
            }
        }
    }

    node.default_region.page_memory().add_store(Arc::clone(&handle));
    node.store_mgr.register_store(handle);
}

/// Reopens a node over an existing storage root, the way a restart
/// would: groups are re-registered and every surviving partition file is
/// opened from disk.
fn reopen_node(root: &Path, configs: &[CacheGroupConfig]) -> TestNode {
    let mut node = new_node(root);

    for config in configs {
        let grp = add_group(&mut node, config.clone());
        let factory = node.store_mgr.page_store_factory(grp.grp_id(), false);

        for part in 0..64u16 {
            let path = file_utils::part_file(grp.work_dir(), part);
            if !path.exists() {
                continue;
            }
            let handle = factory.open_page_store(part, &path).unwrap();
            let store = CacheDataStore::open(Arc::clone(&handle), part).unwrap();
            node.default_region.page_memory().add_store(Arc::clone(&handle));
            node.store_mgr.register_store(handle);
            grp.add_data_store(store);
        }

        let index_path = file_utils::index_file(grp.work_dir());
        if index_path.exists() {
            let handle = factory.open_page_store(INDEX_PARTITION, &index_path).unwrap();
            node.default_region.page_memory().add_store(Arc::clone(&handle));
            node.store_mgr.register_store(handle);
        }
    }

    node
}

fn run_defrag(node: &TestNode, indexing: Arc<dyn Indexing>) -> eyre::Result<()> {
    let node_cp = Arc::new(CheckpointController::new(
        "node",
        vec![node.default_region.clone()],
    ));
    let defrag_cp = Arc::new(CheckpointController::new(
        "defragmentation",
        vec![node.part_region.clone(), node.mapping_region.clone()],
    ));

    let defragmenter = Defragmenter::new(
        Vec::new(),
        node.groups.clone(),
        Arc::clone(&node.db),
        Arc::clone(&node.store_mgr),
        Arc::clone(&node.maintenance),
        indexing,
        Arc::clone(&node_cp),
        defrag_cp,
    )?;

    let result = defragmenter.execute();
    node_cp.stop(false);
    result
}

fn reopen_partition(work_dir: &Path, part: PartitionId) -> Arc<CacheDataStore> {
    let storage = MmapStorage::open(file_utils::part_file(work_dir, part)).unwrap();
    let handle = PageStoreHandle::new(
        partdefrag::memory::StoreKey::new(0, part),
        PageStoreState::new(storage),
    );
    CacheDataStore::open(handle, part).unwrap()
}

/// Rows of the data tree in tree order.
fn collect_rows(store: &CacheDataStore) -> Vec<DataRow> {
    let Some(root) = store.tree_root() else {
        return Vec::new();
    };

    let links = {
        let state = store.handle().state().unwrap();
        let mut links = Vec::new();
        iterate(&state, root, |leaf, idx| {
            links.push(u64::from_be_bytes(leaf.value_at(idx)?.try_into()?));
            Ok(true)
        })
        .unwrap();
        links
    };

    links
        .into_iter()
        .map(|link| store.read_row(link).unwrap())
        .collect()
}

/// `(expire_time, link)` pairs of the pending entries tree.
fn pending_entries(store: &CacheDataStore) -> Vec<(u64, u64)> {
    let Some(root) = store.pending_tree_root() else {
        return Vec::new();
    };

    let state = store.handle().state().unwrap();
    let mut entries = Vec::new();
    iterate(&state, root, |leaf, idx| {
        let key = leaf.key_at(idx)?;
        let expire = u64::from_be_bytes(key[4..12].try_into()?);
        let link = u64::from_be_bytes(key[12..20].try_into()?);
        entries.push((expire, link));
        Ok(true)
    })
    .unwrap();
    entries
}

fn index_entries(work_dir: &Path) -> Vec<(Vec<u8>, u64)> {
    let storage = MmapStorage::open(file_utils::index_file(work_dir)).unwrap();
    let state = PageStoreState::new(storage);
    let root = meta::index_meta(state.page(0).unwrap()).unwrap().index_tree_root;

    let mut entries = Vec::new();
    iterate(&state, root, |leaf, idx| {
        entries.push((
            leaf.key_at(idx)?.to_vec(),
            u64::from_be_bytes(leaf.value_at(idx)?.try_into()?),
        ));
        Ok(true)
    })
    .unwrap();
    entries
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Records the link-map sizes handed to the index rebuild, then delegates
/// to the real rebuilder.
#[derive(Default)]
struct RecordingIndexing {
    inner: BTreeIndexing,
    link_map_lens: Mutex<HashMap<PartitionId, u64>>,
}

impl Indexing for RecordingIndexing {
    fn module_enabled(&self) -> bool {
        true
    }

    fn defragment(
        &self,
        old_grp: &CacheGroupContext,
        new_grp: &CacheGroupContext,
        part_page_memory: &Arc<partdefrag::memory::PageMemory>,
        mapping_by_partition: &HashMap<PartitionId, LinkMap>,
        cp_lock: &Arc<partdefrag::checkpoint::CheckpointLock>,
    ) -> eyre::Result<()> {
        let mut lens = self.link_map_lens.lock().unwrap();
        for (&part, map) in mapping_by_partition {
            lens.insert(part, map.len()?);
        }
        drop(lens);

        self.inner
            .defragment(old_grp, new_grp, part_page_memory, mapping_by_partition, cp_lock)
    }
}

/// Fails the index rebuild, standing in for a crash between the last
/// partition rename and the index checkpoint.
struct FailingIndexing;

impl Indexing for FailingIndexing {
    fn module_enabled(&self) -> bool {
        true
    }

    fn defragment(
        &self,
        _old_grp: &CacheGroupContext,
        _new_grp: &CacheGroupContext,
        _part_page_memory: &Arc<partdefrag::memory::PageMemory>,
        _mapping_by_partition: &HashMap<PartitionId, LinkMap>,
        _cp_lock: &Arc<partdefrag::checkpoint::CheckpointLock>,
    ) -> eyre::Result<()> {
        eyre::bail!("index rebuild interrupted")
    }
}

#[test]
fn test_empty_group_produces_no_partition_rewrites() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(1, "empty-group"));

    for part in 0..4u16 {
        create_partition(&node, &grp, part, false);
    }

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    let files = list_files(grp.work_dir());
    assert!(files.iter().all(|f| !f.ends_with(".tmp")), "files: {files:?}");
    assert!(files.iter().all(|f| !f.starts_with("part-dfrg-")));
    // The swap consumed the marker and the mapping files.
    assert!(!file_utils::defragmentation_completion_marker_file(grp.work_dir()).exists());
    assert!(files.iter().all(|f| !f.starts_with("part-map-")));

    for part in 0..4u16 {
        assert!(file_utils::part_file(grp.work_dir(), part).exists());
    }

    assert!(!node.maintenance.is_registered(DEFRAGMENTATION_MNTC_TASK_NAME));
}

#[test]
fn test_single_dense_partition_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(2, "dense"));
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        2,
        (0..10_000u32).map(|i| {
            (
                format!("{i:08}").into_bytes(),
                format!("v{i}").into_bytes(),
                0,
            )
        }),
    );
    {
        let mut state = store.handle().state().unwrap();
        let meta = partition_meta_mut(state.page_mut(0).unwrap()).unwrap();
        meta.update_counter = 77;
        meta.global_remove_id = 5;
        meta.partition_state = 1;
    }
    build_index(&node, &grp);

    let old_rows = collect_rows(&store);
    assert_eq!(old_rows.len(), 10_000);

    let indexing = Arc::new(RecordingIndexing::default());
    run_defrag(&node, Arc::clone(&indexing) as Arc<dyn Indexing>).unwrap();

    // WAL and lifecycle protocol.
    assert!(node.db.wal_logging_resumed());
    assert!(node.db.state_restored());
    assert!(node.db.wal_deactivated());
    assert!(node.db.group_wal_disabled(2));
    assert!(!grp.local_wal_enabled());
    assert!(!grp.ttl_registered());

    // The link map covered every row before the index rebuild.
    assert_eq!(indexing.link_map_lens.lock().unwrap()[&0], 10_000);

    let new_store = reopen_partition(grp.work_dir(), 0);
    let new_rows = collect_rows(&new_store);
    assert_eq!(new_rows.len(), 10_000);

    // Same rows in the same tree order, at new locations.
    for (old, new) in old_rows.iter().zip(&new_rows) {
        assert_eq!(old.key, new.key);
        assert_eq!(old.value, new.value);
        assert_eq!(old.version, new.version);
        assert_eq!(old.expire_time, new.expire_time);
        assert_eq!(old.cache_id, new.cache_id);
    }

    let meta = new_store.meta_snapshot().unwrap();
    assert_eq!(meta.size, 10_000);
    assert_eq!(meta.update_counter, 77);
    assert_eq!(meta.global_remove_id, 5);
    assert_eq!(meta.partition_state, 1);

    // Index entries resolve through the new file.
    let entries = index_entries(grp.work_dir());
    assert_eq!(entries.len(), 10_000);
    for (key, link) in entries {
        let row = new_store.read_row(link).unwrap();
        assert_eq!(row.key, key);
    }
}

#[test]
fn test_ttl_rows_repopulate_the_pending_tree() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(3, "ttl"));
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        3,
        (0..1_000u32).map(|i| {
            let expire = if i % 7 == 0 { 1_700_000_000_000 } else { 0 };
            (
                format!("{i:06}").into_bytes(),
                b"payload".to_vec(),
                expire,
            )
        }),
    );

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    let new_store = reopen_partition(grp.work_dir(), 0);
    let pending = pending_entries(&new_store);
    assert_eq!(pending.len(), 143);

    for (expire, link) in pending {
        assert_eq!(expire, 1_700_000_000_000);
        let row = new_store.read_row(link).unwrap();
        assert_eq!(row.expire_time, 1_700_000_000_000);
    }

    // Every row without a TTL is absent from the pending tree.
    let with_ttl = collect_rows(&new_store)
        .iter()
        .filter(|r| r.expire_time != 0)
        .count();
    assert_eq!(with_ttl, 143);
}

#[test]
fn test_shared_group_counters_chain_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());

    let mut config = group_config(4, "shared");
    config.cache_ids = vec![101, 102];
    config.store_cache_id_in_data_page = true;
    let grp = add_group(&mut node, config);
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        101,
        (0..30u32).map(|i| (format!("a{i:04}").into_bytes(), b"x".to_vec(), 0)),
    );
    insert_rows(
        &grp,
        &store,
        102,
        (0..20u32).map(|i| (format!("b{i:04}").into_bytes(), b"y".to_vec(), 0)),
    );

    let sizes: HashMap<i32, u64> = [(101, 30), (102, 20)].into_iter().collect();
    {
        let mut state = store.handle().state().unwrap();
        let counters_page_id =
            meta::write_shared_group_cache_sizes(&mut state, 0, &sizes).unwrap();
        partition_meta_mut(state.page_mut(0).unwrap())
            .unwrap()
            .counters_page_id = counters_page_id;
    }

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    let new_store = reopen_partition(grp.work_dir(), 0);
    let meta_page = new_store.meta_snapshot().unwrap();
    assert_ne!(meta_page.counters_page_id, 0);

    let state = new_store.handle().state().unwrap();
    let read_back =
        meta::read_shared_group_cache_sizes(&state, meta_page.counters_page_id).unwrap();
    assert_eq!(read_back, sizes);
    drop(state);

    // Inlined cache ids survive the rewrite.
    let rows = collect_rows(&new_store);
    assert_eq!(rows.iter().filter(|r| r.cache_id == 101).count(), 30);
    assert_eq!(rows.iter().filter(|r| r.cache_id == 102).count(), 20);
}

#[test]
fn test_gaps_link_blob_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(5, "gaps"));
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        5,
        (0..10u32).map(|i| (format!("{i}").into_bytes(), b"v".to_vec(), 0)),
    );

    let blob: Vec<u8> = (0..37u8).collect();
    {
        let mut gaps = partdefrag::cache::SimpleDataRow::new(0, blob.clone());
        store.insert_blob_row(&mut gaps).unwrap();
        let mut state = store.handle().state().unwrap();
        partition_meta_mut(state.page_mut(0).unwrap()).unwrap().gaps_link = gaps.link;
    }

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    let new_store = reopen_partition(grp.work_dir(), 0);
    let meta_page = new_store.meta_snapshot().unwrap();
    assert_ne!(meta_page.gaps_link, 0);
    assert_eq!(new_store.read_row_bytes(meta_page.gaps_link).unwrap(), blob);
}

#[test]
fn test_crash_mid_group_resumes_and_completes() {
    let dir = TempDir::new().unwrap();
    let config = group_config(6, "resume");

    let rows_per_part = 500u32;
    {
        let mut node = new_node(dir.path());
        let grp = add_group(&mut node, config.clone());

        for part in 0..4u16 {
            let store = create_partition(&node, &grp, part, true);
            insert_rows(
                &grp,
                &store,
                6,
                (0..rows_per_part).map(move |i| {
                    (
                        format!("k{part}-{i:05}").into_bytes(),
                        format!("v{part}-{i}").into_bytes(),
                        0,
                    )
                }),
            );
        }
        build_index(&node, &grp);

        // First run dies at the index rebuild: partitions are renamed,
        // no marker is written.
        let err = run_defrag(&node, Arc::new(FailingIndexing)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DefragmentationError>(),
            Some(DefragmentationError::IndexDefragmentationFailed(_))
        ));

        let work_dir = grp.work_dir();
        assert!(!file_utils::defragmentation_completion_marker_file(work_dir).exists());
        for part in 0..4u16 {
            assert!(file_utils::defragmented_part_file(work_dir, part).exists());
            assert!(file_utils::part_file(work_dir, part).exists());
        }

        // Roll partitions 2 and 3 back to "crashed before the rename".
        for part in 2..4u16 {
            std::fs::remove_file(file_utils::defragmented_part_file(work_dir, part)).unwrap();
        }
    }

    // Restart: partitions 0 and 1 are skipped (link maps reopened), 2 and
    // 3 rebuilt, the index follows, the swap completes.
    let node = reopen_node(dir.path(), std::slice::from_ref(&config));
    let indexing = Arc::new(RecordingIndexing::default());
    run_defrag(&node, Arc::clone(&indexing) as Arc<dyn Indexing>).unwrap();

    let lens = indexing.link_map_lens.lock().unwrap().clone();
    for part in 0..4u16 {
        assert_eq!(lens[&part], rows_per_part as u64, "partition {part}");
    }

    let work_dir = node.groups[0].work_dir().to_path_buf();
    let files = list_files(&work_dir);
    assert!(files.iter().all(|f| !f.starts_with("part-dfrg-")), "files: {files:?}");
    assert!(files.iter().all(|f| !f.starts_with("part-map-")));
    assert!(!file_utils::defragmentation_completion_marker_file(&work_dir).exists());

    let mut total = 0;
    for part in 0..4u16 {
        let store = reopen_partition(&work_dir, part);
        let rows = collect_rows(&store);
        assert_eq!(rows.len(), rows_per_part as usize);
        assert!(rows
            .iter()
            .all(|r| r.key.starts_with(format!("k{part}-").as_bytes())));
        total += rows.len();
    }
    assert_eq!(total, 4 * rows_per_part as usize);

    // The rebuilt index resolves every key through the new files.
    let entries = index_entries(&work_dir);
    assert_eq!(entries.len(), total);
    for (key, link) in entries {
        let part = page_id::partition(link);
        let store = reopen_partition(&work_dir, part);
        assert_eq!(store.read_row(link).unwrap().key, key);
    }
}

#[test]
fn test_unsupported_meta_version_fails_without_rename() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(7, "meta-v4"));
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        7,
        (0..5u32).map(|i| (format!("{i}").into_bytes(), b"v".to_vec(), 0)),
    );
    {
        let mut state = store.handle().state().unwrap();
        PageHeader::from_bytes_mut(state.page_mut(0).unwrap())
            .unwrap()
            .set_version(4);
    }

    let err = run_defrag(&node, Arc::new(BTreeIndexing)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DefragmentationError>(),
        Some(DefragmentationError::UnsupportedMetaVersion { version: 4 })
    ));

    let work_dir = grp.work_dir();
    assert!(!file_utils::defragmented_part_file(work_dir, 0).exists());
    assert!(!file_utils::defragmentation_completion_marker_file(work_dir).exists());
    // The partial tmp file stays for the next run.
    assert!(file_utils::defragmented_part_tmp_file(work_dir, 0).exists());
    // The failed run keeps the maintenance task registered.
    assert!(node.maintenance.is_registered(DEFRAGMENTATION_MNTC_TASK_NAME));
}

#[test]
fn test_encrypted_group_with_reencryption_counters_fails_fast() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());

    let mut config = group_config(8, "encrypted");
    config.encrypted = true;
    let grp = add_group(&mut node, config);
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        8,
        (0..5u32).map(|i| (format!("{i}").into_bytes(), b"v".to_vec(), 0)),
    );
    {
        let mut state = store.handle().state().unwrap();
        let meta = partition_meta_mut(state.page_mut(0).unwrap()).unwrap();
        meta.encrypted_page_count = 12;
        meta.encrypted_page_index = 3;
    }

    let err = run_defrag(&node, Arc::new(BTreeIndexing)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DefragmentationError>(),
        Some(DefragmentationError::EncryptedGroupCounters { count: 12, index: 3 })
    ));

    assert!(!file_utils::defragmented_part_file(grp.work_dir(), 0).exists());
}

#[test]
fn test_group_with_completion_marker_is_skipped() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(9, "done"));
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        9,
        (0..50u32).map(|i| (format!("{i:04}").into_bytes(), b"v".to_vec(), 0)),
    );

    // Pretend a previous run finished everything but crashed between the
    // marker and the swap.
    let renamed = file_utils::defragmented_part_file(grp.work_dir(), 0);
    std::fs::copy(file_utils::part_file(grp.work_dir(), 0), &renamed).unwrap();
    file_utils::write_defragmentation_completion_marker(grp.work_dir()).unwrap();

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    // The skip check completed the swap without running any pipeline.
    let files = list_files(grp.work_dir());
    assert!(files.iter().all(|f| !f.starts_with("part-map-")), "files: {files:?}");
    assert!(!renamed.exists());
    assert!(!file_utils::defragmentation_completion_marker_file(grp.work_dir()).exists());
    assert!(file_utils::part_file(grp.work_dir(), 0).exists());
    assert!(!node.maintenance.is_registered(DEFRAGMENTATION_MNTC_TASK_NAME));

    let reopened = reopen_partition(grp.work_dir(), 0);
    assert_eq!(collect_rows(&reopened).len(), 50);
}

#[test]
fn test_two_groups_switch_eviction_mode() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());

    let grp_a = add_group(&mut node, group_config(11, "first"));
    let store_a = create_partition(&node, &grp_a, 0, true);
    insert_rows(
        &grp_a,
        &store_a,
        11,
        (0..100u32).map(|i| (format!("a{i:04}").into_bytes(), b"1".to_vec(), 0)),
    );

    let mut config_b = group_config(12, "second");
    config_b.page_eviction_mode = PageEvictionMode::RandomLru;
    let grp_b = add_group(&mut node, config_b);
    let store_b = create_partition(&node, &grp_b, 0, true);
    insert_rows(
        &grp_b,
        &store_b,
        12,
        (0..100u32).map(|i| (format!("b{i:04}").into_bytes(), b"2".to_vec(), 0)),
    );

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    assert_eq!(
        node.part_region.page_eviction_mode(),
        PageEvictionMode::RandomLru
    );

    for (grp, prefix) in [(&grp_a, "a"), (&grp_b, "b")] {
        let store = reopen_partition(grp.work_dir(), 0);
        let rows = collect_rows(&store);
        assert_eq!(rows.len(), 100);
        assert!(rows.iter().all(|r| r.key.starts_with(prefix.as_bytes())));
    }
}

#[test]
fn test_defragmentation_compacts_the_file() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(13, "compaction"));
    let store = create_partition(&node, &grp, 0, true);

    // Interleave inserts across two key ranges so the tree pages end up
    // half full, then verify the rewrite shrinks the file.
    let keys: Vec<u32> = (0..2_000u32)
        .map(|i| if i % 2 == 0 { i } else { 1_000_000 - i })
        .collect();
    insert_rows(
        &grp,
        &store,
        13,
        keys.into_iter()
            .map(|k| (format!("{k:07}").into_bytes(), vec![7u8; 64], 0)),
    );

    // Dead pages of dropped data widen the gap the rewrite closes.
    {
        let mut state = store.handle().state().unwrap();
        for _ in 0..64 {
            state.allocate_page().unwrap();
        }
    }

    let old_pages = store.handle().state().unwrap().page_count();

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    let new_store = reopen_partition(grp.work_dir(), 0);
    let new_pages = new_store.handle().state().unwrap().page_count();

    assert!(
        new_pages < old_pages,
        "expected compaction: {new_pages} >= {old_pages}"
    );
    assert_eq!(collect_rows(&new_store).len(), 2_000);
}

#[test]
fn test_row_hash_keys_lookup_after_defragmentation() {
    let dir = TempDir::new().unwrap();
    let mut node = new_node(dir.path());
    let grp = add_group(&mut node, group_config(14, "lookup"));
    let store = create_partition(&node, &grp, 0, true);

    insert_rows(
        &grp,
        &store,
        14,
        (0..200u32).map(|i| (format!("key-{i}").into_bytes(), format!("val-{i}").into_bytes(), 0)),
    );

    run_defrag(&node, Arc::new(BTreeIndexing)).unwrap();

    let new_store = reopen_partition(grp.work_dir(), 0);
    for i in (0..200u32).step_by(17) {
        let key = format!("key-{i}").into_bytes();
        let row = new_store
            .lookup(partdefrag::cache::UNDEFINED_CACHE_ID, key_hash(&key), &key)
            .unwrap()
            .unwrap();
        assert_eq!(row.value, format!("val-{i}").into_bytes());
    }
}
