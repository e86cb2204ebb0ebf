//! # Defragmentation Engine
//!
//! The coordinator and its per-partition pipelines. A single logical
//! worker walks the node's cache groups sequentially; for every group it
//! rewrites each partition file into a compacted one, records every row's
//! `old link -> new link` translation, lets the indexing subsystem
//! rebuild the index partition from those maps, and commits the group by
//! atomically creating a completion marker before swapping the files in.
//!
//! ```text
//! resume WAL, checkpoint "beforeDefragmentation", deactivate WAL
//! for each user cache group:
//!     skip if the completion marker exists (finishing the swap)
//!     bootstrap the temp index store, start the new group context
//!     for each partition:
//!         mapping store + link map  (reopened when resuming)
//!         skip if part-dfrg-N.bin exists
//!         temp store, new cache data store, copy rows, copy meta
//!         force checkpoint; on completion: invalidate + rename
//!     await all partition checkpoints (renames included)
//!     index defragmentation + checkpoint
//!     on completion: invalidate index, clear mappings,
//!                    rename index, write marker, batch rename
//! unregister the maintenance task
//! ```
//!
//! Crash safety rests on two commit points: `part-dfrg-N.bin` per
//! partition and the completion marker per group. Everything between
//! them is rebuilt by the next run; nothing is ever rolled back.
//!
//! - `file_utils`: names, skip checks, renames, markers (C7)
//! - `tree_iterator`: leaf walk with yield points (C4)
//! - `link_map`: persistent old-to-new link translation (C5)
//! - `partition`: the per-partition pipeline (C6)
//! - `index`: the indexing hook (C8)

pub mod file_utils;
mod index;
mod link_map;
mod partition;
mod tree_iterator;

pub use index::{BTreeIndexing, Indexing, NoopIndexing};
pub use link_map::{LinkMap, LINK_MAP_META_PAGE_IDX};
pub use tree_iterator::iterate;

use std::sync::Arc;

use eyre::Result;
use hashbrown::{HashMap, HashSet};

use crate::cache::{CacheDataStore, CacheGroupContext};
use crate::checkpoint::{CheckpointController, CheckpointFuture, CompoundFuture};
use crate::db::{
    DatabaseManager, DEFRAGMENTATION_MAPPING_REGION_NAME, DEFRAGMENTATION_PART_REGION_NAME,
};
use crate::maintenance::{MaintenanceRegistry, DEFRAGMENTATION_MNTC_TASK_NAME};
use crate::memory::{DataRegion, PageEvictionMode};
use crate::storage::page_id::GroupId;
use crate::storage::{PartitionId, INDEX_PARTITION, PAGE_SIZE};
use crate::store_mgr::{FilePageStoreFactory, FilePageStoreManager};

use partition::{copy_partition_data, PartitionContext};

pub struct Defragmenter {
    /// Explicit group filter; empty means every user group.
    cache_groups_for_defragmentation: HashSet<GroupId>,
    groups: Vec<Arc<CacheGroupContext>>,
    db: Arc<DatabaseManager>,
    file_page_store_mgr: Arc<FilePageStoreManager>,
    maintenance_registry: Arc<MaintenanceRegistry>,
    indexing: Arc<dyn Indexing>,
    node_checkpoint: Arc<CheckpointController>,
    defragmentation_checkpoint: Arc<CheckpointController>,
    part_data_region: DataRegion,
    mapping_data_region: DataRegion,
}

impl Defragmenter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache_grp_ids: Vec<GroupId>,
        groups: Vec<Arc<CacheGroupContext>>,
        db: Arc<DatabaseManager>,
        file_page_store_mgr: Arc<FilePageStoreManager>,
        maintenance_registry: Arc<MaintenanceRegistry>,
        indexing: Arc<dyn Indexing>,
        node_checkpoint: Arc<CheckpointController>,
        defragmentation_checkpoint: Arc<CheckpointController>,
    ) -> Result<Self> {
        let part_data_region = db.data_region(DEFRAGMENTATION_PART_REGION_NAME)?;
        let mapping_data_region = db.data_region(DEFRAGMENTATION_MAPPING_REGION_NAME)?;

        Ok(Self {
            cache_groups_for_defragmentation: cache_grp_ids.into_iter().collect(),
            groups,
            db,
            file_page_store_mgr,
            maintenance_registry,
            indexing,
            node_checkpoint,
            defragmentation_checkpoint,
            part_data_region,
            mapping_data_region,
        })
    }

    /// Runs the whole defragmentation procedure. The defragmentation
    /// checkpointer is stopped on every exit path; partially produced
    /// `.tmp` files are left behind for the next run.
    pub fn execute(&self) -> Result<()> {
        log::info!("Defragmentation started.");

        let result = self.defragment_groups();

        self.defragmentation_checkpoint.stop(true);

        if result.is_ok() {
            log::info!("Defragmentation completed. All partitions are defragmented.");
        }
        result
    }

    fn defragment_groups(&self) -> Result<()> {
        // The checkpointer must be running so all pages on disk are in
        // their latest valid state before anything is copied.
        self.db.resume_wal_logging();
        self.db.on_state_restored();

        self.node_checkpoint
            .force_checkpoint("beforeDefragmentation")?
            .wait()?;

        self.db.deactivate_wal();

        let mut idx_dfrg_fut: Option<CheckpointFuture> = None;
        let mut prev_page_eviction_mode: Option<PageEvictionMode> = None;

        for old_grp in &self.groups {
            if !old_grp.user_cache() {
                continue;
            }

            let grp_id = old_grp.grp_id();

            if !self.cache_groups_for_defragmentation.is_empty()
                && !self.cache_groups_for_defragmentation.contains(&grp_id)
            {
                continue;
            }

            let work_dir = self.file_page_store_mgr.cache_work_dir(grp_id)?;

            if file_utils::skip_already_defragmented_cache_group(&work_dir, grp_id)? {
                continue;
            }

            let mut old_cache_data_stores: Vec<Arc<CacheDataStore>> = Vec::new();
            for store in old_grp.data_stores() {
                if self.file_page_store_mgr.exists(grp_id, store.part_id())? {
                    old_cache_data_stores.push(store);
                }
            }

            if !old_cache_data_stores.is_empty() {
                // The part region cannot serve a group whose eviction mode
                // differs from the previous group's while that group's
                // index rewrite is still in flight.
                let cur_page_eviction_mode = old_grp.config().page_eviction_mode;
                if prev_page_eviction_mode != Some(cur_page_eviction_mode) {
                    prev_page_eviction_mode = Some(cur_page_eviction_mode);

                    if let Some(fut) = &idx_dfrg_fut {
                        fut.wait()?;
                    }
                    self.part_data_region
                        .set_page_eviction_mode(cur_page_eviction_mode);
                }

                self.db
                    .remove_checkpointed_region(old_grp.data_region().name());
                old_grp.unregister_ttl();
                // The page layer would still emit WAL deltas for the
                // group unless it is disabled explicitly.
                old_grp.set_local_wal_enabled(false);
                self.db.disable_group_wal(grp_id);

                let encrypted = old_grp.config().encrypted;
                let page_store_factory =
                    self.file_page_store_mgr.page_store_factory(grp_id, encrypted);

                self.create_index_page_store(grp_id, &work_dir, &page_store_factory)?;

                let new_grp = CacheGroupContext::new(
                    old_grp.config().clone(),
                    self.part_data_region.clone(),
                    work_dir.clone(),
                );

                {
                    // Initializes the index partition meta tree and reuse
                    // list of the new group.
                    let cp_lock = self.defragmentation_checkpoint.checkpoint_lock();
                    let _guard = cp_lock.read_lock();
                    new_grp.start()?;
                }

                let old_page_mem = Arc::clone(old_grp.data_region().page_memory());
                let mut cmp_fut = CompoundFuture::new();
                let mut link_map_by_part: HashMap<PartitionId, LinkMap> = HashMap::new();

                for old_cache_data_store in &old_cache_data_stores {
                    let part_id = old_cache_data_store.part_id();

                    let mut part_ctx = PartitionContext::new(
                        work_dir.clone(),
                        grp_id,
                        part_id,
                        self.part_data_region.clone(),
                        self.mapping_data_region.clone(),
                        old_grp,
                        &new_grp,
                        Arc::clone(old_cache_data_store),
                        page_store_factory,
                        self.defragmentation_checkpoint.checkpoint_lock(),
                    );

                    if file_utils::skip_already_defragmented_partition(&work_dir, grp_id, part_id)? {
                        // The link map still feeds the index rebuild.
                        part_ctx.create_mapping_page_store()?;
                        link_map_by_part
                            .insert(part_id, part_ctx.create_link_map_tree(false)?);
                        continue;
                    }

                    // A mapping file left by an interrupted attempt at this
                    // partition is stale; the link map meta must land at
                    // its well-known index in a fresh store.
                    let mapping_file =
                        file_utils::defragmented_part_mapping_file(&work_dir, part_id);
                    if mapping_file.exists() {
                        std::fs::remove_file(&mapping_file).map_err(|e| {
                            crate::error::DefragmentationError::PageIo(format!(
                                "failed to delete stale '{}': {e}",
                                mapping_file.display()
                            ))
                        })?;
                    }

                    part_ctx.create_mapping_page_store()?;
                    link_map_by_part.insert(part_id, part_ctx.create_link_map_tree(true)?);

                    if old_cache_data_store.tree_root().is_none() {
                        // Never-initialized partition: nothing to copy,
                        // nothing to rename; the old file stays as is.
                        continue;
                    }

                    part_ctx.create_part_page_store()?;
                    part_ctx.create_new_cache_data_store()?;

                    copy_partition_data(&mut part_ctx)?;

                    let cp_fut = self
                        .defragmentation_checkpoint
                        .force_checkpoint("partition defragmented")?;

                    let listener_work_dir = work_dir.clone();
                    let listener_old_page_mem = Arc::clone(&old_page_mem);
                    let listener_part_page_mem =
                        Arc::clone(self.part_data_region.page_memory());
                    let listener_store_mgr = Arc::clone(&self.file_page_store_mgr);
                    let part_store_handle = part_ctx
                        .part_store_handle
                        .clone()
                        .expect("partition store was created above");
                    let mapping_store_handle = part_ctx
                        .mapping_store_handle
                        .clone()
                        .expect("mapping store was created above");

                    cp_fut.listen(move || {
                        if log::log_enabled!(log::Level::Debug) {
                            // The old store may be gone; never trust the
                            // lookup for the log line.
                            let old_pages = listener_store_mgr
                                .get_store(grp_id, part_id)
                                .ok()
                                .and_then(|h| h.page_count().ok());

                            log::debug!(
                                "Partition defragmented [grpId={}, partId={}, oldPages={}, \
                                 newPages={:?}, mappingPages={:?}, pageSize={}, partFile={}, workDir={}]",
                                grp_id,
                                part_id,
                                old_pages.map_or_else(|| "?".to_string(), |p| p.to_string()),
                                part_store_handle.page_count().ok(),
                                mapping_store_handle.page_count().ok(),
                                PAGE_SIZE,
                                file_utils::defragmented_part_file(&listener_work_dir, part_id)
                                    .display(),
                                listener_work_dir.display(),
                            );
                        }

                        listener_old_page_mem.invalidate(grp_id, part_id);
                        listener_part_page_mem.invalidate(grp_id, part_id);
                        // Yes, it will be invalid in a second.
                        listener_part_page_mem.remove_store(grp_id, part_id);

                        file_utils::rename_temp_partition_file(&listener_work_dir, part_id)
                    });

                    cmp_fut.add(cp_fut);
                }

                // All partition checkpoints, renames included, before the
                // index is touched.
                cmp_fut.wait_all()?;

                let idx_fut = if self.file_page_store_mgr.has_index_store(grp_id)? {
                    self.defragment_index_partition(old_grp, &new_grp, &link_map_by_part)?;

                    self.defragmentation_checkpoint
                        .force_checkpoint("index defragmented")?
                } else {
                    CheckpointFuture::finished()
                };

                let listener_work_dir = work_dir.clone();
                let listener_old_page_mem = Arc::clone(&old_page_mem);
                let listener_part_page_mem = Arc::clone(self.part_data_region.page_memory());
                let listener_mapping_page_mem =
                    Arc::clone(self.mapping_data_region.page_memory());

                idx_fut.listen(move || {
                    listener_old_page_mem.invalidate(grp_id, INDEX_PARTITION);
                    listener_part_page_mem.invalidate(grp_id, INDEX_PARTITION);
                    listener_part_page_mem.remove_store(grp_id, INDEX_PARTITION);
                    listener_mapping_page_mem.clear_group(grp_id);

                    file_utils::rename_temp_index_file(&listener_work_dir)?;
                    file_utils::write_defragmentation_completion_marker(&listener_work_dir)?;
                    file_utils::batch_rename_defragmented_cache_group_partitions(
                        &listener_work_dir,
                    )
                });

                idx_dfrg_fut = Some(idx_fut);
            }

            if let Some(fut) = &idx_dfrg_fut {
                fut.wait()?;
            }
        }

        self.maintenance_registry
            .unregister_maintenance_task(DEFRAGMENTATION_MNTC_TASK_NAME);

        Ok(())
    }

    /// Deletes a stale temp index store of a crashed run, creates a fresh
    /// one under the checkpoint read lock, and registers it in the part
    /// region at `INDEX_PARTITION`.
    ///
    /// There is a window where the index is already defragmented but the
    /// marker is not written yet; a crash there means the index is
    /// rewritten once more on the next run, which is fine.
    fn create_index_page_store(
        &self,
        grp_id: GroupId,
        work_dir: &std::path::Path,
        page_store_factory: &FilePageStoreFactory,
    ) -> Result<()> {
        let tmp = file_utils::defragmented_index_tmp_file(work_dir);
        if tmp.exists() {
            std::fs::remove_file(&tmp).map_err(|e| {
                crate::error::DefragmentationError::PageIo(format!(
                    "failed to delete stale '{}': {e}",
                    tmp.display()
                ))
            })?;
        }

        let handle = {
            let cp_lock = self.defragmentation_checkpoint.checkpoint_lock();
            let _guard = cp_lock.read_lock();
            page_store_factory.create_page_store(INDEX_PARTITION, &tmp)?
        };

        handle.state()?.sync()?;
        self.part_data_region.page_memory().add_store(handle);

        Ok(())
    }

    fn defragment_index_partition(
        &self,
        old_grp: &Arc<CacheGroupContext>,
        new_grp: &Arc<CacheGroupContext>,
        mapping_by_partition: &HashMap<PartitionId, LinkMap>,
    ) -> Result<()> {
        if !self.indexing.module_enabled() {
            return Ok(());
        }

        let cp_lock = self.defragmentation_checkpoint.checkpoint_lock();

        self.indexing
            .defragment(
                old_grp,
                new_grp,
                self.part_data_region.page_memory(),
                mapping_by_partition,
                &cp_lock,
            )
            .map_err(|e| {
                crate::error::DefragmentationError::IndexDefragmentationFailed(format!("{e:#}"))
                    .into()
            })
    }
}
