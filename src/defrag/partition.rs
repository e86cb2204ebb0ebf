//! # Partition Pipeline
//!
//! Rewrites one partition of a cache group: temporary stores, row copy
//! through the new free list and trees, link-map bookkeeping, and the
//! partition meta copy.
//!
//! The copy loop runs under the checkpoint read lock and cycles it every
//! `CHECKPOINT_LOCK_HOLD_LIMIT` of wall clock so the defragmentation
//! checkpointer can flush mid-partition. Store handles are locked per
//! operation, never across a yield.
//!
//! Ownership is arena-style: the coordinator owns the old and new group
//! contexts for the duration of one group, a `PartitionContext` only
//! borrows them (plus handles), so the cyclic old/new references of the
//! pipeline never own each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use eyre::{ensure, Result};

use crate::cache::row::UNDEFINED_CACHE_ID;
use crate::cache::{CacheDataStore, CacheGroupContext, DataRow, SimpleDataRow};
use crate::checkpoint::{CheckpointLock, CHECKPOINT_LOCK_HOLD_LIMIT};
use crate::error::DefragmentationError;
use crate::memory::{DataRegion, PageStoreHandle};
use crate::storage::meta::{
    is_supported_meta_version, meta_version, partition_meta, partition_meta_mut,
    read_shared_group_cache_sizes, write_shared_group_cache_sizes, LATEST_META_VERSION,
};
use crate::storage::page_id::{self, GroupId, PartitionId};
use crate::storage::read_item;
use crate::store_mgr::FilePageStoreFactory;

use super::file_utils;
use super::link_map::LinkMap;
use super::tree_iterator;

pub(crate) struct PartitionContext<'g> {
    pub work_dir: PathBuf,
    pub grp_id: GroupId,
    pub part_id: PartitionId,
    pub part_region: DataRegion,
    pub mapping_region: DataRegion,
    pub old_grp: &'g CacheGroupContext,
    pub new_grp: &'g CacheGroupContext,
    pub old_cache_data_store: Arc<CacheDataStore>,
    pub page_store_factory: FilePageStoreFactory,
    pub cp_lock: Arc<CheckpointLock>,
    pub new_cache_data_store: Option<Arc<CacheDataStore>>,
    pub link_map: Option<LinkMap>,
    pub part_store_handle: Option<Arc<PageStoreHandle>>,
    pub mapping_store_handle: Option<Arc<PageStoreHandle>>,
}

impl<'g> PartitionContext<'g> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        work_dir: PathBuf,
        grp_id: GroupId,
        part_id: PartitionId,
        part_region: DataRegion,
        mapping_region: DataRegion,
        old_grp: &'g CacheGroupContext,
        new_grp: &'g CacheGroupContext,
        old_cache_data_store: Arc<CacheDataStore>,
        page_store_factory: FilePageStoreFactory,
        cp_lock: Arc<CheckpointLock>,
    ) -> Self {
        Self {
            work_dir,
            grp_id,
            part_id,
            part_region,
            mapping_region,
            old_grp,
            new_grp,
            old_cache_data_store,
            page_store_factory,
            cp_lock,
            new_cache_data_store: None,
            link_map: None,
            part_store_handle: None,
            mapping_store_handle: None,
        }
    }

    /// Creates (or reopens, when resuming) the mapping store of this
    /// partition and registers it in the mapping region.
    pub fn create_mapping_page_store(&mut self) -> Result<()> {
        let path = file_utils::defragmented_part_mapping_file(&self.work_dir, self.part_id);

        let handle = {
            let _guard = self.cp_lock.read_lock();
            if path.exists() {
                self.page_store_factory.open_page_store(self.part_id, &path)?
            } else {
                self.page_store_factory.create_page_store(self.part_id, &path)?
            }
        };

        handle.state()?.sync()?;
        self.mapping_region.page_memory().add_store(Arc::clone(&handle));
        self.mapping_store_handle = Some(handle);

        Ok(())
    }

    /// Creates the temporary partition store (`part-dfrg-N.bin.tmp`),
    /// deleting a stale leftover of a crashed run first, and registers it
    /// in the partition region.
    pub fn create_part_page_store(&mut self) -> Result<()> {
        let path = file_utils::defragmented_part_tmp_file(&self.work_dir, self.part_id);

        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                DefragmentationError::PageIo(format!(
                    "failed to delete stale '{}': {e}",
                    path.display()
                ))
            })?;
        }

        let handle = {
            let _guard = self.cp_lock.read_lock();
            self.page_store_factory.create_page_store(self.part_id, &path)?
        };

        handle.state()?.sync()?;
        self.part_region.page_memory().add_store(Arc::clone(&handle));
        self.part_store_handle = Some(handle);

        Ok(())
    }

    /// Creates or reopens the link map over the mapping store.
    pub fn create_link_map_tree(&mut self, init_new: bool) -> Result<LinkMap> {
        let handle = self
            .mapping_store_handle
            .as_ref()
            .ok_or_else(|| eyre::eyre!("mapping store must be created before the link map"))?;

        let link_map = {
            let _guard = self.cp_lock.read_lock();
            LinkMap::new(Arc::clone(handle), self.part_id, init_new)?
        };

        self.link_map = Some(link_map.clone());
        Ok(link_map)
    }

    /// Builds the new cache data store over the temporary partition
    /// store; formats meta (latest version) and empty trees under the
    /// checkpoint read lock.
    pub fn create_new_cache_data_store(&mut self) -> Result<()> {
        let handle = self
            .part_store_handle
            .as_ref()
            .ok_or_else(|| eyre::eyre!("partition store must be created before the data store"))?;

        let store = {
            let _guard = self.cp_lock.read_lock();
            CacheDataStore::create(Arc::clone(handle), self.part_id, LATEST_META_VERSION)?
        };

        self.new_grp.add_data_store(Arc::clone(&store));
        self.new_cache_data_store = Some(store);
        Ok(())
    }
}

/// Copies every row of the old cache data tree into the new partition
/// store, recording `old link -> new link` and repopulating the pending
/// entries tree, then persists free-list metadata and the partition meta.
pub(crate) fn copy_partition_data(part_ctx: &mut PartitionContext<'_>) -> Result<()> {
    let old_store = Arc::clone(&part_ctx.old_cache_data_store);
    let new_store = Arc::clone(
        part_ctx
            .new_cache_data_store
            .as_ref()
            .ok_or_else(|| eyre::eyre!("new cache data store is not created"))?,
    );
    let link_map = part_ctx
        .link_map
        .clone()
        .ok_or_else(|| eyre::eyre!("link map is not created"))?;
    let tree_root = old_store
        .tree_root()
        .ok_or_else(|| eyre::eyre!("old partition has no cache data tree"))?;

    let inline_cache_ids = part_ctx.old_grp.store_cache_id_in_data_page();
    let cp_lock = Arc::clone(&part_ctx.cp_lock);

    let mut cp_guard = Some(cp_lock.read_lock());
    let mut last_cp_lock_ts = Instant::now();
    let mut entries_processed = 0u64;

    {
        // The old store is read-only for this engine and is not flushed
        // by the defragmentation checkpoint, so its guard may span
        // yields; the new-store guards below are per operation.
        let old_state = old_store.handle().state()?;

        tree_iterator::iterate(&old_state, tree_root, |leaf, idx| {
            if last_cp_lock_ts.elapsed() >= CHECKPOINT_LOCK_HOLD_LIMIT {
                cp_guard.take();
                cp_guard = Some(cp_lock.read_lock());
                last_cp_lock_ts = Instant::now();
            }

            let old_link = u64::from_be_bytes(leaf.value_at(idx)?.try_into()?);

            let payload_page =
                old_state.page(page_id::page_index(page_id::link_page_id(old_link)))?;
            let payload = read_item(payload_page, page_id::item_id(old_link))?;
            let mut row = DataRow::from_payload(payload, old_link)?;

            let cache_id = row.cache_id;

            // Fresh storage for the reused row.
            row.link = 0;

            // The new free list would corrupt the page layout for
            // non-inlining groups otherwise.
            if !inline_cache_ids {
                row.cache_id = UNDEFINED_CACHE_ID;
            }

            new_store.insert_data_row(&mut row)?;

            // Put it back.
            row.cache_id = cache_id;

            new_store.put_tree_row(&row)?;

            link_map.put(old_link, row.link)?;

            if row.expire_time != 0 {
                new_store.put_pending(cache_id, row.expire_time, row.link)?;
            }

            entries_processed += 1;
            Ok(true)
        })?;
    }

    // Fresh lock span for the metadata phase.
    drop(cp_guard);
    let _guard = cp_lock.read_lock();

    new_store.save_free_list_metadata()?;
    copy_partition_meta(part_ctx, &old_store, &new_store)?;

    log::debug!(
        "partition {} of group {} copied, {} entries processed",
        part_ctx.part_id,
        part_ctx.grp_id,
        entries_processed
    );

    Ok(())
}

/// Copies the partition meta page of the old store into the new one:
/// state, size, update counter, global remove id, the shared-group
/// counters chain, and the update-counter gaps blob.
pub(crate) fn copy_partition_meta(
    part_ctx: &PartitionContext<'_>,
    old_store: &CacheDataStore,
    new_store: &CacheDataStore,
) -> Result<()> {
    let (version, old_meta) = {
        let state = old_store.handle().state()?;
        let page = state.page(0)?;
        (meta_version(page)?, *partition_meta(page)?)
    };

    // Newer meta versions may contain data this engine does not copy.
    if !is_supported_meta_version(version) {
        return Err(DefragmentationError::UnsupportedMetaVersion { version }.into());
    }

    // Encrypted groups track reencryption progress in these counters;
    // zeroing them would silently lose it.
    if part_ctx.old_grp.config().encrypted
        && (old_meta.encrypted_page_count != 0 || old_meta.encrypted_page_index != 0)
    {
        return Err(DefragmentationError::EncryptedGroupCounters {
            count: old_meta.encrypted_page_count,
            index: old_meta.encrypted_page_index,
        }
        .into());
    }

    let new_counters_page_id = if old_meta.counters_page_id != 0 {
        let sizes = {
            let state = old_store.handle().state()?;
            read_shared_group_cache_sizes(&state, old_meta.counters_page_id)?
        };
        let mut state = new_store.handle().state()?;
        Some(write_shared_group_cache_sizes(
            &mut state,
            part_ctx.part_id,
            &sizes,
        )?)
    } else {
        None
    };

    let new_gaps_link = if old_meta.gaps_link != 0 {
        let gaps_bytes = old_store.read_row_bytes(old_meta.gaps_link)?;
        let mut gaps_row = SimpleDataRow::new(part_ctx.part_id, gaps_bytes);
        new_store.insert_blob_row(&mut gaps_row)?;
        Some(gaps_row.link)
    } else {
        None
    };

    let mut state = new_store.handle().state()?;
    let new_meta = partition_meta_mut(state.page_mut(0)?)?;

    new_meta.partition_state = old_meta.partition_state;
    new_meta.size = old_meta.size;
    new_meta.update_counter = old_meta.update_counter;
    new_meta.global_remove_id = old_meta.global_remove_id;

    if let Some(counters_page_id) = new_counters_page_id {
        new_meta.counters_page_id = counters_page_id;
    }
    if let Some(gaps_link) = new_gaps_link {
        ensure!(gaps_link != 0, "gaps blob landed at the null link");
        new_meta.gaps_link = gaps_link;
    }

    new_meta.encrypted_page_count = 0;
    new_meta.encrypted_page_index = 0;

    Ok(())
}
