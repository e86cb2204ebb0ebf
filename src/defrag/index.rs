//! # Index Rebuilder Hook
//!
//! After every partition of a group is rewritten and its closing
//! checkpoints finalized, the indexing subsystem rebuilds the group's
//! index partition into the temporary index store. The engine hands it
//! the per-partition link maps; the implementation must translate every
//! link it encounters, because no old link survives a rewrite.
//!
//! The indexing subsystem's internal tree code is not this engine's
//! concern; `BTreeIndexing` is the reference implementation for groups
//! whose index is a single key-to-link tree. `NoopIndexing` stands in
//! when the indexing module is disabled.

use std::sync::Arc;
use std::time::Instant;

use eyre::Result;
use hashbrown::HashMap;

use crate::btree::BTree;
use crate::cache::CacheGroupContext;
use crate::checkpoint::{CheckpointLock, CHECKPOINT_LOCK_HOLD_LIMIT};
use crate::memory::PageMemory;
use crate::storage::meta::{index_meta, index_meta_mut};
use crate::storage::page_id::{self, PartitionId};
use crate::storage::INDEX_PARTITION;

use super::link_map::LinkMap;
use super::tree_iterator;

pub trait Indexing: Send + Sync {
    fn module_enabled(&self) -> bool;

    /// Rebuilds the index partition of `old_grp` into the temporary index
    /// store registered at `INDEX_PARTITION` in `part_page_memory`,
    /// translating every row link through `mapping_by_partition`.
    fn defragment(
        &self,
        old_grp: &CacheGroupContext,
        new_grp: &CacheGroupContext,
        part_page_memory: &Arc<PageMemory>,
        mapping_by_partition: &HashMap<PartitionId, LinkMap>,
        cp_lock: &Arc<CheckpointLock>,
    ) -> Result<()>;
}

/// Indexing module disabled; groups keep no rebuilt index.
#[derive(Debug, Default)]
pub struct NoopIndexing;

impl Indexing for NoopIndexing {
    fn module_enabled(&self) -> bool {
        false
    }

    fn defragment(
        &self,
        _old_grp: &CacheGroupContext,
        _new_grp: &CacheGroupContext,
        _part_page_memory: &Arc<PageMemory>,
        _mapping_by_partition: &HashMap<PartitionId, LinkMap>,
        _cp_lock: &Arc<CheckpointLock>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Rebuilds a single key-to-link index tree by walking the old index in
/// key order and re-inserting with translated links.
#[derive(Debug, Default)]
pub struct BTreeIndexing;

impl Indexing for BTreeIndexing {
    fn module_enabled(&self) -> bool {
        true
    }

    fn defragment(
        &self,
        old_grp: &CacheGroupContext,
        _new_grp: &CacheGroupContext,
        part_page_memory: &Arc<PageMemory>,
        mapping_by_partition: &HashMap<PartitionId, LinkMap>,
        cp_lock: &Arc<CheckpointLock>,
    ) -> Result<()> {
        let grp_id = old_grp.grp_id();

        let old_handle = old_grp
            .data_region()
            .page_memory()
            .get_store(grp_id, INDEX_PARTITION)?;
        let new_handle = part_page_memory.get_store(grp_id, INDEX_PARTITION)?;

        let old_root = {
            let state = old_handle.state()?;
            index_meta(state.page(0)?)?.index_tree_root
        };

        let mut cp_guard = Some(cp_lock.read_lock());
        let mut last_cp_lock_ts = Instant::now();

        {
            let old_state = old_handle.state()?;

            tree_iterator::iterate(&old_state, old_root, |leaf, idx| {
                if last_cp_lock_ts.elapsed() >= CHECKPOINT_LOCK_HOLD_LIMIT {
                    cp_guard.take();
                    cp_guard = Some(cp_lock.read_lock());
                    last_cp_lock_ts = Instant::now();
                }

                let key = leaf.key_at(idx)?;
                let old_link = u64::from_be_bytes(leaf.value_at(idx)?.try_into()?);
                let part = page_id::partition(old_link);

                let mapping = mapping_by_partition.get(&part).ok_or_else(|| {
                    eyre::eyre!("no link map for partition {} of group {}", part, grp_id)
                })?;
                let new_link = mapping.get(old_link)?.ok_or_else(|| {
                    eyre::eyre!(
                        "link {:#x} of partition {} has no defragmentation mapping",
                        old_link,
                        part
                    )
                })?;

                let mut state = new_handle.state()?;
                let root = index_meta(state.page(0)?)?.index_tree_root;
                let mut tree = BTree::new(&mut state, root)?;
                tree.put(key, &new_link.to_be_bytes())?;
                if tree.root_page() != root {
                    index_meta_mut(state.page_mut(0)?)?.index_tree_root = tree.root_page();
                }

                Ok(true)
            })?;
        }

        drop(cp_guard);
        Ok(())
    }
}
