//! # Cache Data Store
//!
//! The per-partition storage unit: the cache data tree, the pending
//! entries tree, the row-allocation free list, and the raw row storage of
//! one partition file. Old partitions are `open()`ed read-mostly; the
//! defragmenter `create()`s a fresh store over the temporary partition
//! file and funnels every row through it.
//!
//! Tree roots and the free-list trunk root are persisted in the partition
//! meta page (page 0), so a store can be reopened from the file alone. A
//! partition whose file exists but whose trees were never initialized is
//! an *empty* partition: `tree_root()` is `None` and the defragmenter
//! skips the copy.
//!
//! Writers must hold the checkpoint read lock; this type locks its store
//! handle per operation and never across a yield point.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::btree::{self, BTree};
use crate::memory::PageStoreHandle;
use crate::storage::meta::{
    init_partition_meta, partition_meta, partition_meta_mut, PartitionMeta,
};
use crate::storage::page_id::{self, PartitionId};
use crate::storage::{read_item, FreeList, PageStoreState};

use super::row::{data_key, pending_key, DataRow, SimpleDataRow};

#[derive(Debug)]
pub struct CacheDataStore {
    part_id: PartitionId,
    handle: Arc<PageStoreHandle>,
    inner: Mutex<DataStoreInner>,
}

#[derive(Debug)]
struct DataStoreInner {
    data_tree_root: u32,
    pending_tree_root: u32,
    free_list: FreeList,
}

impl CacheDataStore {
    /// Formats a fresh partition store: meta page, empty trees, empty
    /// free list. The caller holds the checkpoint read lock.
    pub fn create(
        handle: Arc<PageStoreHandle>,
        part_id: PartitionId,
        meta_version: u8,
    ) -> Result<Arc<Self>> {
        let (data_tree_root, pending_tree_root) = {
            let mut state = handle.state()?;
            init_partition_meta(state.page_mut(0)?, meta_version)?;

            let data_tree_root = BTree::create(&mut state)?.root_page();
            let pending_tree_root = BTree::create(&mut state)?.root_page();

            let meta = partition_meta_mut(state.page_mut(0)?)?;
            meta.data_tree_root = data_tree_root;
            meta.pending_tree_root = pending_tree_root;

            (data_tree_root, pending_tree_root)
        };

        Ok(Arc::new(Self {
            part_id,
            handle,
            inner: Mutex::new(DataStoreInner {
                data_tree_root,
                pending_tree_root,
                free_list: FreeList::new(part_id),
            }),
        }))
    }

    /// Opens an existing partition store from its meta page.
    pub fn open(handle: Arc<PageStoreHandle>, part_id: PartitionId) -> Result<Arc<Self>> {
        let (data_tree_root, pending_tree_root, free_list) = {
            let state = handle.state()?;
            let meta = partition_meta(state.page(0)?)?;

            let free_list = if meta.free_list_root != 0 {
                FreeList::load(&state, meta.free_list_root, part_id)?
            } else {
                FreeList::new(part_id)
            };

            (meta.data_tree_root, meta.pending_tree_root, free_list)
        };

        Ok(Arc::new(Self {
            part_id,
            handle,
            inner: Mutex::new(DataStoreInner {
                data_tree_root,
                pending_tree_root,
                free_list,
            }),
        }))
    }

    pub fn part_id(&self) -> PartitionId {
        self.part_id
    }

    pub fn handle(&self) -> &Arc<PageStoreHandle> {
        &self.handle
    }

    /// Root of the cache data tree; `None` for a never-initialized
    /// (empty) partition.
    pub fn tree_root(&self) -> Option<u32> {
        let root = self.inner.lock().data_tree_root;
        (root != 0).then_some(root)
    }

    pub fn pending_tree_root(&self) -> Option<u32> {
        let root = self.inner.lock().pending_tree_root;
        (root != 0).then_some(root)
    }

    /// Allocates storage for the row through the free list and sets
    /// `row.link`. The payload is built from the row's *current* fields,
    /// so a caller that blanks `cache_id` for non-inlining groups must do
    /// so before this call.
    pub fn insert_data_row(&self, row: &mut DataRow) -> Result<()> {
        let payload = row.to_payload();
        let mut inner = self.inner.lock();
        let mut state = self.handle.state()?;
        row.link = inner.free_list.insert_row_bytes(&mut state, &payload)?;
        Ok(())
    }

    /// Inserts `row` into the cache data tree (key order is the encoded
    /// `(cache_id, hash, key)`) and bumps the partition size counter.
    pub fn put_tree_row(&self, row: &DataRow) -> Result<()> {
        ensure!(row.link != 0, "row must be stored before it enters the tree");

        let mut inner = self.inner.lock();
        ensure!(inner.data_tree_root != 0, "cache data tree is not initialized");

        let mut state = self.handle.state()?;
        let key = data_key(row.cache_id, row.hash, &row.key);

        let mut tree = BTree::new(&mut state, inner.data_tree_root)?;
        tree.put(&key, &row.link.to_be_bytes())?;
        let new_root = tree.root_page();

        if new_root != inner.data_tree_root {
            inner.data_tree_root = new_root;
            partition_meta_mut(state.page_mut(0)?)?.data_tree_root = new_root;
        }
        partition_meta_mut(state.page_mut(0)?)?.size += 1;

        Ok(())
    }

    pub fn put_pending(&self, cache_id: i32, expire_time: u64, link: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(
            inner.pending_tree_root != 0,
            "pending entries tree is not initialized"
        );

        let mut state = self.handle.state()?;
        let key = pending_key(cache_id, expire_time, link);

        let mut tree = BTree::new(&mut state, inner.pending_tree_root)?;
        tree.put(&key, &[])?;
        let new_root = tree.root_page();

        if new_root != inner.pending_tree_root {
            inner.pending_tree_root = new_root;
            partition_meta_mut(state.page_mut(0)?)?.pending_tree_root = new_root;
        }

        Ok(())
    }

    /// Resolves a link to the full row it points at.
    pub fn read_row(&self, link: u64) -> Result<DataRow> {
        let payload = self.read_row_bytes(link)?;
        DataRow::from_payload(&payload, link)
    }

    /// Raw row storage access; the gaps blob of the partition meta is
    /// read this way.
    pub fn read_row_bytes(&self, link: u64) -> Result<Vec<u8>> {
        let state = self.handle.state()?;
        let page = state.page(page_id::page_index(page_id::link_page_id(link)))?;
        Ok(read_item(page, page_id::item_id(link))?.to_vec())
    }

    /// Stores a headerless blob row and sets its link.
    pub fn insert_blob_row(&self, row: &mut SimpleDataRow) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut state = self.handle.state()?;
        row.link = inner.free_list.insert_row_bytes(&mut state, &row.bytes)?;
        Ok(())
    }

    /// Persists the free-list buckets as trunk pages and records the
    /// trunk root in the partition meta. Runs under the checkpoint read
    /// lock at the end of a partition copy.
    pub fn save_free_list_metadata(&self) -> Result<()> {
        let inner = self.inner.lock();
        let mut state = self.handle.state()?;
        let root = inner.free_list.save_metadata(&mut state)?;
        partition_meta_mut(state.page_mut(0)?)?.free_list_root = root;
        Ok(())
    }

    pub fn meta_snapshot(&self) -> Result<PartitionMeta> {
        let state = self.handle.state()?;
        Ok(*partition_meta(state.page(0)?)?)
    }

    /// Point lookup through the data tree, mainly for verification.
    pub fn lookup(&self, cache_id: i32, hash: i32, key: &[u8]) -> Result<Option<DataRow>> {
        let root = self.inner.lock().data_tree_root;
        ensure!(root != 0, "cache data tree is not initialized");

        let link = {
            let state = self.handle.state()?;
            btree::search(&state, root, &data_key(cache_id, hash, key))?
        };

        match link {
            None => Ok(None),
            Some(raw) => {
                let link = u64::from_be_bytes(raw.as_slice().try_into()?);
                Ok(Some(self.read_row(link)?))
            }
        }
    }

    /// Runs `f` with the locked store state and the data tree root.
    pub fn with_state<R>(
        &self,
        f: impl FnOnce(&PageStoreState, Option<u32>) -> Result<R>,
    ) -> Result<R> {
        let root = self.tree_root();
        let state = self.handle.state()?;
        f(&state, root)
    }
}
