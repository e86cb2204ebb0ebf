//! # Page Memory
//!
//! The page memory of a data region is a registry of page store handles
//! keyed by `(cache group, partition)`. Defragmentation registers the
//! temporary stores it builds here, the checkpointer flushes every dirty
//! store of its regions from here, and invalidation after a partition
//! swap happens here.
//!
//! ## Handle Model
//!
//! A `PageStoreHandle` couples a store's `PageStoreState` (mmap + dirty
//! bitmap + allocation counter) with an invalidation flag. Page access
//! locks the state mutex for the duration of one operation; the worker
//! never holds a state guard across a checkpoint-lock yield point, so a
//! flush can always drain the store once the read lock is released.
//!
//! Invalidation is terminal: after `invalidate()` every state access
//! fails. The defragmenter invalidates `(group, partition)` in both the
//! old and the new page memory right before the partition file is
//! renamed, so stale access is an error instead of a silent read of
//! swapped bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::storage::{GroupId, PageStoreState, PartitionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub grp: GroupId,
    pub part: PartitionId,
}

impl StoreKey {
    pub fn new(grp: GroupId, part: PartitionId) -> Self {
        Self { grp, part }
    }
}

#[derive(Debug)]
pub struct PageStoreHandle {
    key: StoreKey,
    state: Mutex<PageStoreState>,
    invalidated: AtomicBool,
}

impl PageStoreHandle {
    pub fn new(key: StoreKey, state: PageStoreState) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(state),
            invalidated: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> StoreKey {
        self.key
    }

    /// Locks the store state for one operation. Fails once the handle has
    /// been invalidated.
    pub fn state(&self) -> Result<MutexGuard<'_, PageStoreState>> {
        ensure!(
            !self.invalidated.load(Ordering::Acquire),
            "page store (grp={}, part={}) has been invalidated",
            self.key.grp,
            self.key.part
        );
        Ok(self.state.lock())
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn page_count(&self) -> Result<u32> {
        Ok(self.state()?.page_count())
    }

    pub fn pages_allocated(&self) -> Result<u64> {
        Ok(self.state()?.pages_allocated())
    }

    /// Flushes dirty pages regardless of invalidation; the checkpointer
    /// may still owe a flush for a store the worker already invalidated.
    pub(crate) fn sync_if_dirty(&self) -> Result<u64> {
        self.state.lock().sync_if_dirty()
    }
}

#[derive(Debug)]
pub struct PageMemory {
    name: String,
    stores: Mutex<HashMap<StoreKey, Arc<PageStoreHandle>>>,
}

impl PageMemory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a store handle, replacing any previous registration for
    /// the same key.
    pub fn add_store(&self, handle: Arc<PageStoreHandle>) {
        self.stores.lock().insert(handle.key(), handle);
    }

    pub fn get_store(&self, grp: GroupId, part: PartitionId) -> Result<Arc<PageStoreHandle>> {
        self.stores
            .lock()
            .get(&StoreKey::new(grp, part))
            .cloned()
            .ok_or_else(|| {
                eyre::eyre!(
                    "no page store registered for (grp={}, part={}) in region '{}'",
                    grp,
                    part,
                    self.name
                )
            })
    }

    pub fn remove_store(&self, grp: GroupId, part: PartitionId) -> Option<Arc<PageStoreHandle>> {
        self.stores.lock().remove(&StoreKey::new(grp, part))
    }

    /// Drops every store of a cache group (used for the mapping region
    /// once a group's index is rebuilt).
    pub fn clear_group(&self, grp: GroupId) {
        self.stores.lock().retain(|key, _| key.grp != grp);
    }

    /// Marks the pages of `(grp, part)` unusable. A missing registration
    /// is fine; the old page memory may never have held the partition.
    pub fn invalidate(&self, grp: GroupId, part: PartitionId) {
        if let Some(handle) = self.stores.lock().get(&StoreKey::new(grp, part)) {
            handle.invalidate();
        }
    }

    pub fn store_snapshot(&self) -> Vec<Arc<PageStoreHandle>> {
        self.stores.lock().values().cloned().collect()
    }

    /// Flushes every store with dirty pages; returns the number of page
    /// numbers drained across the region.
    pub fn flush_dirty(&self) -> Result<u64> {
        let mut flushed = 0;
        for handle in self.store_snapshot() {
            flushed += handle.sync_if_dirty()?;
        }
        Ok(flushed)
    }
}
