//! # File Page Store Manager
//!
//! Tracks cache-group work directories and the open page store handles of
//! the node. The defragmenter consults it for old-store existence and
//! lookup, and uses its factory to create the temporary stores of the
//! defragmentation regions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::defrag::file_utils;
use crate::error::DefragmentationError;
use crate::memory::{PageStoreHandle, StoreKey};
use crate::storage::{GroupId, MmapStorage, PageStoreState, PartitionId};

#[derive(Debug)]
pub struct FilePageStoreManager {
    root: PathBuf,
    work_dirs: Mutex<HashMap<GroupId, PathBuf>>,
    stores: Mutex<HashMap<StoreKey, Arc<PageStoreHandle>>>,
}

impl FilePageStoreManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            DefragmentationError::PageIo(format!(
                "failed to create storage root '{}': {e}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            work_dirs: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates (if needed) and records the work directory of a group.
    pub fn register_group(&self, grp: GroupId, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(|e| {
            DefragmentationError::PageIo(format!(
                "failed to create work dir '{}': {e}",
                dir.display()
            ))
        })?;
        self.work_dirs.lock().insert(grp, dir.clone());
        Ok(dir)
    }

    pub fn cache_work_dir(&self, grp: GroupId) -> Result<PathBuf> {
        self.work_dirs
            .lock()
            .get(&grp)
            .cloned()
            .ok_or_else(|| eyre::eyre!("no work dir registered for cache group {}", grp))
    }

    /// Whether the live partition file of `(grp, part)` exists on disk.
    pub fn exists(&self, grp: GroupId, part: PartitionId) -> Result<bool> {
        Ok(file_utils::part_file(&self.cache_work_dir(grp)?, part).exists())
    }

    pub fn has_index_store(&self, grp: GroupId) -> Result<bool> {
        Ok(file_utils::index_file(&self.cache_work_dir(grp)?).exists())
    }

    pub fn register_store(&self, handle: Arc<PageStoreHandle>) {
        self.stores.lock().insert(handle.key(), handle);
    }

    pub fn get_store(&self, grp: GroupId, part: PartitionId) -> Result<Arc<PageStoreHandle>> {
        self.stores
            .lock()
            .get(&StoreKey::new(grp, part))
            .cloned()
            .ok_or_else(|| eyre::eyre!("no page store open for (grp={}, part={})", grp, part))
    }

    /// Factory for the page stores of one cache group. Encryption is
    /// handled below the page level and is not supported by this engine;
    /// the flag only reaches the meta-copy fail-fast check.
    pub fn page_store_factory(&self, grp: GroupId, encrypted: bool) -> FilePageStoreFactory {
        FilePageStoreFactory { grp, encrypted }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FilePageStoreFactory {
    grp: GroupId,
    encrypted: bool,
}

impl FilePageStoreFactory {
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Creates a one-page store file and wraps it in a handle keyed by
    /// this factory's group. The caller registers it in a page memory.
    pub fn create_page_store(
        &self,
        part: PartitionId,
        path: &Path,
    ) -> Result<Arc<PageStoreHandle>> {
        let storage = MmapStorage::create(path, 1).map_err(|e| {
            DefragmentationError::PageIo(format!(
                "failed to create page store '{}': {e:#}",
                path.display()
            ))
        })?;
        Ok(PageStoreHandle::new(
            StoreKey::new(self.grp, part),
            PageStoreState::new(storage),
        ))
    }

    /// Opens an existing store file into a handle.
    pub fn open_page_store(&self, part: PartitionId, path: &Path) -> Result<Arc<PageStoreHandle>> {
        let storage = MmapStorage::open(path).map_err(|e| {
            DefragmentationError::PageIo(format!(
                "failed to open page store '{}': {e:#}",
                path.display()
            ))
        })?;
        Ok(PageStoreHandle::new(
            StoreKey::new(self.grp, part),
            PageStoreState::new(storage),
        ))
    }
}
