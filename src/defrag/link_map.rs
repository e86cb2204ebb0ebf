//! # Link Map
//!
//! Persistent per-partition map `old row link -> new row link`, kept in
//! its own mapping store (`part-map-N.bin`). The indexing subsystem
//! translates every link it finds through these maps when it rebuilds the
//! index partition.
//!
//! The map's meta page lives at the well-known index
//! `LINK_MAP_META_PAGE_IDX` under the data flag, so a map can be reopened
//! from the file alone after a crash (`init_new = false`): resuming a
//! partially defragmented group needs the maps of already-renamed
//! partitions without rebuilding them.
//!
//! Duplicate `put` overwrites; defragmentation may process the same rows
//! twice after a crash. Persistence rides the shared defragmentation
//! checkpoint, there is no independent fsync here.

use std::sync::Arc;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::btree::{self, BTree};
use crate::memory::PageStoreHandle;
use crate::storage::{expect_page_type, PageHeader, PageType, PartitionId, PAGE_HEADER_SIZE};

/// Page index of the link map's meta page inside the mapping store.
pub const LINK_MAP_META_PAGE_IDX: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct LinkMapMeta {
    tree_root: u32,
    reserved: u32,
    entry_count: u64,
}

fn link_map_meta(page: &[u8]) -> Result<&LinkMapMeta> {
    expect_page_type(page, PageType::LinkMapMeta)?;
    LinkMapMeta::ref_from_bytes(&page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<LinkMapMeta>()])
        .map_err(|e| eyre::eyre!("failed to read LinkMapMeta: {:?}", e))
}

fn link_map_meta_mut(page: &mut [u8]) -> Result<&mut LinkMapMeta> {
    expect_page_type(page, PageType::LinkMapMeta)?;
    LinkMapMeta::mut_from_bytes(
        &mut page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<LinkMapMeta>()],
    )
    .map_err(|e| eyre::eyre!("failed to read LinkMapMeta: {:?}", e))
}

#[derive(Debug, Clone)]
pub struct LinkMap {
    handle: Arc<PageStoreHandle>,
    part: PartitionId,
}

impl LinkMap {
    /// Creates (`init_new = true`) or reopens the link map of one
    /// partition. The caller holds the checkpoint read lock for the
    /// creating case, which allocates the meta page and an empty tree.
    pub fn new(handle: Arc<PageStoreHandle>, part: PartitionId, init_new: bool) -> Result<Self> {
        {
            let mut state = handle.state()?;

            if init_new {
                ensure!(
                    state.page_count() == 1,
                    "mapping store must be fresh to initialize a link map (page_count={})",
                    state.page_count()
                );
                PageHeader::init(
                    state.page_mut(LINK_MAP_META_PAGE_IDX)?,
                    PageType::LinkMapMeta,
                    1,
                )?;
                let root = BTree::create(&mut state)?.root_page();
                link_map_meta_mut(state.page_mut(LINK_MAP_META_PAGE_IDX)?)?.tree_root = root;
            } else {
                let meta = link_map_meta(state.page(LINK_MAP_META_PAGE_IDX)?)?;
                ensure!(
                    meta.tree_root != 0,
                    "link map meta page carries no tree root"
                );
            }
        }

        Ok(Self { handle, part })
    }

    pub fn partition(&self) -> PartitionId {
        self.part
    }

    /// Records `old_link -> new_link`, overwriting a previous mapping of
    /// the same old link.
    pub fn put(&self, old_link: u64, new_link: u64) -> Result<()> {
        let mut state = self.handle.state()?;
        let meta = *link_map_meta(state.page(LINK_MAP_META_PAGE_IDX)?)?;

        let fresh = btree::search(&state, meta.tree_root, &old_link.to_be_bytes())?.is_none();

        let mut tree = BTree::new(&mut state, meta.tree_root)?;
        tree.put(&old_link.to_be_bytes(), &new_link.to_be_bytes())?;
        let new_root = tree.root_page();

        if new_root != meta.tree_root || fresh {
            let meta = link_map_meta_mut(state.page_mut(LINK_MAP_META_PAGE_IDX)?)?;
            meta.tree_root = new_root;
            if fresh {
                meta.entry_count += 1;
            }
        }

        Ok(())
    }

    pub fn get(&self, old_link: u64) -> Result<Option<u64>> {
        let state = self.handle.state()?;
        let meta = link_map_meta(state.page(LINK_MAP_META_PAGE_IDX)?)?;

        match btree::search(&state, meta.tree_root, &old_link.to_be_bytes())? {
            None => Ok(None),
            Some(raw) => Ok(Some(u64::from_be_bytes(raw.as_slice().try_into()?))),
        }
    }

    pub fn len(&self) -> Result<u64> {
        let state = self.handle.state()?;
        Ok(link_map_meta(state.page(LINK_MAP_META_PAGE_IDX)?)?.entry_count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StoreKey;
    use crate::storage::{MmapStorage, PageStoreState};
    use tempfile::tempdir;

    fn mapping_handle(path: &std::path::Path) -> Arc<PageStoreHandle> {
        let storage = MmapStorage::create(path, 1).unwrap();
        PageStoreHandle::new(StoreKey::new(1, 0), PageStoreState::new(storage))
    }

    #[test]
    fn put_get_and_overwrite() {
        let dir = tempdir().unwrap();
        let map = LinkMap::new(mapping_handle(&dir.path().join("part-map-0.bin")), 0, true)
            .unwrap();

        map.put(100, 1_000).unwrap();
        map.put(200, 2_000).unwrap();

        assert_eq!(map.get(100).unwrap(), Some(1_000));
        assert_eq!(map.get(300).unwrap(), None);
        assert_eq!(map.len().unwrap(), 2);

        // A rerun after a crash maps the same old link again.
        map.put(100, 1_111).unwrap();
        assert_eq!(map.get(100).unwrap(), Some(1_111));
        assert_eq!(map.len().unwrap(), 2);
    }

    #[test]
    fn reopen_finds_existing_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part-map-3.bin");

        {
            let map = LinkMap::new(mapping_handle(&path), 3, true).unwrap();
            for i in 0..2_000u64 {
                map.put(i, i + 1_000_000).unwrap();
            }
        }

        let storage = MmapStorage::open(&path).unwrap();
        let handle = PageStoreHandle::new(StoreKey::new(1, 3), PageStoreState::new(storage));
        let map = LinkMap::new(handle, 3, false).unwrap();

        assert_eq!(map.len().unwrap(), 2_000);
        assert_eq!(map.get(1_234).unwrap(), Some(1_235_234));
        assert_eq!(map.partition(), 3);
    }

    #[test]
    fn init_on_used_store_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part-map-9.bin");

        let handle = mapping_handle(&path);
        handle.state().unwrap().allocate_page().unwrap();

        assert!(LinkMap::new(handle, 9, true).is_err());
    }
}
