//! # Row-Allocation Free List
//!
//! Tracks data pages with remaining free space, bucketed by free-space
//! range, so row inserts can reuse partially filled pages before growing
//! the store. The in-memory buckets are persisted as a chain of trunk
//! pages reachable from the partition meta (`free_list_root`), written by
//! `save_metadata` under the checkpoint read lock.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       16    Page header (type = FreeListTrunk, next trunk in next_page)
//! 16      8     TrunkHeader { next_trunk, count }
//! 24      8*N   entries: { page_no: u32, free_bytes: u16, _: u16 }
//! ```
//!
//! `next_trunk` duplicates the header chain field so a trunk page can be
//! parsed without consulting the page header; both are written.
//!
//! ## Allocation Strategy
//!
//! 1. Probe buckets that can hold the payload, largest-fit first within
//!    the bucket order.
//! 2. A probed page whose real free space turns out too small is
//!    re-bucketed and the probe continues.
//! 3. No candidate: allocate a fresh data page from the store.
//!
//! Pages whose remaining space drops below a reuse threshold leave the
//! free list for good.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::data_page::{
    data_page_free_space, init_data_page, insert_item, ITEM_SLOT_SIZE,
};
use super::page::{expect_page_type, PageHeader, PageType};
use super::page_id::{self, PartitionId, FLAG_DATA};
use super::{PageStoreState, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE};

pub const FREE_BUCKETS: usize = 8;
pub const TRUNK_HEADER_SIZE: usize = 8;
pub const TRUNK_ENTRY_SIZE: usize = 8;
pub const TRUNK_MAX_ENTRIES: usize =
    (PAGE_SIZE - PAGE_HEADER_SIZE - TRUNK_HEADER_SIZE) / TRUNK_ENTRY_SIZE;

/// Pages with less free space than this are dropped from the list.
const MIN_REUSE_SPACE: usize = 32;

const BUCKET_STEP: usize = PAGE_USABLE_SIZE / FREE_BUCKETS;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TrunkHeader {
    next_trunk: u32,
    count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct TrunkEntry {
    page_no: u32,
    free_bytes: u16,
    reserved: u16,
}

fn bucket_for(free_bytes: usize) -> usize {
    (free_bytes / BUCKET_STEP).min(FREE_BUCKETS - 1)
}

#[derive(Debug)]
pub struct FreeList {
    part: PartitionId,
    buckets: [Vec<u32>; FREE_BUCKETS],
}

impl FreeList {
    pub fn new(part: PartitionId) -> Self {
        Self {
            part,
            buckets: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Rebuilds the free list from a trunk chain persisted by
    /// `save_metadata`. A root of 0 means the list was empty.
    pub fn load(state: &PageStoreState, root: u32, part: PartitionId) -> Result<Self> {
        let mut list = Self::new(part);

        let mut trunk_no = root;
        while trunk_no != 0 {
            let page = state.page(trunk_no)?;
            expect_page_type(page, PageType::FreeListTrunk)?;

            let trunk = TrunkHeader::ref_from_bytes(
                &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE],
            )
            .map_err(|e| eyre::eyre!("failed to read TrunkHeader: {:?}", e))?;

            ensure!(
                trunk.count as usize <= TRUNK_MAX_ENTRIES,
                "trunk page {} entry count {} exceeds capacity {}",
                trunk_no,
                trunk.count,
                TRUNK_MAX_ENTRIES
            );

            for i in 0..trunk.count as usize {
                let offset = PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE + i * TRUNK_ENTRY_SIZE;
                let entry = TrunkEntry::ref_from_bytes(&page[offset..offset + TRUNK_ENTRY_SIZE])
                    .map_err(|e| eyre::eyre!("failed to read trunk entry: {:?}", e))?;
                list.buckets[bucket_for(entry.free_bytes as usize)].push(entry.page_no);
            }

            trunk_no = trunk.next_trunk;
        }

        Ok(list)
    }

    /// Stores a row payload, reusing a page with enough free space or
    /// growing the store. Returns the row link.
    pub fn insert_row_bytes(&mut self, state: &mut PageStoreState, payload: &[u8]) -> Result<u64> {
        ensure!(
            payload.len() + ITEM_SLOT_SIZE <= PAGE_USABLE_SIZE,
            "row payload of {} bytes does not fit a single data page",
            payload.len()
        );

        let need = payload.len() + ITEM_SLOT_SIZE;
        let page_no = match self.take_page_with_space(state, need)? {
            Some(page_no) => page_no,
            None => {
                let page_no = state.allocate_page()?;
                init_data_page(state.page_mut(page_no)?)?;
                page_no
            }
        };

        let item_id = insert_item(state.page_mut(page_no)?, payload)?;

        let remaining = data_page_free_space(state.page(page_no)?)?;
        if remaining >= MIN_REUSE_SPACE {
            self.buckets[bucket_for(remaining)].push(page_no);
        }

        Ok(page_id::link(
            page_id::page_id(self.part, FLAG_DATA, page_no),
            item_id,
        ))
    }

    fn take_page_with_space(
        &mut self,
        state: &PageStoreState,
        need: usize,
    ) -> Result<Option<u32>> {
        let mut requeue: Vec<(usize, u32)> = Vec::new();
        let mut found = None;

        'probe: for b in bucket_for(need)..FREE_BUCKETS {
            while let Some(page_no) = self.buckets[b].pop() {
                let free = data_page_free_space(state.page(page_no)?)?;
                if free >= need {
                    found = Some(page_no);
                    break 'probe;
                }
                if free >= MIN_REUSE_SPACE {
                    requeue.push((bucket_for(free), page_no));
                }
            }
        }

        for (bucket, page_no) in requeue {
            self.buckets[bucket].push(page_no);
        }

        Ok(found)
    }

    /// Persists the buckets as a trunk chain; returns the root trunk page
    /// number (0 when the list is empty).
    pub fn save_metadata(&self, state: &mut PageStoreState) -> Result<u32> {
        let mut entries: Vec<TrunkEntry> = Vec::new();
        for bucket in &self.buckets {
            for &page_no in bucket {
                let free = data_page_free_space(state.page(page_no)?)?;
                entries.push(TrunkEntry {
                    page_no,
                    free_bytes: free as u16,
                    reserved: 0,
                });
            }
        }

        if entries.is_empty() {
            return Ok(0);
        }

        let mut root = 0u32;
        let mut prev_trunk = 0u32;

        for chunk in entries.chunks(TRUNK_MAX_ENTRIES) {
            let trunk_no = state.allocate_page()?;
            let page = state.page_mut(trunk_no)?;
            PageHeader::init(page, PageType::FreeListTrunk, 1)?;

            let trunk = TrunkHeader {
                next_trunk: 0,
                count: chunk.len() as u32,
            };
            page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE]
                .copy_from_slice(trunk.as_bytes());

            for (i, entry) in chunk.iter().enumerate() {
                let offset = PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE + i * TRUNK_ENTRY_SIZE;
                page[offset..offset + TRUNK_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
            }

            if root == 0 {
                root = trunk_no;
            } else {
                let prev = state.page_mut(prev_trunk)?;
                let header = PageHeader::from_bytes_mut(prev)?;
                header.set_next_page(trunk_no);
                let trunk = TrunkHeader::mut_from_bytes(
                    &mut prev[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE],
                )
                .map_err(|e| eyre::eyre!("failed to relink trunk: {:?}", e))?;
                trunk.next_trunk = trunk_no;
            }
            prev_trunk = trunk_no;
        }

        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MmapStorage;
    use tempfile::tempdir;

    fn fresh_state(pages: u32) -> (tempfile::TempDir, PageStoreState) {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("fl.bin"), pages).unwrap();
        (dir, PageStoreState::new(storage))
    }

    #[test]
    fn rows_pack_into_shared_pages() {
        let (_dir, mut state) = fresh_state(1);
        let mut list = FreeList::new(3);

        let a = list.insert_row_bytes(&mut state, &[1u8; 64]).unwrap();
        let b = list.insert_row_bytes(&mut state, &[2u8; 64]).unwrap();

        assert_eq!(page_id::page_index(page_id::link_page_id(a)), 1);
        assert_eq!(page_id::link_page_id(a), page_id::link_page_id(b));
        assert_eq!(page_id::partition(a), 3);
        assert_ne!(page_id::item_id(a), page_id::item_id(b));
    }

    #[test]
    fn oversized_row_is_rejected() {
        let (_dir, mut state) = fresh_state(1);
        let mut list = FreeList::new(0);

        assert!(list
            .insert_row_bytes(&mut state, &[0u8; PAGE_USABLE_SIZE])
            .is_err());
    }

    #[test]
    fn full_pages_force_new_allocation() {
        let (_dir, mut state) = fresh_state(1);
        let mut list = FreeList::new(0);

        let big = PAGE_USABLE_SIZE - ITEM_SLOT_SIZE - MIN_REUSE_SPACE;
        let a = list.insert_row_bytes(&mut state, &vec![0u8; big]).unwrap();
        let b = list.insert_row_bytes(&mut state, &vec![0u8; big]).unwrap();

        assert_ne!(page_id::link_page_id(a), page_id::link_page_id(b));
    }

    #[test]
    fn save_and_load_round_trips_buckets() {
        let (_dir, mut state) = fresh_state(1);
        let mut list = FreeList::new(9);

        for i in 0..20u8 {
            list.insert_row_bytes(&mut state, &vec![i; 300]).unwrap();
        }

        let root = list.save_metadata(&mut state).unwrap();
        assert_ne!(root, 0);

        let mut reloaded = FreeList::load(&state, root, 9).unwrap();

        // A reloaded list keeps reusing the partially-filled pages.
        let link = reloaded.insert_row_bytes(&mut state, &[7u8; 100]).unwrap();
        let page_no = page_id::page_index(page_id::link_page_id(link));
        assert!(page_no < root, "expected reuse of an existing data page");
    }

    #[test]
    fn empty_list_saves_as_zero_root() {
        let (_dir, mut state) = fresh_state(1);
        let list = FreeList::new(0);

        assert_eq!(list.save_metadata(&mut state).unwrap(), 0);
    }
}
