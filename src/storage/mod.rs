//! # Storage Layer
//!
//! Page-granular file storage for the defragmentation engine: page
//! stores, the shared page header, id/link packing, slotted data pages,
//! the row-allocation free list, and partition meta IO.
//!
//! ## Module Organization
//!
//! - `mmap`: memory-mapped page store files (`MmapStorage`)
//! - `page`: the 16-byte page header and page type tags
//! - `page_id`: 64-bit page id / row link packing
//! - `data_page`: slotted data pages holding row payloads
//! - `freelist`: bucketed free-space tracking for row allocation
//! - `meta`: partition meta page (versions 1-3) and the shared-group
//!   cache-size counters chain
//!
//! ## Page Size
//!
//! All stores use 4 KiB pages. The file size of every store is a multiple
//! of `PAGE_SIZE`; there is no file-level header, page 0's meaning is
//! defined by the layer above.
//!
//! ## Dirty Tracking
//!
//! `PageStoreState` pairs a store with a roaring bitmap of dirty page
//! numbers and an allocation counter. Every mutable page access marks the
//! page dirty; the checkpointer drains the bitmap when it flushes. The
//! bitmap feeds the flush statistics, durability itself is `msync` of the
//! whole mapping.

mod data_page;
mod freelist;
pub mod meta;
mod mmap;
mod page;
pub mod page_id;

pub use data_page::{data_page_free_space, init_data_page, insert_item, read_item, MAX_ITEMS_PER_PAGE};
pub use freelist::{FreeList, TrunkHeader, TRUNK_ENTRY_SIZE, TRUNK_HEADER_SIZE, TRUNK_MAX_ENTRIES};
pub use mmap::MmapStorage;
pub use page::{expect_page_type, PageHeader, PageType};
pub use page_id::{GroupId, PartitionId, FLAG_DATA, FLAG_IDX, INDEX_PARTITION};

use eyre::Result;
use roaring::RoaringBitmap;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 16;
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// A page store plus the bookkeeping the checkpointer needs: dirty page
/// numbers and the count of pages allocated since the store was opened.
///
/// Writers must hold the checkpoint read lock while mutating pages; the
/// lock discipline lives in `checkpoint`, this type only records what
/// changed.
#[derive(Debug)]
pub struct PageStoreState {
    storage: MmapStorage,
    dirty: RoaringBitmap,
    pages_allocated: u64,
}

impl PageStoreState {
    pub fn new(storage: MmapStorage) -> Self {
        Self {
            storage,
            dirty: RoaringBitmap::new(),
            pages_allocated: 0,
        }
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        self.storage.page(page_no)
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        self.dirty.insert(page_no);
        self.storage.page_mut(page_no)
    }

    /// Grows the store by one zeroed page and returns its page number.
    pub fn allocate_page(&mut self) -> Result<u32> {
        let page_no = self.storage.page_count();
        self.storage.grow(page_no + 1)?;
        self.dirty.insert(page_no);
        self.pages_allocated += 1;
        Ok(page_no)
    }

    pub fn page_count(&self) -> u32 {
        self.storage.page_count()
    }

    pub fn pages_allocated(&self) -> u64 {
        self.pages_allocated
    }

    pub fn dirty_count(&self) -> u64 {
        self.dirty.len()
    }

    /// Flushes the store if it has dirty pages; returns how many page
    /// numbers were drained from the dirty set.
    pub fn sync_if_dirty(&mut self) -> Result<u64> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        self.storage.sync()?;
        let flushed = self.dirty.len();
        self.dirty.clear();
        Ok(flushed)
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }
}
