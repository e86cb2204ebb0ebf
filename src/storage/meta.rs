//! # Partition Meta Page
//!
//! Page 0 of every partition store is its meta page. The body carries the
//! partition state and counters plus the roots this engine needs to
//! reopen a partition: the cache data tree, the pending entries tree, and
//! the free-list trunk chain.
//!
//! Meta versions 1-3 are supported; the version lives in the page
//! header. Newer versions may carry fields the defragmenter does not know
//! how to copy, so version 4+ is rejected instead of silently dropped.
//!
//! ## Shared-Group Cache Sizes
//!
//! When several caches share one group, per-cache row counts are kept in
//! a chain of counter pages reachable from `counters_page_id`. Each page
//! holds `(cache_id, size)` entries and links to the next page through
//! the page header's `next_page` field.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::page::{expect_page_type, PageHeader, PageType};
use super::page_id::{self, PartitionId, FLAG_DATA};
use super::{PageStoreState, PAGE_HEADER_SIZE, PAGE_USABLE_SIZE};

/// Meta format version written for defragmented partitions.
pub const LATEST_META_VERSION: u8 = 3;

pub fn is_supported_meta_version(version: u8) -> bool {
    (1..=LATEST_META_VERSION).contains(&version)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PartitionMeta {
    pub partition_state: u8,
    reserved: [u8; 7],
    pub size: u64,
    pub update_counter: u64,
    pub global_remove_id: u64,
    pub counters_page_id: u64,
    pub gaps_link: u64,
    pub encrypted_page_count: u32,
    pub encrypted_page_index: u32,
    pub data_tree_root: u32,
    pub pending_tree_root: u32,
    pub free_list_root: u32,
    reserved2: u32,
}

pub fn init_partition_meta(page: &mut [u8], version: u8) -> Result<()> {
    ensure!(
        is_supported_meta_version(version),
        "cannot initialize partition meta with version {}",
        version
    );
    PageHeader::init(page, PageType::PartitionMeta, version)?;
    page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<PartitionMeta>()].fill(0);
    Ok(())
}

pub fn partition_meta(page: &[u8]) -> Result<&PartitionMeta> {
    expect_page_type(page, PageType::PartitionMeta)?;
    PartitionMeta::ref_from_bytes(&page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<PartitionMeta>()])
        .map_err(|e| eyre::eyre!("failed to read PartitionMeta: {:?}", e))
}

pub fn partition_meta_mut(page: &mut [u8]) -> Result<&mut PartitionMeta> {
    expect_page_type(page, PageType::PartitionMeta)?;
    PartitionMeta::mut_from_bytes(
        &mut page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<PartitionMeta>()],
    )
    .map_err(|e| eyre::eyre!("failed to read PartitionMeta: {:?}", e))
}

pub fn meta_version(page: &[u8]) -> Result<u8> {
    expect_page_type(page, PageType::PartitionMeta)?;
    Ok(PageHeader::from_bytes(page)?.version())
}

/// Page 0 of an index store. Carries the root of the group's index tree.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IndexMeta {
    pub index_tree_root: u32,
    reserved: u32,
}

pub fn init_index_meta(page: &mut [u8]) -> Result<()> {
    PageHeader::init(page, PageType::IndexMeta, 1)?;
    page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<IndexMeta>()].fill(0);
    Ok(())
}

pub fn index_meta(page: &[u8]) -> Result<&IndexMeta> {
    expect_page_type(page, PageType::IndexMeta)?;
    IndexMeta::ref_from_bytes(&page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<IndexMeta>()])
        .map_err(|e| eyre::eyre!("failed to read IndexMeta: {:?}", e))
}

pub fn index_meta_mut(page: &mut [u8]) -> Result<&mut IndexMeta> {
    expect_page_type(page, PageType::IndexMeta)?;
    IndexMeta::mut_from_bytes(
        &mut page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size_of::<IndexMeta>()],
    )
    .map_err(|e| eyre::eyre!("failed to read IndexMeta: {:?}", e))
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CounterEntry {
    cache_id: i32,
    reserved: u32,
    size: u64,
}

const COUNTER_ENTRY_SIZE: usize = size_of::<CounterEntry>();
const COUNTERS_PER_PAGE: usize = PAGE_USABLE_SIZE / COUNTER_ENTRY_SIZE;

/// Reads the per-cache size map from a counters chain.
pub fn read_shared_group_cache_sizes(
    state: &PageStoreState,
    counters_page_id: u64,
) -> Result<HashMap<i32, u64>> {
    let mut sizes = HashMap::new();

    let mut page_no = page_id::page_index(counters_page_id);
    while page_no != 0 {
        let page = state.page(page_no)?;
        expect_page_type(page, PageType::CacheSizeCounters)?;

        let header = PageHeader::from_bytes(page)?;
        for i in 0..header.cell_count() as usize {
            let offset = PAGE_HEADER_SIZE + i * COUNTER_ENTRY_SIZE;
            let entry = CounterEntry::ref_from_bytes(&page[offset..offset + COUNTER_ENTRY_SIZE])
                .map_err(|e| eyre::eyre!("failed to read counter entry: {:?}", e))?;
            sizes.insert(entry.cache_id, entry.size);
        }

        page_no = header.next_page();
    }

    Ok(sizes)
}

/// Writes a fresh counters chain and returns the page id of its head.
/// Entries are written in cache-id order so repeated runs produce
/// identical pages.
pub fn write_shared_group_cache_sizes(
    state: &mut PageStoreState,
    part: PartitionId,
    sizes: &HashMap<i32, u64>,
) -> Result<u64> {
    ensure!(!sizes.is_empty(), "refusing to write an empty counters chain");

    let mut entries: Vec<(i32, u64)> = sizes.iter().map(|(&k, &v)| (k, v)).collect();
    entries.sort_unstable_by_key(|&(cache_id, _)| cache_id);

    let mut head = 0u32;
    let mut prev = 0u32;

    for chunk in entries.chunks(COUNTERS_PER_PAGE) {
        let page_no = state.allocate_page()?;
        let page = state.page_mut(page_no)?;
        let header = PageHeader::init(page, PageType::CacheSizeCounters, 1)?;
        header.set_cell_count(chunk.len() as u16);

        for (i, &(cache_id, size)) in chunk.iter().enumerate() {
            let entry = CounterEntry {
                cache_id,
                reserved: 0,
                size,
            };
            let offset = PAGE_HEADER_SIZE + i * COUNTER_ENTRY_SIZE;
            page[offset..offset + COUNTER_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }

        if head == 0 {
            head = page_no;
        } else {
            let prev_page = state.page_mut(prev)?;
            PageHeader::from_bytes_mut(prev_page)?.set_next_page(page_no);
        }
        prev = page_no;
    }

    Ok(page_id::page_id(part, FLAG_DATA, head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MmapStorage;
    use tempfile::tempdir;

    fn fresh_state() -> (tempfile::TempDir, PageStoreState) {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("meta.bin"), 1).unwrap();
        (dir, PageStoreState::new(storage))
    }

    #[test]
    fn meta_fields_round_trip() {
        let (_dir, mut state) = fresh_state();

        init_partition_meta(state.page_mut(0).unwrap(), 2).unwrap();
        {
            let meta = partition_meta_mut(state.page_mut(0).unwrap()).unwrap();
            meta.partition_state = 1;
            meta.size = 10_000;
            meta.update_counter = 77;
            meta.global_remove_id = 5;
        }

        let page = state.page(0).unwrap();
        assert_eq!(meta_version(page).unwrap(), 2);
        let meta = partition_meta(page).unwrap();
        assert_eq!(meta.size, 10_000);
        assert_eq!(meta.update_counter, 77);
        assert_eq!(meta.global_remove_id, 5);
    }

    #[test]
    fn unsupported_init_version_is_rejected() {
        let (_dir, mut state) = fresh_state();
        assert!(init_partition_meta(state.page_mut(0).unwrap(), 4).is_err());
        assert!(init_partition_meta(state.page_mut(0).unwrap(), 0).is_err());
    }

    #[test]
    fn counters_chain_round_trips() {
        let (_dir, mut state) = fresh_state();

        let mut sizes = HashMap::new();
        for cache_id in 0..600 {
            sizes.insert(cache_id, cache_id as u64 * 3);
        }

        let head = write_shared_group_cache_sizes(&mut state, 4, &sizes).unwrap();
        assert_eq!(page_id::partition(head), 4);

        let read_back = read_shared_group_cache_sizes(&state, head).unwrap();
        assert_eq!(read_back, sizes);
    }
}
