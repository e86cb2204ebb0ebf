//! # B+-Tree Leaf Pages
//!
//! Leaf pages hold the tree's key/value cells in key order. Slots grow
//! down from the page header, cell content grows up from the page end:
//!
//! ```text
//! +----------------------+
//! | Page Header (16)     |   next_page = right sibling leaf
//! +----------------------+
//! | Slot 0, Slot 1, ...  |   4 bytes each: { offset, key_len }
//! +----------------------+
//! | Free Space           |
//! +----------------------+
//! | ... cell 1, cell 0   |   key bytes ++ u16 value_len ++ value bytes
//! +----------------------+
//! ```
//!
//! Values in this engine are 8-byte row links or empty, so cells carry a
//! plain u16 value length. Leaves are chained through the header's
//! `next_page` for forward scans.

use eyre::{bail, ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::{expect_page_type, PageHeader, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};

pub const SLOT_SIZE: usize = 4;
pub const VALUE_LEN_SIZE: usize = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct Slot {
    pub offset: u16,
    pub key_len: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> LeafNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        expect_page_type(data, PageType::BTreeLeaf)?;
        Ok(Self { data })
    }

    pub fn cell_count(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().cell_count()
    }

    pub fn next_leaf(&self) -> u32 {
        PageHeader::from_bytes(self.data).unwrap().next_page()
    }

    fn slot_at(&self, index: usize) -> Result<&Slot> {
        slot_at(self.data, index)
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        key_bytes(self.data, slot)
    }

    pub fn value_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        value_bytes(self.data, slot)
    }

    pub fn find_key(&self, key: &[u8]) -> Result<SearchResult> {
        find_key(self.data, key)
    }
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        expect_page_type(data, PageType::BTreeLeaf)?;
        Ok(Self { data })
    }

    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        PageHeader::init(data, PageType::BTreeLeaf, 1)?;
        Ok(Self { data })
    }

    pub fn cell_count(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().cell_count()
    }

    pub fn free_space(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().free_space()
    }

    pub fn next_leaf(&self) -> u32 {
        PageHeader::from_bytes(self.data).unwrap().next_page()
    }

    pub fn set_next_leaf(&mut self, page_no: u32) -> Result<()> {
        PageHeader::from_bytes_mut(self.data)?.set_next_page(page_no);
        Ok(())
    }

    pub fn key_at(&self, index: usize) -> Result<&[u8]> {
        let slot = slot_at(self.data, index)?;
        key_bytes(self.data, slot)
    }

    pub fn value_at(&self, index: usize) -> Result<&[u8]> {
        let slot = slot_at(self.data, index)?;
        value_bytes(self.data, slot)
    }

    pub fn find_key(&self, key: &[u8]) -> Result<SearchResult> {
        find_key(self.data, key)
    }

    /// Inserts a new cell; the key must not be present.
    pub fn insert_cell(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let cell_size = key.len() + VALUE_LEN_SIZE + value.len();
        let space_needed = cell_size + SLOT_SIZE;

        ensure!(
            self.free_space() as usize >= space_needed,
            "not enough free space in leaf: need {}, have {}",
            space_needed,
            self.free_space()
        );

        let insert_pos = match self.find_key(key)? {
            SearchResult::Found(_) => bail!("key already exists in leaf"),
            SearchResult::NotFound(pos) => pos,
        };

        let header = PageHeader::from_bytes(self.data)?;
        let cell_count = header.cell_count() as usize;
        let new_free_end = header.free_end() as usize - cell_size;

        let mut offset = new_free_end;
        self.data[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        self.data[offset..offset + VALUE_LEN_SIZE]
            .copy_from_slice(&(value.len() as u16).to_le_bytes());
        offset += VALUE_LEN_SIZE;
        self.data[offset..offset + value.len()].copy_from_slice(value);

        for i in (insert_pos..cell_count).rev() {
            let src = slot_offset(i);
            let dst = slot_offset(i + 1);
            self.data.copy_within(src..src + SLOT_SIZE, dst);
        }

        let slot = Slot {
            offset: new_free_end as u16,
            key_len: key.len() as u16,
        };
        let so = slot_offset(insert_pos);
        self.data[so..so + SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = PageHeader::from_bytes_mut(self.data)?;
        header.set_cell_count(cell_count as u16 + 1);
        header.set_free_start(header.free_start() + SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);

        Ok(())
    }

    /// Overwrites the value of an existing cell. The replacement must have
    /// the same length; tree values here are fixed-width links.
    pub fn update_value_at(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let slot = *slot_at(self.data, index)?;
        let value_start = slot.offset as usize + slot.key_len as usize;
        let len_bytes: [u8; 2] = self.data[value_start..value_start + VALUE_LEN_SIZE]
            .try_into()
            .unwrap();
        let existing_len = u16::from_le_bytes(len_bytes) as usize;

        ensure!(
            existing_len == value.len(),
            "value length mismatch on update: {} != {}",
            existing_len,
            value.len()
        );

        let data_start = value_start + VALUE_LEN_SIZE;
        self.data[data_start..data_start + value.len()].copy_from_slice(value);
        Ok(())
    }
}

fn slot_offset(index: usize) -> usize {
    PAGE_HEADER_SIZE + index * SLOT_SIZE
}

fn slot_at(data: &[u8], index: usize) -> Result<&Slot> {
    let count = PageHeader::from_bytes(data)?.cell_count() as usize;
    ensure!(
        index < count,
        "slot index {} out of bounds (cell_count={})",
        index,
        count
    );
    let offset = slot_offset(index);
    Slot::ref_from_bytes(&data[offset..offset + SLOT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read leaf slot {}: {:?}", index, e))
}

fn key_bytes<'a>(data: &'a [u8], slot: &Slot) -> Result<&'a [u8]> {
    let start = slot.offset as usize;
    let end = start + slot.key_len as usize;
    ensure!(end <= PAGE_SIZE, "key extends beyond page boundary");
    Ok(&data[start..end])
}

fn value_bytes<'a>(data: &'a [u8], slot: &Slot) -> Result<&'a [u8]> {
    let value_start = slot.offset as usize + slot.key_len as usize;
    ensure!(
        value_start + VALUE_LEN_SIZE <= PAGE_SIZE,
        "value length field beyond page boundary"
    );
    let len_bytes: [u8; 2] = data[value_start..value_start + VALUE_LEN_SIZE]
        .try_into()
        .unwrap();
    let value_len = u16::from_le_bytes(len_bytes) as usize;
    let start = value_start + VALUE_LEN_SIZE;
    ensure!(
        start + value_len <= PAGE_SIZE,
        "value extends beyond page boundary"
    );
    Ok(&data[start..start + value_len])
}

fn find_key(data: &[u8], key: &[u8]) -> Result<SearchResult> {
    let count = PageHeader::from_bytes(data)?.cell_count() as usize;

    let mut left = 0usize;
    let mut right = count;

    while left < right {
        let mid = left + (right - left) / 2;
        let slot = slot_at(data, mid)?;
        let mid_key = key_bytes(data, slot)?;

        match key.cmp(mid_key) {
            std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            std::cmp::Ordering::Less => right = mid,
            std::cmp::Ordering::Greater => left = mid + 1,
        }
    }

    Ok(SearchResult::NotFound(left))
}
