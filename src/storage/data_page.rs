//! # Slotted Data Pages
//!
//! Data pages hold row payloads. Each page carries an array of item slots
//! growing up from the header and payload bytes growing down from the end
//! of the page:
//!
//! ```text
//! +---------------------+
//! | Page Header (16)    |
//! +---------------------+
//! | Slot 0, Slot 1, ... |  <- grows down from offset 16
//! +---------------------+
//! | Free Space          |
//! +---------------------+
//! | ... item 1, item 0  |  <- grows up from page end
//! +---------------------+
//! ```
//!
//! The item id (slot index) becomes the top byte of the row link, so a
//! page holds at most 255 items. Rows are only ever appended during
//! defragmentation; there is no in-page delete.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::page::{expect_page_type, PageHeader, PageType};
use super::{PAGE_HEADER_SIZE, PAGE_SIZE};

pub const ITEM_SLOT_SIZE: usize = 4;
pub const MAX_ITEMS_PER_PAGE: usize = 255;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct ItemSlot {
    offset: u16,
    len: u16,
}

pub fn init_data_page(data: &mut [u8]) -> Result<()> {
    PageHeader::init(data, PageType::Data, 1)?;
    Ok(())
}

/// Free bytes available for one more item (slot included), or 0 when the
/// page is at its item-count limit.
pub fn data_page_free_space(data: &[u8]) -> Result<usize> {
    let header = PageHeader::from_bytes(data)?;
    if header.cell_count() as usize >= MAX_ITEMS_PER_PAGE {
        return Ok(0);
    }
    Ok((header.free_space() as usize).saturating_sub(ITEM_SLOT_SIZE))
}

/// Appends a row payload, returning the item id it was stored under.
pub fn insert_item(data: &mut [u8], payload: &[u8]) -> Result<u8> {
    expect_page_type(data, PageType::Data)?;

    let header = PageHeader::from_bytes(data)?;
    let item_count = header.cell_count() as usize;

    ensure!(
        item_count < MAX_ITEMS_PER_PAGE,
        "data page is at its item limit ({})",
        MAX_ITEMS_PER_PAGE
    );
    ensure!(
        header.free_space() as usize >= payload.len() + ITEM_SLOT_SIZE,
        "not enough free space in data page: need {}, have {}",
        payload.len() + ITEM_SLOT_SIZE,
        header.free_space()
    );

    let new_free_end = header.free_end() as usize - payload.len();
    data[new_free_end..new_free_end + payload.len()].copy_from_slice(payload);

    let slot = ItemSlot {
        offset: new_free_end as u16,
        len: payload.len() as u16,
    };
    let slot_offset = PAGE_HEADER_SIZE + item_count * ITEM_SLOT_SIZE;
    data[slot_offset..slot_offset + ITEM_SLOT_SIZE].copy_from_slice(slot.as_bytes());

    let header = PageHeader::from_bytes_mut(data)?;
    header.set_cell_count(item_count as u16 + 1);
    header.set_free_start(header.free_start() + ITEM_SLOT_SIZE as u16);
    header.set_free_end(new_free_end as u16);

    Ok(item_count as u8)
}

pub fn read_item(data: &[u8], item_id: u8) -> Result<&[u8]> {
    expect_page_type(data, PageType::Data)?;

    let header = PageHeader::from_bytes(data)?;
    ensure!(
        (item_id as u16) < header.cell_count(),
        "item {} out of bounds (item_count={})",
        item_id,
        header.cell_count()
    );

    let slot_offset = PAGE_HEADER_SIZE + item_id as usize * ITEM_SLOT_SIZE;
    let slot = ItemSlot::ref_from_bytes(&data[slot_offset..slot_offset + ITEM_SLOT_SIZE])
        .map_err(|e| eyre::eyre!("failed to read item slot {}: {:?}", item_id, e))?;

    let start = slot.offset as usize;
    let end = start + slot.len as usize;
    ensure!(end <= PAGE_SIZE, "item {} extends beyond page boundary", item_id);

    Ok(&data[start..end])
}
