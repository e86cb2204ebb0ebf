//! # B+-Tree
//!
//! Ordered byte-key tree over a page store. The cache data tree, pending
//! entries tree, link maps, and the index tree are all instances of this
//! structure with different key encodings.
//!
//! All cells live in leaf pages; interior pages carry separators and
//! child pointers; leaves are chained for forward scans. Writes descend
//! with a path stack and propagate splits upward, allocating pages from
//! the owning store. The root moves when it splits; callers persist
//! `root_page()` into their meta page after mutations.
//!
//! `put` overwrites: inserting a key that already exists replaces its
//! value in place (values of one tree are fixed-width). Deletion is not
//! supported; defragmentation only ever appends into fresh trees, and the
//! link map overwrites on re-run instead of deleting.

use eyre::{bail, ensure, Result};

use super::interior::{InteriorNode, InteriorNodeMut};
use super::leaf::{LeafNode, LeafNodeMut, SearchResult, SLOT_SIZE, VALUE_LEN_SIZE};
use crate::storage::{PageHeader, PageStoreState, PageType};

#[derive(Debug)]
pub struct BTree<'a> {
    state: &'a mut PageStoreState,
    root_page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InsertResult {
    Ok,
    Split { separator: Vec<u8>, new_page: u32 },
}

impl<'a> BTree<'a> {
    pub fn new(state: &'a mut PageStoreState, root_page: u32) -> Result<Self> {
        ensure!(
            root_page < state.page_count(),
            "root page {} out of bounds (page_count={})",
            root_page,
            state.page_count()
        );
        Ok(Self { state, root_page })
    }

    /// Allocates and formats an empty tree; the new root is a leaf.
    pub fn create(state: &'a mut PageStoreState) -> Result<Self> {
        let root_page = state.allocate_page()?;
        LeafNodeMut::init(state.page_mut(root_page)?)?;
        Ok(Self { state, root_page })
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        search(self.state, self.root_page, key)
    }

    /// Inserts `key -> value`, overwriting an existing value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut path: Vec<(u32, Option<usize>)> = Vec::new();
        let mut current_page = self.root_page;

        loop {
            let page_data = self.state.page(current_page)?;
            let header = PageHeader::from_bytes(page_data)?;

            match header.page_type() {
                PageType::BTreeLeaf => break,
                PageType::BTreeInterior => {
                    let interior = InteriorNode::from_page(page_data)?;
                    let (child_page, slot) = interior.find_child(key)?;
                    path.push((current_page, slot));
                    current_page = child_page;
                }
                other => bail!(
                    "unexpected page type {:?} during put at page {}",
                    other,
                    current_page
                ),
            }
        }

        {
            let page_data = self.state.page_mut(current_page)?;
            let mut leaf = LeafNodeMut::from_page(page_data)?;
            if let SearchResult::Found(idx) = leaf.find_key(key)? {
                return leaf.update_value_at(idx, value);
            }
        }

        let result = self.insert_into_leaf(current_page, key, value)?;

        if let InsertResult::Split {
            separator,
            new_page,
        } = result
        {
            self.propagate_split(path, &separator, current_page, new_page)?;
        }

        Ok(())
    }

    fn insert_into_leaf(&mut self, page_no: u32, key: &[u8], value: &[u8]) -> Result<InsertResult> {
        let space_needed = key.len() + VALUE_LEN_SIZE + value.len() + SLOT_SIZE;

        {
            let page_data = self.state.page_mut(page_no)?;
            let mut leaf = LeafNodeMut::from_page(page_data)?;
            if leaf.free_space() as usize >= space_needed {
                leaf.insert_cell(key, value)?;
                return Ok(InsertResult::Ok);
            }
        }

        self.split_leaf(page_no, key, value)
    }

    fn split_leaf(&mut self, page_no: u32, key: &[u8], value: &[u8]) -> Result<InsertResult> {
        let new_page_no = self.state.allocate_page()?;

        let mut all_keys: Vec<Vec<u8>> = Vec::new();
        let mut all_values: Vec<Vec<u8>> = Vec::new();
        let old_next;

        {
            let page_data = self.state.page(page_no)?;
            let leaf = LeafNode::from_page(page_data)?;
            let count = leaf.cell_count() as usize;

            for i in 0..count {
                all_keys.push(leaf.key_at(i)?.to_vec());
                all_values.push(leaf.value_at(i)?.to_vec());
            }
            old_next = leaf.next_leaf();
        }

        let insert_pos = all_keys
            .iter()
            .position(|k| k.as_slice() > key)
            .unwrap_or(all_keys.len());
        all_keys.insert(insert_pos, key.to_vec());
        all_values.insert(insert_pos, value.to_vec());

        // Ascending insertion always lands on the rightmost leaf; a lean
        // split keeps those leaves full instead of half empty, which is
        // what makes a rewrite of a tree in key order compact.
        let mid = if insert_pos + 1 == all_keys.len() {
            all_keys.len() - 1
        } else {
            all_keys.len() / 2
        };
        let separator = all_keys[mid].clone();

        {
            let page_data = self.state.page_mut(page_no)?;
            let mut leaf = LeafNodeMut::init(page_data)?;
            for i in 0..mid {
                leaf.insert_cell(&all_keys[i], &all_values[i])?;
            }
            leaf.set_next_leaf(new_page_no)?;
        }

        {
            let page_data = self.state.page_mut(new_page_no)?;
            let mut new_leaf = LeafNodeMut::init(page_data)?;
            for i in mid..all_keys.len() {
                new_leaf.insert_cell(&all_keys[i], &all_values[i])?;
            }
            new_leaf.set_next_leaf(old_next)?;
        }

        Ok(InsertResult::Split {
            separator,
            new_page: new_page_no,
        })
    }

    fn propagate_split(
        &mut self,
        mut path: Vec<(u32, Option<usize>)>,
        separator: &[u8],
        left_child: u32,
        right_child: u32,
    ) -> Result<()> {
        let mut current_separator = separator.to_vec();
        let mut current_left = left_child;
        let mut current_right = right_child;

        while let Some((parent_page, _)) = path.pop() {
            let result = self.insert_into_interior(
                parent_page,
                &current_separator,
                current_left,
                current_right,
            )?;

            match result {
                InsertResult::Ok => return Ok(()),
                InsertResult::Split {
                    separator,
                    new_page,
                } => {
                    current_separator = separator;
                    current_left = parent_page;
                    current_right = new_page;
                }
            }
        }

        self.create_new_root(&current_separator, current_left, current_right)
    }

    fn insert_into_interior(
        &mut self,
        page_no: u32,
        separator: &[u8],
        left_child: u32,
        right_child: u32,
    ) -> Result<InsertResult> {
        let space_needed = separator.len() + super::interior::INTERIOR_SLOT_SIZE;

        {
            let page_data = self.state.page_mut(page_no)?;
            let mut interior = InteriorNodeMut::from_page(page_data)?;

            if interior.free_space() as usize >= space_needed {
                let (_, taken_slot) = interior.find_child(separator)?;

                match taken_slot {
                    // The split child hangs off an existing separator:
                    // keys < separator keep going left, the old slot is
                    // repointed at the new right page.
                    Some(slot) => {
                        interior.insert_separator(separator, left_child)?;
                        interior.set_child_at(slot + 1, right_child)?;
                    }
                    // The split child was the rightmost one.
                    None => {
                        interior.insert_separator(separator, left_child)?;
                        interior.set_right_child(right_child)?;
                    }
                }
                return Ok(InsertResult::Ok);
            }
        }

        self.split_interior(page_no, separator, left_child, right_child)
    }

    fn split_interior(
        &mut self,
        page_no: u32,
        new_separator: &[u8],
        _left_child: u32,
        new_right_child: u32,
    ) -> Result<InsertResult> {
        let new_page_no = self.state.allocate_page()?;

        let mut separators: Vec<Vec<u8>> = Vec::new();
        let mut children: Vec<u32> = Vec::new();

        {
            let page_data = self.state.page(page_no)?;
            let interior = InteriorNode::from_page(page_data)?;
            let count = interior.cell_count() as usize;

            for i in 0..count {
                separators.push(interior.key_at(i)?.to_vec());
                children.push(interior.slot_at(i)?.child_page);
            }
            children.push(interior.right_child());
        }

        let insert_pos = separators
            .iter()
            .position(|s| s.as_slice() > new_separator)
            .unwrap_or(separators.len());

        separators.insert(insert_pos, new_separator.to_vec());
        children.insert(insert_pos + 1, new_right_child);

        let mid = separators.len() / 2;
        let promoted = separators[mid].clone();

        {
            let page_data = self.state.page_mut(page_no)?;
            let mut left = InteriorNodeMut::init(page_data, children[mid])?;
            for i in 0..mid {
                left.insert_separator(&separators[i], children[i])?;
            }
        }

        {
            let page_data = self.state.page_mut(new_page_no)?;
            let mut right =
                InteriorNodeMut::init(page_data, *children.last().expect("children non-empty"))?;
            for i in (mid + 1)..separators.len() {
                right.insert_separator(&separators[i], children[i])?;
            }
        }

        Ok(InsertResult::Split {
            separator: promoted,
            new_page: new_page_no,
        })
    }

    fn create_new_root(
        &mut self,
        separator: &[u8],
        left_child: u32,
        right_child: u32,
    ) -> Result<()> {
        let new_root_no = self.state.allocate_page()?;

        let page_data = self.state.page_mut(new_root_no)?;
        let mut root = InteriorNodeMut::init(page_data, right_child)?;
        root.insert_separator(separator, left_child)?;

        self.root_page = new_root_no;

        Ok(())
    }
}

/// Point lookup without a mutable tree handle.
pub fn search(state: &PageStoreState, root: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut current_page = root;

    loop {
        let page_data = state.page(current_page)?;
        let header = PageHeader::from_bytes(page_data)?;

        match header.page_type() {
            PageType::BTreeLeaf => {
                let leaf = LeafNode::from_page(page_data)?;
                return match leaf.find_key(key)? {
                    SearchResult::Found(idx) => Ok(Some(leaf.value_at(idx)?.to_vec())),
                    SearchResult::NotFound(_) => Ok(None),
                };
            }
            PageType::BTreeInterior => {
                let interior = InteriorNode::from_page(page_data)?;
                current_page = interior.find_child(key)?.0;
            }
            other => bail!(
                "unexpected page type {:?} during search at page {}",
                other,
                current_page
            ),
        }
    }
}

/// Page number of the leftmost leaf, the entry point for forward scans.
pub fn first_leaf(state: &PageStoreState, root: u32) -> Result<u32> {
    let mut current_page = root;

    loop {
        let page_data = state.page(current_page)?;
        let header = PageHeader::from_bytes(page_data)?;

        match header.page_type() {
            PageType::BTreeLeaf => return Ok(current_page),
            PageType::BTreeInterior => {
                let interior = InteriorNode::from_page(page_data)?;
                current_page = interior.first_child()?;
            }
            other => bail!(
                "unexpected page type {:?} during descent at page {}",
                other,
                current_page
            ),
        }
    }
}
