//! # Tree Iterator
//!
//! Forward in-order walk over a B+-tree's leaf chain. The callback
//! receives the leaf node and the entry index; the borrow of the page
//! lives for the duration of the callback and the iterator never mutates
//! the source tree. Returning `false` stops the walk.
//!
//! The callback is also the yield point: the partition copy loop checks
//! the wall clock between entries and cycles the checkpoint read lock
//! there (see §`defrag::partition`), so no timer thread is involved.

use eyre::Result;

use crate::btree::{self, LeafNode};
use crate::storage::PageStoreState;

/// Walks every leaf entry of the tree rooted at `root` in key order.
pub fn iterate<F>(state: &PageStoreState, root: u32, mut callback: F) -> Result<()>
where
    F: FnMut(&LeafNode<'_>, usize) -> Result<bool>,
{
    let mut leaf_no = btree::first_leaf(state, root)?;

    while leaf_no != 0 {
        let leaf = LeafNode::from_page(state.page(leaf_no)?)?;

        for index in 0..leaf.cell_count() as usize {
            if !callback(&leaf, index)? {
                return Ok(());
            }
        }

        leaf_no = leaf.next_leaf();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTree;
    use crate::storage::{MmapStorage, PageStoreState};
    use tempfile::tempdir;

    fn populated_state(rows: u32) -> (tempfile::TempDir, PageStoreState, u32) {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("iter.bin"), 1).unwrap();
        let mut state = PageStoreState::new(storage);

        let mut tree = BTree::create(&mut state).unwrap();
        for i in 0..rows {
            tree.put(&i.to_be_bytes(), &(i as u64).to_be_bytes()).unwrap();
        }
        let root = tree.root_page();
        (dir, state, root)
    }

    #[test]
    fn visits_every_entry_in_key_order() {
        let (_dir, state, root) = populated_state(3_000);

        let mut expected = 0u32;
        iterate(&state, root, |leaf, index| {
            let key = u32::from_be_bytes(leaf.key_at(index)?.try_into()?);
            assert_eq!(key, expected);
            expected += 1;
            Ok(true)
        })
        .unwrap();

        assert_eq!(expected, 3_000);
    }

    #[test]
    fn callback_false_stops_iteration() {
        let (_dir, state, root) = populated_state(100);

        let mut visited = 0;
        iterate(&state, root, |_, _| {
            visited += 1;
            Ok(visited < 10)
        })
        .unwrap();

        assert_eq!(visited, 10);
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("empty.bin"), 1).unwrap();
        let mut state = PageStoreState::new(storage);
        let root = BTree::create(&mut state).unwrap().root_page();

        let mut visited = 0;
        iterate(&state, root, |_, _| {
            visited += 1;
            Ok(true)
        })
        .unwrap();

        assert_eq!(visited, 0);
    }
}
