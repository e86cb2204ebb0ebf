//! # B+-Tree Module
//!
//! Slotted-page B+-tree used for every ordered structure in the engine:
//! the per-partition cache data tree, the pending entries tree, the
//! per-partition link maps, and the group index tree.
//!
//! - `leaf`: leaf pages (cells, leaf chain)
//! - `interior`: interior pages (separators, child pointers)
//! - `tree`: descent, insert with split propagation, read-only search
//!
//! The tree does not know about key semantics; callers encode composite
//! keys into ordered byte strings (see `cache::row`).

mod interior;
mod leaf;
mod tree;

pub use interior::{InteriorNode, InteriorNodeMut, INTERIOR_SLOT_SIZE};
pub use leaf::{LeafNode, LeafNodeMut, SearchResult, SLOT_SIZE, VALUE_LEN_SIZE};
pub use tree::{first_leaf, search, BTree};
