//! # Cache Layer
//!
//! Group contexts, per-partition data stores, and row codecs: the shape
//! of the data the defragmenter rewrites.
//!
//! - `group`: `CacheGroupContext` and its configuration
//! - `data_store`: per-partition trees, free list, and row storage
//! - `row`: `DataRow`/`SimpleDataRow` payloads and tree key encodings

mod data_store;
mod group;
pub mod row;

pub use data_store::CacheDataStore;
pub use group::{CacheGroupConfig, CacheGroupContext};
pub use row::{DataRow, SimpleDataRow, UNDEFINED_CACHE_ID};
