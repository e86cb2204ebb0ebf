//! # partdefrag - Partition Defragmentation Engine
//!
//! Rewrites each partition file of a cache group into a new, compacted
//! partition file, reconstructs the index partition from the new row
//! locations, and atomically replaces the old files on disk, all while
//! preserving durability through a dedicated checkpoint loop. The engine
//! runs during a maintenance-mode restart; the node serves no traffic.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Defragmenter (coordinator)         │
//! ├───────────────┬──────────────┬───────────┤
//! │ Partition     │ Index        │ File      │
//! │ Pipeline      │ Rebuilder    │ Layout    │
//! ├───────────────┴──────┬───────┴───────────┤
//! │ Tree Iterator │ Link Map │ Cache Stores  │
//! ├───────────────┴──────────┴───────────────┤
//! │     Checkpoint Controller + Read Lock     │
//! ├──────────────────────────────────────────┤
//! │   Page Memory (regions, dirty tracking)   │
//! ├──────────────────────────────────────────┤
//! │  B+-Trees │ Free List │ Data/Meta Pages   │
//! ├──────────────────────────────────────────┤
//! │       Memory-Mapped Page Store Files      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Crash Protocol
//!
//! Per partition the commit point is the rename of
//! `part-dfrg-N.bin.tmp` to `part-dfrg-N.bin`; per group it is the
//! atomic creation of `defrg-completion.marker`. A crash anywhere in
//! between leaves temporary files that the next run deletes or finishes;
//! renamed means durable, nothing is rolled back.
//!
//! ## Module Overview
//!
//! - [`defrag`]: coordinator, partition pipeline, link maps, file layout
//! - [`checkpoint`]: checkpointer thread and the cooperative read lock
//! - [`cache`]: group contexts, per-partition data stores, row codecs
//! - [`memory`]: page store registries and data regions
//! - [`btree`]: the slotted-page B+-tree behind every ordered structure
//! - [`storage`]: mmap page stores, page layouts, free list, meta pages
//! - [`db`], [`store_mgr`], [`maintenance`]: the node services the
//!   engine consumes

pub mod btree;
pub mod cache;
pub mod checkpoint;
pub mod db;
pub mod defrag;
pub mod error;
pub mod maintenance;
pub mod memory;
pub mod storage;
pub mod store_mgr;

pub use cache::{CacheDataStore, CacheGroupConfig, CacheGroupContext, DataRow};
pub use checkpoint::CheckpointController;
pub use db::DatabaseManager;
pub use defrag::{BTreeIndexing, Defragmenter, Indexing, LinkMap, NoopIndexing};
pub use error::DefragmentationError;
pub use maintenance::{MaintenanceRegistry, DEFRAGMENTATION_MNTC_TASK_NAME};
pub use memory::{DataRegion, PageEvictionMode};
pub use store_mgr::FilePageStoreManager;
