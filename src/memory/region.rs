//! # Data Regions
//!
//! A data region is a named page memory plus its runtime configuration.
//! The engine works with three: the node's default region (old
//! partitions, read-only here) and the two defragmentation-owned regions
//! for new partitions and link maps.

use std::sync::Arc;

use parking_lot::Mutex;

use super::page_memory::PageMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvictionMode {
    Disabled,
    RandomLru,
    Random2Lru,
}

#[derive(Debug, Clone)]
pub struct DataRegion {
    inner: Arc<RegionInner>,
}

#[derive(Debug)]
struct RegionInner {
    name: String,
    page_memory: Arc<PageMemory>,
    page_eviction_mode: Mutex<PageEvictionMode>,
}

impl DataRegion {
    pub fn new(name: impl Into<String>, page_eviction_mode: PageEvictionMode) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(RegionInner {
                page_memory: Arc::new(PageMemory::new(name.clone())),
                name,
                page_eviction_mode: Mutex::new(page_eviction_mode),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn page_memory(&self) -> &Arc<PageMemory> {
        &self.inner.page_memory
    }

    pub fn page_eviction_mode(&self) -> PageEvictionMode {
        *self.inner.page_eviction_mode.lock()
    }

    /// The defragmenter aligns its partition region with the eviction
    /// mode of the group currently being rewritten.
    pub fn set_page_eviction_mode(&self, mode: PageEvictionMode) {
        *self.inner.page_eviction_mode.lock() = mode;
    }
}
