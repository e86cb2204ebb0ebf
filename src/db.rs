//! # Database Manager
//!
//! Node-level database state the defragmenter consumes: named data
//! regions, the set of regions the node checkpoint flushes, and the WAL
//! switches. The WAL itself is outside this engine; what matters here is
//! the protocol: logging is resumed and a clean checkpoint forced before
//! any rewrite, then the WAL is deactivated locally so rewrite traffic
//! generates no redo.

use std::sync::atomic::{AtomicBool, Ordering};

use eyre::Result;
use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::memory::DataRegion;
use crate::storage::GroupId;

/// Region holding the new partition stores being built.
pub const DEFRAGMENTATION_PART_REGION_NAME: &str = "defragPartitionRegion";
/// Region holding the per-partition link-map stores.
pub const DEFRAGMENTATION_MAPPING_REGION_NAME: &str = "defragMappingRegion";

#[derive(Debug, Default)]
pub struct DatabaseManager {
    regions: Mutex<Vec<DataRegion>>,
    checkpointed_regions: Mutex<Vec<String>>,
    wal_logging_resumed: AtomicBool,
    wal_deactivated: AtomicBool,
    wal_disabled_groups: Mutex<HashSet<GroupId>>,
    state_restored: AtomicBool,
}

impl DatabaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a region; `checkpointed` regions belong to the node
    /// checkpoint's flush set.
    pub fn add_region(&self, region: DataRegion, checkpointed: bool) {
        if checkpointed {
            self.checkpointed_regions
                .lock()
                .push(region.name().to_string());
        }
        self.regions.lock().push(region);
    }

    pub fn data_region(&self, name: &str) -> Result<DataRegion> {
        self.regions
            .lock()
            .iter()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| eyre::eyre!("unknown data region '{}'", name))
    }

    pub fn checkpointed_data_regions(&self) -> Vec<String> {
        self.checkpointed_regions.lock().clone()
    }

    /// Takes a region out of the node checkpoint's flush set; the old
    /// region of a group under defragmentation must not be flushed.
    pub fn remove_checkpointed_region(&self, name: &str) {
        self.checkpointed_regions.lock().retain(|r| r != name);
    }

    pub fn resume_wal_logging(&self) {
        self.wal_logging_resumed.store(true, Ordering::Release);
    }

    pub fn wal_logging_resumed(&self) -> bool {
        self.wal_logging_resumed.load(Ordering::Acquire)
    }

    pub fn on_state_restored(&self) {
        self.state_restored.store(true, Ordering::Release);
    }

    pub fn state_restored(&self) -> bool {
        self.state_restored.load(Ordering::Acquire)
    }

    /// Local (node-level) WAL deactivation after the pre-defragmentation
    /// checkpoint.
    pub fn deactivate_wal(&self) {
        self.wal_deactivated.store(true, Ordering::Release);
    }

    pub fn wal_deactivated(&self) -> bool {
        self.wal_deactivated.load(Ordering::Acquire)
    }

    /// Per-group WAL disable; the page layer would still emit deltas for
    /// the group otherwise.
    pub fn disable_group_wal(&self, grp: GroupId) {
        self.wal_disabled_groups.lock().insert(grp);
    }

    pub fn group_wal_disabled(&self, grp: GroupId) -> bool {
        self.wal_disabled_groups.lock().contains(&grp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PageEvictionMode;

    #[test]
    fn regions_are_looked_up_by_name() {
        let db = DatabaseManager::new();
        db.add_region(
            DataRegion::new("default", PageEvictionMode::Disabled),
            true,
        );
        db.add_region(
            DataRegion::new(DEFRAGMENTATION_PART_REGION_NAME, PageEvictionMode::Disabled),
            false,
        );

        assert!(db.data_region("default").is_ok());
        assert!(db.data_region(DEFRAGMENTATION_PART_REGION_NAME).is_ok());
        assert!(db.data_region("missing").is_err());

        assert_eq!(db.checkpointed_data_regions(), vec!["default".to_string()]);
        db.remove_checkpointed_region("default");
        assert!(db.checkpointed_data_regions().is_empty());
    }

    #[test]
    fn wal_protocol_flags() {
        let db = DatabaseManager::new();

        assert!(!db.wal_logging_resumed());
        db.resume_wal_logging();
        db.on_state_restored();
        db.deactivate_wal();
        db.disable_group_wal(3);

        assert!(db.wal_logging_resumed());
        assert!(db.state_restored());
        assert!(db.wal_deactivated());
        assert!(db.group_wal_disabled(3));
        assert!(!db.group_wal_disabled(4));
    }
}
