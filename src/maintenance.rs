//! # Maintenance Registry
//!
//! Defragmentation runs during a maintenance-mode restart: an external
//! actor registers the task, the node comes up without serving traffic,
//! and the engine unregisters the task once every group is rewritten so
//! the next restart is a normal one.

use hashbrown::HashSet;
use parking_lot::Mutex;

pub const DEFRAGMENTATION_MNTC_TASK_NAME: &str = "defragmentationMaintenanceTask";

#[derive(Debug, Default)]
pub struct MaintenanceRegistry {
    tasks: Mutex<HashSet<String>>,
}

impl MaintenanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_maintenance_task(&self, name: &str) {
        self.tasks.lock().insert(name.to_string());
    }

    /// Returns whether the task was registered.
    pub fn unregister_maintenance_task(&self, name: &str) -> bool {
        self.tasks.lock().remove(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.lock().contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = MaintenanceRegistry::new();

        registry.register_maintenance_task(DEFRAGMENTATION_MNTC_TASK_NAME);
        assert!(registry.is_registered(DEFRAGMENTATION_MNTC_TASK_NAME));

        assert!(registry.unregister_maintenance_task(DEFRAGMENTATION_MNTC_TASK_NAME));
        assert!(!registry.unregister_maintenance_task(DEFRAGMENTATION_MNTC_TASK_NAME));
    }
}
