//! Instance registry -- the authoritative map from process id to record.
//!
//! Every other component (launcher, capture tasks, lifecycle controller,
//! lister and stream consumers) goes through this type. The map lives behind
//! a `std::sync::Mutex` that is only held for short, non-async sections and
//! never across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::types::{InstanceStatus, WorkerInstance};

/// Shared, concurrency-safe registry of live worker instances.
///
/// Cloning yields another handle onto the same map.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<Mutex<HashMap<u32, WorkerInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, WorkerInstance>> {
        // A panic while holding the lock cannot leave the map half-updated
        // (every critical section is a single insert/remove/clone).
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an instance under its process id.
    ///
    /// A leftover record under the same pid belongs to a process the OS has
    /// already recycled; it is replaced and returned.
    pub fn register(&self, instance: WorkerInstance) -> Option<WorkerInstance> {
        let pid = instance.process_id;
        let previous = self.lock().insert(pid, instance);
        if let Some(ref old) = previous {
            warn!(
                pid,
                stale_instance = %old.instance_id,
                "replaced stale registry entry for reused pid"
            );
        }
        previous
    }

    /// Look up the record for `pid`.
    pub fn get(&self, pid: u32) -> Result<WorkerInstance> {
        self.lock()
            .get(&pid)
            .cloned()
            .ok_or(OrchestratorError::NotFound(pid))
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Remove whatever record is registered under `pid`.
    pub fn remove(&self, pid: u32) -> Option<WorkerInstance> {
        self.lock().remove(&pid)
    }

    /// Remove the record for `pid` only if it is still the given instance.
    ///
    /// Capture tasks and the lister use this so a late removal can never
    /// drop a newer, unrelated instance that reused the pid.
    pub fn remove_instance(&self, pid: u32, instance_id: Uuid) -> Option<WorkerInstance> {
        let mut map = self.lock();
        match map.get(&pid) {
            Some(current) if current.instance_id == instance_id => {
                debug!(pid, instance = %instance_id, "deregistered instance");
                map.remove(&pid)
            }
            _ => None,
        }
    }

    /// Record a new status for the given instance. Returns `false` if the
    /// instance is no longer registered.
    pub fn set_status(&self, pid: u32, instance_id: Uuid, status: InstanceStatus) -> bool {
        match self.lock().get_mut(&pid) {
            Some(current) if current.instance_id == instance_id => {
                current.status = status;
                true
            }
            _ => false,
        }
    }

    /// Copy of all records, ordered by spawn time then pid.
    pub fn snapshot(&self) -> Vec<WorkerInstance> {
        let mut records: Vec<WorkerInstance> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.spawn_time
                .cmp(&b.spawn_time)
                .then(a.process_id.cmp(&b.process_id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pids: Vec<u32> = self.lock().keys().copied().collect();
        pids.sort_unstable();
        f.debug_struct("InstanceRegistry")
            .field("pids", &pids)
            .finish()
    }
}
