//! Instance listing with reconciliation against the OS process table.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::control::{self, OsProcessState, ProcessControl};
use crate::registry::InstanceRegistry;
use crate::types::{InstanceStatus, InstanceSummary, WorkerInstance};

#[derive(Clone)]
pub struct InstanceLister {
    registry: InstanceRegistry,
    control: Arc<dyn ProcessControl>,
}

impl std::fmt::Debug for InstanceLister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLister")
            .field("control", &self.control.name())
            .finish()
    }
}

impl InstanceLister {
    pub fn new(registry: InstanceRegistry, control: Arc<dyn ProcessControl>) -> Self {
        Self { registry, control }
    }

    /// Summaries of every live instance, oldest first.
    ///
    /// Entries whose process the OS no longer knows (or only knows as a
    /// zombie) are removed from the registry and left out. The OS is
    /// queried once per listing, on the blocking pool.
    pub async fn list(&self) -> Vec<InstanceSummary> {
        let instances = self.registry.snapshot();
        // A reaped worker's pid may already belong to someone else.
        let pids: Vec<u32> = instances
            .iter()
            .filter(|i| !i.has_exited())
            .map(|i| i.process_id)
            .collect();

        let states = match control::blocking(&self.control, move |c| {
            pids.into_iter()
                .map(|pid| (pid, c.status(pid)))
                .collect::<HashMap<_, _>>()
        })
        .await
        {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "process table query failed; listing recorded state");
                return instances.iter().map(WorkerInstance::summary).collect();
            }
        };

        instances
            .into_iter()
            .filter_map(|instance| self.reconcile(instance, &states))
            .collect()
    }

    fn reconcile(
        &self,
        instance: WorkerInstance,
        states: &HashMap<u32, Option<OsProcessState>>,
    ) -> Option<InstanceSummary> {
        let pid = instance.process_id;
        let os_state = states.get(&pid).copied().flatten();

        let Some(os_state) = os_state else {
            self.registry.remove_instance(pid, instance.instance_id);
            debug!(pid, "pruned instance whose process is gone");
            return None;
        };

        let mut summary = instance.summary();
        summary.status = effective_status(instance.status, os_state);
        Some(summary)
    }
}

/// OS-reported state wins; the recorded status covers backends that cannot
/// tell a suspended process from a running one.
fn effective_status(recorded: InstanceStatus, os: OsProcessState) -> InstanceStatus {
    match os {
        OsProcessState::Stopped => InstanceStatus::Paused,
        OsProcessState::Running => InstanceStatus::Running,
        OsProcessState::Unknown => recorded,
    }
}
