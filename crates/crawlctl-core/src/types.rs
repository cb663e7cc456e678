//! Shared data types: instance records, output lines, acknowledgments.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use uuid::Uuid;

/// One captured line of protocol output.
///
/// `seq` is the 0-based index of this line among the lines forwarded for
/// its instance, so consumers can verify ordering and detect gaps left by
/// the drop-oldest channel policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub text: String,
}

/// Per-instance state machine.
///
/// `Spawned -> Running <-> Paused -> Exited | Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Spawned,
    Running,
    Paused,
    Exited,
    Terminated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A lifecycle control action requested for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// What a successful lifecycle request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    Paused,
    Resumed,
    /// The worker exited after the interrupt, within the stop timeout.
    Terminated,
    /// The interrupt was delivered but the worker is still shutting down.
    StopRequested,
    /// The worker was already gone; nothing was signaled.
    AlreadyGone,
}

/// Structured acknowledgment returned by pause/resume/stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    pub process_id: u32,
    pub action: LifecycleAction,
    pub outcome: ControlOutcome,
    /// Number of processes (worker plus descendants) that were signaled.
    pub affected: usize,
}

impl ControlAck {
    pub fn already_gone(process_id: u32, action: LifecycleAction) -> Self {
        Self {
            process_id,
            action,
            outcome: ControlOutcome::AlreadyGone,
            affected: 0,
        }
    }
}

/// One row of the instance listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub process_id: u32,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

/// The orchestrator's record of one running (or just-exited) worker.
///
/// Records are cheap to clone: every field that is shared with the capture
/// task or with stream consumers sits behind an `Arc` or a watch channel.
#[derive(Clone)]
pub struct WorkerInstance {
    /// OS process identifier.
    pub process_id: u32,
    /// Identity of this particular launch; distinguishes a reused OS pid.
    pub instance_id: Uuid,
    pub spawn_time: DateTime<Utc>,
    /// Last status recorded by the lifecycle controller.
    pub status: InstanceStatus,
    /// The single receiver of this instance's output channel.
    pub(crate) output: Arc<Mutex<broadcast::Receiver<OutputLine>>>,
    /// Published by the capture task once the child has been reaped.
    pub(crate) exit: watch::Receiver<Option<ExitStatus>>,
    /// Serializes pause/resume/stop on this instance.
    pub(crate) control_lock: Arc<Mutex<()>>,
}

impl WorkerInstance {
    pub(crate) fn new(
        process_id: u32,
        output: broadcast::Receiver<OutputLine>,
        exit: watch::Receiver<Option<ExitStatus>>,
    ) -> Self {
        Self {
            process_id,
            instance_id: Uuid::new_v4(),
            spawn_time: Utc::now(),
            status: InstanceStatus::Spawned,
            output: Arc::new(Mutex::new(output)),
            exit,
            control_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Exit status of the worker, if the capture task has reaped it.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// `true` once the worker was reaped, or once its capture task ended
    /// without being able to report a status.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some() || self.exit.has_changed().is_err()
    }

    /// Wait up to `timeout` for the worker to exit. Returns `true` if it did.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exit = self.exit.clone();
        match tokio::time::timeout(timeout, exit.wait_for(|s| s.is_some())).await {
            Ok(Ok(_)) => true,
            // Sender dropped: the capture task is gone, so is the worker.
            Ok(Err(_)) => true,
            Err(_elapsed) => false,
        }
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            process_id: self.process_id,
            status: self.status,
            created_at: self.spawn_time,
        }
    }
}

impl fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("process_id", &self.process_id)
            .field("instance_id", &self.instance_id)
            .field("spawn_time", &self.spawn_time)
            .field("status", &self.status)
            .field("exited", &self.has_exited())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a detached instance record plus the producer-side handles.
    pub(crate) fn instance(
        pid: u32,
    ) -> (
        WorkerInstance,
        broadcast::Sender<OutputLine>,
        watch::Sender<Option<ExitStatus>>,
    ) {
        let (tx, rx) = broadcast::channel(16);
        let (exit_tx, exit_rx) = watch::channel(None);
        (WorkerInstance::new(pid, rx, exit_rx), tx, exit_tx)
    }
}
