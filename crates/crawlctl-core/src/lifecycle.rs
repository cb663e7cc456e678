//! Pause, resume and stop for registered worker instances.
//!
//! Pause suspends the worker first and then its descendants generation by
//! generation; resume walks the same tree in reverse, so the worker itself is
//! never running while a descendant we suspended is still stopped. The tree
//! is enumerated once, before any signal is sent.
//!
//! Process-table queries run on the blocking pool; signals are sent inline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::control::{self, OsProcessState, ProcessControl, SignalOutcome};
use crate::error::{OrchestratorError, Result};
use crate::registry::InstanceRegistry;
use crate::types::{ControlAck, ControlOutcome, InstanceStatus, LifecycleAction, WorkerInstance};

/// Default time `stop` waits for the worker to exit after the interrupt.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals registered instances through a [`ProcessControl`] backend.
#[derive(Clone)]
pub struct LifecycleController {
    registry: InstanceRegistry,
    control: Arc<dyn ProcessControl>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("control", &self.control.name())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

impl LifecycleController {
    pub fn new(
        registry: InstanceRegistry,
        control: Arc<dyn ProcessControl>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            control,
            stop_timeout,
        }
    }

    /// Suspend the worker and every descendant.
    pub async fn pause(&self, pid: u32) -> Result<ControlAck> {
        let instance = self.registry.get(pid)?;
        let _serial = instance.control_lock.lock().await;
        let instance = self.live(&instance, LifecycleAction::Pause).await?;

        let affected = self.suspend_tree(pid).await?;
        self.registry
            .set_status(pid, instance.instance_id, InstanceStatus::Paused);
        info!(pid, affected, "paused worker");

        Ok(ControlAck {
            process_id: pid,
            action: LifecycleAction::Pause,
            outcome: ControlOutcome::Paused,
            affected,
        })
    }

    /// Resume a paused worker and every descendant.
    pub async fn resume(&self, pid: u32) -> Result<ControlAck> {
        let instance = self.registry.get(pid)?;
        let _serial = instance.control_lock.lock().await;
        let instance = self.live(&instance, LifecycleAction::Resume).await?;

        let affected = self.resume_tree(pid, LifecycleAction::Resume).await?;
        self.registry
            .set_status(pid, instance.instance_id, InstanceStatus::Running);
        info!(pid, affected, "resumed worker");

        Ok(ControlAck {
            process_id: pid,
            action: LifecycleAction::Resume,
            outcome: ControlOutcome::Resumed,
            affected,
        })
    }

    /// Ask the worker to shut down gracefully.
    ///
    /// Idempotent: an unregistered or already exited worker yields
    /// [`ControlOutcome::AlreadyGone`] and nothing is signaled.
    pub async fn stop(&self, pid: u32) -> Result<ControlAck> {
        let Ok(instance) = self.registry.get(pid) else {
            return Ok(ControlAck::already_gone(pid, LifecycleAction::Stop));
        };
        let _serial = instance.control_lock.lock().await;

        // Re-read under the lock: a stop that ran while we waited may have
        // removed the record, and a pause may have changed its status.
        let current = match self.registry.get(pid) {
            Ok(current) if current.instance_id == instance.instance_id => current,
            _ => return Ok(ControlAck::already_gone(pid, LifecycleAction::Stop)),
        };
        let os_state = if current.has_exited() {
            None
        } else {
            self.status(pid, LifecycleAction::Stop).await?
        };
        let Some(os_state) = os_state else {
            self.registry.remove_instance(pid, current.instance_id);
            info!(pid, "stop: worker already gone");
            return Ok(ControlAck::already_gone(pid, LifecycleAction::Stop));
        };

        // A stopped process does not act on SIGINT until continued.
        if current.status == InstanceStatus::Paused || os_state == OsProcessState::Stopped {
            if let Err(e) = self.resume_tree(pid, LifecycleAction::Stop).await {
                warn!(pid, error = %e, "could not resume worker before stopping it");
            }
        }

        let tree_size = match self.descendants(pid, LifecycleAction::Stop).await {
            Ok(generations) => 1 + generations.iter().map(Vec::len).sum::<usize>(),
            Err(_) => 1,
        };

        match self.control.interrupt_group(pid) {
            Ok(SignalOutcome::Delivered) => {}
            Ok(SignalOutcome::AlreadyGone) => {
                self.registry.remove_instance(pid, current.instance_id);
                info!(pid, "stop: worker already gone");
                return Ok(ControlAck::already_gone(pid, LifecycleAction::Stop));
            }
            Err(source) => {
                return Err(OrchestratorError::Signal {
                    pid,
                    action: LifecycleAction::Stop,
                    source,
                });
            }
        }

        let outcome = if current.wait_exit(self.stop_timeout).await {
            self.registry.remove_instance(pid, current.instance_id);
            info!(pid, status = ?current.exit_status(), "stopped worker");
            ControlOutcome::Terminated
        } else {
            info!(
                pid,
                timeout_secs = self.stop_timeout.as_secs(),
                "stop requested; worker still shutting down"
            );
            ControlOutcome::StopRequested
        };

        Ok(ControlAck {
            process_id: pid,
            action: LifecycleAction::Stop,
            outcome,
            affected: tree_size,
        })
    }

    /// Forcefully terminate the worker's process group without waiting.
    ///
    /// Skips the control lock, so it can cut short a `stop` that is still
    /// waiting. The capture task reaps the worker and deregisters it.
    pub fn kill(&self, pid: u32) -> Result<SignalOutcome> {
        let Ok(instance) = self.registry.get(pid) else {
            return Ok(SignalOutcome::AlreadyGone);
        };
        if instance.has_exited() {
            return Ok(SignalOutcome::AlreadyGone);
        }
        let outcome = self
            .control
            .kill_group(pid)
            .map_err(|source| OrchestratorError::Signal {
                pid,
                action: LifecycleAction::Stop,
                source,
            })?;
        warn!(pid, ?outcome, "killed worker process group");
        Ok(outcome)
    }

    /// The record for `instance`, if it is still registered and alive.
    async fn live(
        &self,
        instance: &WorkerInstance,
        action: LifecycleAction,
    ) -> Result<WorkerInstance> {
        let pid = instance.process_id;
        let current = self
            .registry
            .get(pid)
            .ok()
            .filter(|c| c.instance_id == instance.instance_id)
            .ok_or(OrchestratorError::NotFound(pid))?;
        if current.has_exited() || self.status(pid, action).await?.is_none() {
            return Err(OrchestratorError::NotFound(pid));
        }
        Ok(current)
    }

    async fn status(&self, pid: u32, action: LifecycleAction) -> Result<Option<OsProcessState>> {
        control::blocking(&self.control, move |c| c.status(pid))
            .await
            .map_err(|source| OrchestratorError::Signal {
                pid,
                action,
                source,
            })
    }

    async fn descendants(&self, pid: u32, action: LifecycleAction) -> Result<Vec<Vec<u32>>> {
        control::blocking(&self.control, move |c| c.descendants(pid))
            .await
            .and_then(|generations| generations)
            .map_err(|source| OrchestratorError::Signal {
                pid,
                action,
                source,
            })
    }

    /// Root first, then each generation. Returns the number signaled.
    async fn suspend_tree(&self, pid: u32) -> Result<usize> {
        let generations = self.descendants(pid, LifecycleAction::Pause).await?;

        self.signal_root(pid, LifecycleAction::Pause, |p| self.control.suspend(p))?;
        let mut affected = 1;
        for child in generations.iter().flatten().copied() {
            affected += self.signal_descendant(pid, child, LifecycleAction::Pause, |p| {
                self.control.suspend(p)
            });
        }
        Ok(affected)
    }

    /// Deepest generation first, root last. Returns the number signaled.
    async fn resume_tree(&self, pid: u32, action: LifecycleAction) -> Result<usize> {
        let generations = self.descendants(pid, action).await?;

        let mut affected = 0;
        for child in generations.iter().rev().flatten().copied() {
            affected += self.signal_descendant(pid, child, action, |p| self.control.resume(p));
        }
        self.signal_root(pid, action, |p| self.control.resume(p))?;
        Ok(affected + 1)
    }

    fn signal_root(
        &self,
        pid: u32,
        action: LifecycleAction,
        send: impl Fn(u32) -> std::io::Result<SignalOutcome>,
    ) -> Result<()> {
        match send(pid) {
            Ok(SignalOutcome::Delivered) => Ok(()),
            Ok(SignalOutcome::AlreadyGone) => Err(OrchestratorError::NotFound(pid)),
            Err(source) => Err(OrchestratorError::Signal {
                pid,
                action,
                source,
            }),
        }
    }

    fn signal_descendant(
        &self,
        root: u32,
        pid: u32,
        action: LifecycleAction,
        send: impl Fn(u32) -> std::io::Result<SignalOutcome>,
    ) -> usize {
        match send(pid) {
            Ok(SignalOutcome::Delivered) => 1,
            Ok(SignalOutcome::AlreadyGone) => 0,
            Err(e) => {
                warn!(root, pid, %action, error = %e, "failed to signal descendant");
                0
            }
        }
    }
}
