//! The control-plane facade.
//!
//! [`Orchestrator`] owns the shared registry and the components acting on
//! it. It is cheap to clone; every clone manages the same fleet.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::control::{ProcessControl, SignalOutcome, platform_control};
use crate::error::Result;
use crate::filter::{LineFilter, TagFilter};
use crate::launcher::{CaptureConfig, Launcher, WorkerCommand};
use crate::lifecycle::{DEFAULT_STOP_TIMEOUT, LifecycleController};
use crate::lister::InstanceLister;
use crate::registry::InstanceRegistry;
use crate::stream::{OutputStream, StreamMultiplexer};
use crate::types::{ControlAck, InstanceSummary};

/// Everything needed to build an [`Orchestrator`].
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub command: WorkerCommand,
    pub capture: CaptureConfig,
    pub filter: Arc<dyn LineFilter>,
    pub stop_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command: WorkerCommand::default(),
            capture: CaptureConfig::default(),
            filter: Arc::new(TagFilter::default()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("command", &self.command)
            .field("capture", &self.capture)
            .field("filter", &self.filter.name())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

#[derive(Debug)]
struct Inner {
    registry: InstanceRegistry,
    launcher: Launcher,
    multiplexer: StreamMultiplexer,
    controller: LifecycleController,
    lister: InstanceLister,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("launcher", &self.inner.launcher)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator using the backend for the current platform.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_control(config, platform_control())
    }

    /// Build an orchestrator on an explicit process-control backend.
    pub fn with_control(config: OrchestratorConfig, control: Arc<dyn ProcessControl>) -> Self {
        let registry = InstanceRegistry::new();
        info!(
            control = control.name(),
            filter = config.filter.name(),
            program = %config.command.program,
            "orchestrator ready"
        );
        let inner = Inner {
            launcher: Launcher::new(
                config.command,
                config.capture,
                config.filter,
                registry.clone(),
            ),
            multiplexer: StreamMultiplexer::new(registry.clone()),
            controller: LifecycleController::new(
                registry.clone(),
                Arc::clone(&control),
                config.stop_timeout,
            ),
            lister: InstanceLister::new(registry.clone(), control),
            registry,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    /// Start a new worker. `output` is handed to the worker as its export
    /// destination.
    pub async fn launch(&self, output: Option<&Path>) -> Result<u32> {
        self.inner.launcher.launch(output).await
    }

    pub fn stream(&self, pid: u32) -> Result<OutputStream> {
        self.inner.multiplexer.stream(pid)
    }

    pub async fn pause(&self, pid: u32) -> Result<ControlAck> {
        self.inner.controller.pause(pid).await
    }

    pub async fn resume(&self, pid: u32) -> Result<ControlAck> {
        self.inner.controller.resume(pid).await
    }

    pub async fn stop(&self, pid: u32) -> Result<ControlAck> {
        self.inner.controller.stop(pid).await
    }

    /// Force-kill the worker's process group. Last resort when `stop` is
    /// not good enough; does not wait for the exit.
    pub fn kill(&self, pid: u32) -> Result<SignalOutcome> {
        self.inner.controller.kill(pid)
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        self.inner.lister.list().await
    }

    /// Stop every registered worker concurrently. Used on shutdown.
    pub async fn stop_all(&self) -> Vec<ControlAck> {
        let pids: Vec<u32> = self
            .inner
            .registry
            .snapshot()
            .iter()
            .map(|i| i.process_id)
            .collect();
        if pids.is_empty() {
            return Vec::new();
        }
        info!(count = pids.len(), "stopping all workers");

        let results = futures::future::join_all(pids.iter().map(|&pid| self.stop(pid))).await;
        results
            .into_iter()
            .zip(pids)
            .filter_map(|(result, pid)| match result {
                Ok(ack) => Some(ack),
                Err(e) => {
                    warn!(pid, error = %e, "failed to stop worker");
                    None
                }
            })
            .collect()
    }
}
