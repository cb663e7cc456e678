//! Error taxonomy for control-plane operations.

use crate::types::LifecycleAction;

/// Errors surfaced by the orchestrator to its callers.
///
/// A worker vanishing between lookup and signaling is *not* an error; it
/// surfaces as [`crate::ControlOutcome::AlreadyGone`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The OS refused to spawn the worker. No instance was registered.
    #[error("failed to launch worker {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No live instance is registered under this process id.
    #[error("no live instance with process id {0}")]
    NotFound(u32),

    /// Signal delivery failed for a reason other than the process being gone.
    #[error("failed to {action} process {pid}: {source}")]
    Signal {
        pid: u32,
        action: LifecycleAction,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
