//! Crawl-process orchestrator.
//!
//! Manages a fleet of independent crawl-worker processes: launching them,
//! capturing and filtering their output, streaming it to callers, and
//! pausing/resuming/stopping each worker together with its descendants.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!     |
//!     +-- Launcher ----spawn----> worker process
//!     |       |                        |
//!     |       +--register--+      stdout/stderr
//!     |                    v           |
//!     +-- InstanceRegistry <--remove-- OutputCapture --LineFilter--> channel
//!     |        ^    ^                                                  |
//!     |        |    +---------- StreamMultiplexer <--------------------+
//!     |        |
//!     +-- LifecycleController --ProcessControl--> SIGSTOP/SIGCONT/SIGINT
//!     +-- InstanceLister      --ProcessControl--> process table
//! ```

mod capture;
pub mod control;
pub mod error;
pub mod filter;
pub mod launcher;
pub mod lifecycle;
pub mod lister;
pub mod orchestrator;
pub mod registry;
pub mod stream;
pub mod types;

pub use control::{OsProcessState, ProcessControl, SignalOutcome, platform_control};
pub use error::OrchestratorError;
pub use filter::{AcceptAll, LineFilter, TagFilter};
pub use launcher::{CaptureConfig, Launcher, WorkerCommand};
pub use lifecycle::LifecycleController;
pub use lister::InstanceLister;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use registry::InstanceRegistry;
pub use stream::{OutputStream, StreamMultiplexer};
pub use types::{
    ControlAck, ControlOutcome, InstanceStatus, InstanceSummary, LifecycleAction, OutputLine,
    WorkerInstance,
};
