//! Process-control capability: OS-level signaling and process-table queries.
//!
//! The [`ProcessControl`] trait keeps the lifecycle controller and lister
//! platform-neutral. Backends:
//!
//! - [`unix::PosixControl`] -- `SIGSTOP`/`SIGCONT`/`SIGINT`/`SIGKILL` via `libc::kill`,
//!   process table from `/proc` (Linux) or `ps` (other unixes).
//! - [`win32::WindowsControl`] -- thread suspension, `CTRL_BREAK_EVENT` to
//!   the worker's console process group, Toolhelp32 process snapshots.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod win32;

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

/// Liveness/state of a process as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsProcessState {
    Running,
    /// Job-control stopped (suspended).
    Stopped,
    /// Alive, but the backend cannot tell whether it is suspended.
    Unknown,
}

/// Result of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The target no longer exists.
    AlreadyGone,
}

/// One row of the OS process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
}

/// Platform backend for signaling processes and inspecting the process table.
pub trait ProcessControl: Send + Sync {
    /// Backend name (e.g. "posix").
    fn name(&self) -> &str;

    /// Current OS state of `pid`, or `None` if it no longer exists (zombies
    /// count as gone).
    fn status(&self, pid: u32) -> Option<OsProcessState>;

    /// Descendants of `pid`, grouped by generation: children first, then
    /// grandchildren, and so on. The root itself is not included.
    fn descendants(&self, pid: u32) -> io::Result<Vec<Vec<u32>>>;

    /// Suspend a single process.
    fn suspend(&self, pid: u32) -> io::Result<SignalOutcome>;

    /// Resume a single suspended process.
    fn resume(&self, pid: u32) -> io::Result<SignalOutcome>;

    /// Deliver a graceful interrupt to the process group led by `pid`.
    fn interrupt_group(&self, pid: u32) -> io::Result<SignalOutcome>;

    /// Forcefully terminate the process group led by `pid`. Does not wait.
    fn kill_group(&self, pid: u32) -> io::Result<SignalOutcome>;
}

/// The backend for the current build target.
#[cfg(unix)]
pub fn platform_control() -> Arc<dyn ProcessControl> {
    Arc::new(unix::PosixControl::new())
}

/// The backend for the current build target.
#[cfg(windows)]
pub fn platform_control() -> Arc<dyn ProcessControl> {
    Arc::new(win32::WindowsControl::new())
}

/// Run a backend call on tokio's blocking pool.
///
/// Process-table queries read `/proc` or fork `ps`; they never run on a
/// runtime worker thread.
pub(crate) async fn blocking<T, F>(control: &Arc<dyn ProcessControl>, f: F) -> io::Result<T>
where
    F: FnOnce(&dyn ProcessControl) -> T + Send + 'static,
    T: Send + 'static,
{
    let control = Arc::clone(control);
    tokio::task::spawn_blocking(move || f(control.as_ref()))
        .await
        .map_err(|e| io::Error::other(format!("process query task failed: {e}")))
}

/// Walk a process table breadth-first from `root`, returning each generation
/// of descendants.
///
/// Cycles (possible in a racy snapshot where pids were recycled) are cut by
/// visiting every pid at most once.
pub fn descendant_generations(table: &[ProcEntry], root: u32) -> Vec<Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in table {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }
    for kids in children.values_mut() {
        kids.sort_unstable();
    }

    let mut seen: HashSet<u32> = HashSet::from([root]);
    let mut generations = Vec::new();
    let mut frontier = vec![root];

    while !frontier.is_empty() {
        let next: Vec<u32> = frontier
            .iter()
            .filter_map(|p| children.get(p))
            .flatten()
            .copied()
            .filter(|pid| seen.insert(*pid))
            .collect();
        if next.is_empty() {
            break;
        }
        generations.push(next.clone());
        frontier = next;
    }

    generations
}
