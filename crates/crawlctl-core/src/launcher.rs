//! Worker launcher: spawns a crawl worker, registers it, starts its capture.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::capture::{self, CaptureTask};
use crate::error::{OrchestratorError, Result};
use crate::filter::LineFilter;
use crate::registry::InstanceRegistry;
use crate::types::WorkerInstance;

/// How to invoke the worker executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to execute (looked up on `$PATH` when not a path).
    pub program: String,
    /// Fixed arguments, passed before the output destination.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag that introduces the output destination (e.g. `-o`). When unset,
    /// the destination is passed as a bare trailing argument.
    #[serde(default)]
    pub output_flag: Option<String>,
    /// Working directory; the worker reads its JSON config relative to it.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment, merged over the inherited one.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "scrapy".to_string(),
            args: vec!["crawl".to_string(), "gov_policy".to_string()],
            output_flag: Some("-o".to_string()),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl WorkerCommand {
    /// A command running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output_flag: None,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Full argument list for a launch with the given destination.
    pub fn argv(&self, output: Option<&Path>) -> Vec<String> {
        let mut argv = self.args.clone();
        if let Some(dest) = output {
            if let Some(ref flag) = self.output_flag {
                argv.push(flag.clone());
            }
            argv.push(dest.display().to_string());
        }
        argv
    }

    fn to_command(&self, output: Option<&Path>, stdout: Stdio, stderr: Stdio) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv(output));

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        // Python buffers stdout when it is a pipe; progress lines would
        // otherwise arrive in bursts.
        cmd.env("PYTHONUNBUFFERED", "1");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);

        // Own process group, so a group-directed interrupt reaches the whole
        // worker tree and a Ctrl+C in our terminal does not.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        cmd
    }
}

/// Read end of the pipe shared by a worker's stdout and stderr.
pub(crate) type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// One pipe behind both output descriptors. Writes to either land in the
/// same kernel buffer, so lines are read back in emission order.
fn combined_output() -> io::Result<(OutputPipe, Stdio, Stdio)> {
    let (reader, writer) = io::pipe()?;
    let stderr = Stdio::from(writer.try_clone()?);
    let stdout = Stdio::from(writer);
    Ok((async_reader(reader)?, stdout, stderr))
}

#[cfg(unix)]
fn async_reader(reader: io::PipeReader) -> io::Result<OutputPipe> {
    let fd = std::os::fd::OwnedFd::from(reader);
    Ok(Box::new(tokio::net::unix::pipe::Receiver::from_owned_fd(fd)?))
}

#[cfg(windows)]
fn async_reader(reader: io::PipeReader) -> io::Result<OutputPipe> {
    let handle = std::os::windows::io::OwnedHandle::from(reader);
    Ok(Box::new(tokio::fs::File::from_std(std::fs::File::from(handle))))
}

/// Tuning for the per-instance output capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Lines buffered per instance before the oldest are overwritten.
    pub channel_capacity: usize,
    /// How long to keep draining pipes after the worker exited (covers
    /// grandchildren that inherited the pipe and are still alive).
    pub drain_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Spawns workers and wires each one into the registry.
#[derive(Clone)]
pub struct Launcher {
    command: WorkerCommand,
    capture: CaptureConfig,
    filter: Arc<dyn LineFilter>,
    registry: InstanceRegistry,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("command", &self.command)
            .field("capture", &self.capture)
            .field("filter", &self.filter.name())
            .finish()
    }
}

impl Launcher {
    pub fn new(
        command: WorkerCommand,
        capture: CaptureConfig,
        filter: Arc<dyn LineFilter>,
        registry: InstanceRegistry,
    ) -> Self {
        Self {
            command,
            capture,
            filter,
            registry,
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Spawn a worker, register it and start its output capture.
    ///
    /// Returns the worker's process id. Must be called from within a tokio
    /// runtime. On failure nothing is registered.
    pub async fn launch(&self, output: Option<&Path>) -> Result<u32> {
        let program = self.command.program.clone();
        let launch_error = |source| OrchestratorError::Launch {
            program: program.clone(),
            source,
        };

        let (pipe, stdout, stderr) = combined_output().map_err(launch_error)?;
        let mut cmd = self.command.to_command(output, stdout, stderr);
        let spawned = cmd.spawn();
        // Release our copies of the write end; EOF depends on it.
        drop(cmd);
        let mut child = spawned.map_err(launch_error)?;

        let Some(pid) = child.id() else {
            // Already reaped; there is nothing to manage.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(OrchestratorError::Launch {
                program,
                source: std::io::Error::other("worker exited before its pid was read"),
            });
        };

        let (sender, receiver) = broadcast::channel(self.capture.channel_capacity.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);

        let instance = WorkerInstance::new(pid, receiver, exit_rx);
        let instance_id = instance.instance_id;

        // Register before the capture task exists so its final removal
        // always finds (or deliberately skips) this record.
        self.registry.register(instance);

        capture::spawn_capture(CaptureTask {
            pid,
            instance_id,
            child,
            output: pipe,
            filter: Arc::clone(&self.filter),
            sender,
            exit: exit_tx,
            registry: self.registry.clone(),
            drain_timeout: self.capture.drain_timeout,
        });

        info!(
            pid,
            instance = %instance_id,
            program = %program,
            output = ?output,
            "launched worker"
        );

        Ok(pid)
    }
}
