//! Output capture: one task per worker instance.
//!
//! The task owns the child process. It reads the worker's combined
//! stdout/stderr pipe line by line, forwards lines accepted by the instance's [`LineFilter`] into the output
//! channel, reaps the child, and finally removes the instance from the
//! registry. The channel sender is dropped when the task ends, which is what
//! ends every [`crate::stream`] consumer.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::filter::LineFilter;
use crate::launcher::OutputPipe;
use crate::registry::InstanceRegistry;
use crate::types::{InstanceStatus, OutputLine};

/// Everything a capture task needs, handed over by the launcher.
pub(crate) struct CaptureTask {
    pub pid: u32,
    pub instance_id: Uuid,
    pub child: Child,
    pub output: OutputPipe,
    pub filter: Arc<dyn LineFilter>,
    pub sender: broadcast::Sender<OutputLine>,
    pub exit: watch::Sender<Option<ExitStatus>>,
    pub registry: InstanceRegistry,
    pub drain_timeout: Duration,
}

pub(crate) fn spawn_capture(task: CaptureTask) -> JoinHandle<()> {
    tokio::spawn(task.run())
}

/// Removes the instance from the registry when the capture task ends, even
/// if the task is cancelled or panics.
struct Deregister {
    registry: InstanceRegistry,
    pid: u32,
    instance_id: Uuid,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.remove_instance(self.pid, self.instance_id);
    }
}

/// Line reader that decodes lossily and survives `select!` cancellation.
///
/// Bytes read by a cancelled `read_until` stay in `buf`, so the next call
/// continues the same line instead of losing its head.
struct PipeLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PipeLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

async fn next_line<R: AsyncRead + Unpin>(
    pipe: &mut Option<PipeLines<R>>,
) -> io::Result<Option<String>> {
    match pipe {
        Some(p) => p.next_line().await,
        None => std::future::pending().await,
    }
}

/// Forwards accepted lines with consecutive sequence numbers.
struct Forwarder {
    pid: u32,
    filter: Arc<dyn LineFilter>,
    sender: broadcast::Sender<OutputLine>,
    next_seq: u64,
    dropped: u64,
}

impl Forwarder {
    fn offer(&mut self, text: String) {
        if !self.filter.accepts(&text) {
            self.dropped += 1;
            debug!(pid = self.pid, line = %text, "worker diagnostic");
            return;
        }
        let line = OutputLine {
            seq: self.next_seq,
            text,
        };
        self.next_seq += 1;
        // Fails only when no receiver is left (instance already removed).
        let _ = self.sender.send(line);
    }
}

impl CaptureTask {
    async fn run(self) {
        let Self {
            pid,
            instance_id,
            mut child,
            output,
            filter,
            sender,
            exit,
            registry,
            drain_timeout,
        } = self;

        let _deregister = Deregister {
            registry: registry.clone(),
            pid,
            instance_id,
        };
        registry.set_status(pid, instance_id, InstanceStatus::Running);

        let mut forwarder = Forwarder {
            pid,
            filter,
            sender,
            next_seq: 0,
            dropped: 0,
        };
        let mut output = Some(PipeLines::new(output));
        let mut reaped = false;

        let drain = tokio::time::sleep(drain_timeout);
        tokio::pin!(drain);

        loop {
            if reaped && output.is_none() {
                break;
            }

            tokio::select! {
                line = next_line(&mut output), if output.is_some() => match line {
                    Ok(Some(text)) => forwarder.offer(text),
                    Ok(None) => output = None,
                    Err(e) => {
                        warn!(pid, error = %e, "output read failed");
                        output = None;
                    }
                },
                status = child.wait(), if !reaped => {
                    reaped = true;
                    match status {
                        Ok(status) => {
                            info!(pid, status = %status, "worker exited");
                            let _ = exit.send(Some(status));
                        }
                        Err(e) => warn!(pid, error = %e, "failed to reap worker"),
                    }
                    drain.as_mut().reset(Instant::now() + drain_timeout);
                },
                () = &mut drain, if reaped => {
                    // Pipes held open by an orphaned grandchild.
                    debug!(pid, "output drain timed out");
                    break;
                },
            }
        }

        info!(
            pid,
            forwarded = forwarder.next_seq,
            dropped = forwarder.dropped,
            "output capture finished"
        );
    }
}
