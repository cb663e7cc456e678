//! Per-instance output streams.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::InstanceRegistry;
use crate::types::OutputLine;

/// Live, ordered sequence of one instance's forwarded output lines.
///
/// Ends once the worker has exited and every buffered line was delivered.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Hands out output streams for registered instances.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    registry: InstanceRegistry,
}

impl StreamMultiplexer {
    pub fn new(registry: InstanceRegistry) -> Self {
        Self { registry }
    }

    /// Open a stream over `pid`'s output.
    ///
    /// All streams for one instance share a single cursor: each line is
    /// delivered to exactly one of them. A stream opened after another one
    /// consumed some lines starts at the first undelivered line.
    pub fn stream(&self, pid: u32) -> Result<OutputStream> {
        let instance = self.registry.get(pid)?;
        let receiver = Arc::clone(&instance.output);

        Ok(Box::pin(async_stream::stream! {
            loop {
                // Lock per receive so a dropped consumer frees the cursor.
                let next = {
                    let mut rx = receiver.lock().await;
                    rx.recv().await
                };
                match next {
                    Ok(line) => yield line,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(pid, skipped, "output consumer lagged; oldest lines were overwritten");
                    }
                    Err(RecvError::Closed) => {
                        debug!(pid, "output stream ended");
                        break;
                    }
                }
            }
        }))
    }
}
