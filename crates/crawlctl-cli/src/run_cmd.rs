//! `crawlctl run`: launch one worker in the foreground and print its lines.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crawlctl_core::{ControlOutcome, Orchestrator, SignalOutcome};

/// How long to wait for the exit status once the output stream has closed.
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(5);

/// Run a single worker to completion. Returns the process exit code.
pub async fn run_foreground(orch: Orchestrator, output: Option<&Path>) -> Result<i32> {
    let pid = orch.launch(output).await.context("failed to launch worker")?;
    let instance = orch
        .registry()
        .get(pid)
        .context("worker exited before it could be observed")?;
    let mut lines = orch
        .stream(pid)
        .context("failed to open worker output stream")?;

    eprintln!("Worker started (pid {pid}). Ctrl+C to stop.");

    // First signal stops the worker, second kills it and force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    let orch_clone = orch.clone();

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                // The worker has its own process group; our exit alone
                // would leave it running.
                kill_worker(&orch_clone, pid);
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nStopping worker (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let mut stop_task = None;
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => println!("{}", line.text),
                None => break,
            },
            _ = cancel.cancelled(), if stop_task.is_none() => {
                let orch = orch.clone();
                stop_task = Some(tokio::spawn(async move { orch.stop(pid).await }));
            }
        }
    }

    if let Some(task) = stop_task {
        match task.await.context("stop task panicked")? {
            Ok(ack) if ack.outcome == ControlOutcome::StopRequested => {
                tracing::warn!(pid, "worker did not exit within the stop timeout");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to stop worker"),
        }
    }

    instance.wait_exit(EXIT_STATUS_GRACE).await;
    let code = match instance.exit_status() {
        Some(status) => {
            if !status.success() {
                eprintln!("Worker exited with {status}.");
            }
            status.code().unwrap_or(if got_first_signal.load(Ordering::SeqCst) {
                130
            } else {
                1
            })
        }
        None => {
            eprintln!("Worker exit status unavailable.");
            1
        }
    };
    Ok(code)
}

/// Kill the worker's process group, logging instead of failing.
fn kill_worker(orch: &Orchestrator, pid: u32) {
    match orch.kill(pid) {
        Ok(SignalOutcome::Delivered) => eprintln!("Killed worker (pid {pid})."),
        Ok(SignalOutcome::AlreadyGone) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill worker"),
    }
}
