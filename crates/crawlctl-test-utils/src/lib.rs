//! Shared test utilities for crawlctl integration tests.
//!
//! Real workers are Python crawlers; tests stand them in with small `/bin/sh`
//! scripts written into a temp dir. Each [`FakeWorker`] owns its directory,
//! which is deleted when the value is dropped.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// Protocol tag the fake workers stamp on their progress lines.
pub const TAG: &str = "[gov_policy]";

/// Write an executable shell script `name` into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write fake worker");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake worker");
    }

    path
}

/// A fake worker script living in its own temp dir.
pub struct FakeWorker {
    dir: TempDir,
    script: PathBuf,
}

impl FakeWorker {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let script = write_script(dir.path(), "fake_worker.sh", body);
        Self { dir, script }
    }

    /// Emits `count` tagged progress lines, interleaved with untagged noise
    /// on stdout and stderr, then exits 0.
    pub fn tagged(count: usize) -> Self {
        Self::new(&tagged_body(count, 0.0))
    }

    /// Like [`FakeWorker::tagged`], sleeping `delay_secs` between lines.
    pub fn tagged_slow(count: usize, delay_secs: f64) -> Self {
        Self::new(&tagged_body(count, delay_secs))
    }

    /// Prints one tagged line, then runs until interrupted. Exits 0 on
    /// SIGINT after printing a final tagged line.
    pub fn long_running() -> Self {
        Self::new(&format!(
            "trap 'echo \"{TAG} interrupted\"; exit 0' INT\n\
             echo \"{TAG} started\"\n\
             while true; do sleep 0.05; done\n"
        ))
    }

    /// Spawns a long-lived child (`sleep`) and waits on it, so the worker
    /// has a one-generation process tree. Forwards SIGINT to the child.
    pub fn with_child() -> Self {
        Self::new(&format!(
            "sleep 300 &\n\
             CHILD=$!\n\
             trap 'kill $CHILD; exit 0' INT\n\
             echo \"{TAG} child $CHILD\"\n\
             wait $CHILD\n"
        ))
    }

    /// Counts upward forever, one tagged line per tick.
    pub fn ticker(interval_secs: f64) -> Self {
        Self::new(&format!(
            "i=0\n\
             trap 'exit 0' INT\n\
             while true; do\n\
             echo \"{TAG} tick $i\"\n\
             i=$((i+1))\n\
             sleep {interval_secs}\n\
             done\n"
        ))
    }

    /// Alternates tagged lines between stdout and stderr: even numbers on
    /// stdout, odd on stderr, `pairs` of each, counting up from 0.
    pub fn split_streams(pairs: usize) -> Self {
        Self::new(&format!(
            "i=0\n\
             while [ $i -lt {limit} ]; do\n\
             echo \"{TAG} $i\"\n\
             echo \"{TAG} $((i+1))\" >&2\n\
             i=$((i+2))\n\
             done\n",
            limit = pairs * 2
        ))
    }

    /// Writes each of its arguments as a tagged line, then exits.
    pub fn echo_args() -> Self {
        Self::new(&format!("for a in \"$@\"; do echo \"{TAG} arg $a\"; done\n"))
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// The script path as a program string for a worker command.
    pub fn program(&self) -> String {
        self.script.display().to_string()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Script body emitting `count` tagged lines plus noise.
pub fn tagged_body(count: usize, delay_secs: f64) -> String {
    let mut body = String::from("echo 'banner: worker starting'\n");
    for i in 0..count {
        body.push_str(&format!("echo '{TAG} line {i}'\n"));
        if i % 2 == 0 {
            body.push_str("echo 'DEBUG: middleware noise' >&2\n");
        }
        if delay_secs > 0.0 {
            body.push_str(&format!("sleep {delay_secs}\n"));
        }
    }
    body.push_str("echo 'worker finished' >&2\n");
    body
}

/// Expected text of the tagged lines emitted by [`tagged_body`].
pub fn tagged_lines(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{TAG} line {i}")).collect()
}

/// Poll `check` every 20ms until it returns `true` or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether `pid` has exited. Zombies count as exited, since an orphan is
/// reaped by whatever init the test runs under, possibly never.
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    proc_state(pid).is_none_or(|s| s == 'Z' || s == 'X')
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_gone(pid: u32) -> bool {
    // SAFETY: signal 0 performs error checking only.
    unsafe { libc::kill(pid as libc::pid_t, 0) != 0 }
}

/// One-letter state of `pid` from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().next()?.chars().next()
}

/// Direct children of `pid`, read from `/proc/<pid>/task/*/children`.
#[cfg(target_os = "linux")]
pub fn proc_children(pid: u32) -> Vec<u32> {
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    let mut children = Vec::new();
    for task in tasks.flatten() {
        if let Ok(list) = std::fs::read_to_string(task.path().join("children")) {
            children.extend(list.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
        }
    }
    children.sort_unstable();
    children
}
