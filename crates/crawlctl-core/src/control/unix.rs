//! POSIX backend: job-control signals and process-table scanning.

use std::io;

use tracing::debug;

use super::{OsProcessState, ProcEntry, ProcessControl, SignalOutcome, descendant_generations};

/// Signals processes with `libc::kill`.
///
/// Workers are launched as process-group leaders (`process_group(0)`), so
/// the group id used by [`ProcessControl::interrupt_group`] equals the
/// worker's pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixControl;

impl PosixControl {
    pub fn new() -> Self {
        Self
    }
}

/// Convert a pid to the signed form `kill(2)` expects, rejecting values that
/// would address a whole group or every process (`0`, `-1`).
fn as_target(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

/// `kill(2)` wrapper that maps `ESRCH` to [`SignalOutcome::AlreadyGone`].
fn send_signal(target: libc::pid_t, signal: libc::c_int) -> io::Result<SignalOutcome> {
    // SAFETY: kill has no memory-safety preconditions; `target` was checked
    // by `as_target` (or is its negation for a group).
    let ret = unsafe { libc::kill(target, signal) };
    if ret == 0 {
        return Ok(SignalOutcome::Delivered);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(SignalOutcome::AlreadyGone)
    } else {
        Err(err)
    }
}

/// Whether `pid` exists at all (`kill(pid, 0)`; `EPERM` still means alive).
fn exists(pid: u32) -> bool {
    let Ok(target) = as_target(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs error checking only.
    let ret = unsafe { libc::kill(target, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Map a one-letter process state (as found in `/proc/<pid>/stat` or the
/// first character of `ps -o stat`) to an [`OsProcessState`].
fn state_from_code(code: char) -> Option<OsProcessState> {
    match code {
        'Z' | 'X' | 'x' => None,
        'T' | 't' => Some(OsProcessState::Stopped),
        _ => Some(OsProcessState::Running),
    }
}

// ---------------------------------------------------------------------------
// Process table parsing
// ---------------------------------------------------------------------------

/// Parse the contents of `/proc/<pid>/stat` into `(entry, state code)`.
///
/// The command name is parenthesized and may itself contain spaces or
/// parentheses, so fields are located after the *last* `)`.
pub(crate) fn parse_proc_stat(contents: &str) -> Option<(ProcEntry, char)> {
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    let pid = contents[..open].trim().parse().ok()?;
    let mut rest = contents.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((ProcEntry { pid, ppid }, state))
}

/// Parse one line of `ps -A -o pid= -o ppid= -o stat=`.
pub(crate) fn parse_ps_line(line: &str) -> Option<(ProcEntry, char)> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let ppid = fields.next()?.parse().ok()?;
    let state = fields.next()?.chars().next()?;
    Some((ProcEntry { pid, ppid }, state))
}

#[cfg(target_os = "linux")]
fn read_state(pid: u32) -> Option<char> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&contents).map(|(_, state)| state)
}

#[cfg(not(target_os = "linux"))]
fn read_state(pid: u32) -> Option<char> {
    let output = std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .chars()
        .next()
}

#[cfg(target_os = "linux")]
fn process_table() -> io::Result<Vec<(ProcEntry, char)>> {
    let mut table = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Processes can vanish between readdir and read; skip them.
        let Ok(contents) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(row) = parse_proc_stat(&contents) {
            table.push(row);
        }
    }
    Ok(table)
}

#[cfg(not(target_os = "linux"))]
fn process_table() -> io::Result<Vec<(ProcEntry, char)>> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid=", "-o", "stat="])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "ps exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ps_line)
        .collect())
}

// ---------------------------------------------------------------------------
// ProcessControl implementation
// ---------------------------------------------------------------------------

impl ProcessControl for PosixControl {
    fn name(&self) -> &str {
        "posix"
    }

    fn status(&self, pid: u32) -> Option<OsProcessState> {
        match read_state(pid) {
            Some(code) => state_from_code(code),
            // No state available through the table; fall back to kill(0).
            None if exists(pid) => Some(OsProcessState::Unknown),
            None => None,
        }
    }

    fn descendants(&self, pid: u32) -> io::Result<Vec<Vec<u32>>> {
        let table: Vec<ProcEntry> = process_table()?
            .into_iter()
            // Zombies cannot be signaled meaningfully and spawn nothing.
            .filter(|(_, state)| state_from_code(*state).is_some())
            .map(|(entry, _)| entry)
            .collect();
        let generations = descendant_generations(&table, pid);
        debug!(
            pid,
            descendants = generations.iter().map(Vec::len).sum::<usize>(),
            "enumerated process tree"
        );
        Ok(generations)
    }

    fn suspend(&self, pid: u32) -> io::Result<SignalOutcome> {
        send_signal(as_target(pid)?, libc::SIGSTOP)
    }

    fn resume(&self, pid: u32) -> io::Result<SignalOutcome> {
        send_signal(as_target(pid)?, libc::SIGCONT)
    }

    fn interrupt_group(&self, pid: u32) -> io::Result<SignalOutcome> {
        signal_group(pid, libc::SIGINT)
    }

    fn kill_group(&self, pid: u32) -> io::Result<SignalOutcome> {
        signal_group(pid, libc::SIGKILL)
    }
}

/// Signal the group led by `pid`, falling back to `pid` alone when it is
/// not a group leader (or the group is gone).
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<SignalOutcome> {
    let target = as_target(pid)?;
    match send_signal(-target, signal)? {
        SignalOutcome::Delivered => Ok(SignalOutcome::Delivered),
        SignalOutcome::AlreadyGone => send_signal(target, signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proc_stat_simple() {
        let line = "1234 (python3) S 1200 1234 1234 0 -1 4194560 1500 0 0 0";
        let (entry, state) = parse_proc_stat(line).unwrap();
        assert_eq!(entry, ProcEntry { pid: 1234, ppid: 1200 });
        assert_eq!(state, 'S');
    }

    #[test]
    fn parse_proc_stat_comm_with_spaces_and_parens() {
        let line = "77 (weird (name) x) T 5 77 77 0";
        let (entry, state) = parse_proc_stat(line).unwrap();
        assert_eq!(entry, ProcEntry { pid: 77, ppid: 5 });
        assert_eq!(state, 'T');
    }

    #[test]
    fn parse_proc_stat_rejects_garbage() {
        assert!(parse_proc_stat("").is_none());
        assert!(parse_proc_stat("abc (x) S").is_none());
        assert!(parse_proc_stat("12 (x)").is_none());
    }

    #[test]
    fn parse_ps_line_fields() {
        let (entry, state) = parse_ps_line("  501   1 Ss  ").unwrap();
        assert_eq!(entry, ProcEntry { pid: 501, ppid: 1 });
        assert_eq!(state, 'S');
        assert!(parse_ps_line("PID PPID STAT").is_none());
    }

    #[test]
    fn state_codes_map_to_os_state() {
        assert_eq!(state_from_code('R'), Some(OsProcessState::Running));
        assert_eq!(state_from_code('S'), Some(OsProcessState::Running));
        assert_eq!(state_from_code('D'), Some(OsProcessState::Running));
        assert_eq!(state_from_code('T'), Some(OsProcessState::Stopped));
        assert_eq!(state_from_code('t'), Some(OsProcessState::Stopped));
        assert_eq!(state_from_code('Z'), None);
    }

    #[test]
    fn refuses_to_signal_pid_zero() {
        let control = PosixControl::new();
        let err = control.suspend(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(control.interrupt_group(0).is_err());
        assert!(control.status(0).is_none());
    }

    #[test]
    fn own_process_is_running() {
        let control = PosixControl::new();
        let state = control.status(std::process::id());
        assert!(matches!(
            state,
            Some(OsProcessState::Running) | Some(OsProcessState::Unknown)
        ));
    }

    #[test]
    fn exited_child_is_gone_and_signals_report_already_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let control = PosixControl::new();
        assert!(control.status(pid).is_none());
        assert_eq!(control.resume(pid).unwrap(), SignalOutcome::AlreadyGone);
        assert_eq!(
            control.interrupt_group(pid).unwrap(),
            SignalOutcome::AlreadyGone
        );
    }

    #[test]
    fn kill_group_terminates_group_members() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};

        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' INT; sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        let control = PosixControl::new();
        assert_eq!(control.kill_group(pid).unwrap(), SignalOutcome::Delivered);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn descendants_of_shell_include_its_child() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id();

        let control = PosixControl::new();
        let mut found = Vec::new();
        for _ in 0..50 {
            found = control.descendants(pid).unwrap();
            if !found.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let _ = child.kill();
        let _ = child.wait();
        for pid in found.iter().flatten() {
            let _ = send_signal(*pid as libc::pid_t, libc::SIGKILL);
        }

        assert_eq!(found.len(), 1, "expected one generation, got {found:?}");
        assert_eq!(found[0].len(), 1);
    }
}
