//! Windows backend: thread suspension, console control events, Toolhelp32.
//!
//! Windows has no job-control signals. Suspending a process means
//! suspending each of its threads. The graceful interrupt is a
//! `CTRL_BREAK_EVENT` sent to the console process group, which is why
//! workers are spawned with `CREATE_NEW_PROCESS_GROUP`.

use std::io;

use ::windows::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER, HANDLE, STILL_ACTIVE};
use ::windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
use ::windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPPROCESS,
    TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use ::windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, OpenThread, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_TERMINATE, ResumeThread, SuspendThread, THREAD_SUSPEND_RESUME, TerminateProcess,
};
use tracing::warn;

use super::{OsProcessState, ProcEntry, ProcessControl, SignalOutcome, descendant_generations};

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a successful Open*/Create* call
        // and is closed exactly once.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn win_err(e: ::windows::core::Error) -> io::Error {
    io::Error::from(e)
}

fn is_invalid_parameter(e: &::windows::core::Error) -> bool {
    e.code() == ERROR_INVALID_PARAMETER.to_hresult()
}

fn snapshot_processes() -> io::Result<Vec<ProcEntry>> {
    // SAFETY: plain FFI; the snapshot handle is owned and closed below.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }.map_err(win_err)?;
    let snapshot = OwnedHandle(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    let mut table = Vec::new();
    // SAFETY: `entry` is a properly sized, writable PROCESSENTRY32W.
    let mut more = unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_ok();
    while more {
        table.push(ProcEntry {
            pid: entry.th32ProcessID,
            ppid: entry.th32ParentProcessID,
        });
        // SAFETY: as above.
        more = unsafe { Process32NextW(snapshot.0, &mut entry) }.is_ok();
    }
    Ok(table)
}

fn thread_ids(pid: u32) -> io::Result<Vec<u32>> {
    // SAFETY: plain FFI; the snapshot handle is owned and closed below.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }.map_err(win_err)?;
    let snapshot = OwnedHandle(snapshot);

    let mut entry = THREADENTRY32 {
        dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
        ..Default::default()
    };
    let mut ids = Vec::new();
    // SAFETY: `entry` is a properly sized, writable THREADENTRY32.
    let mut more = unsafe { Thread32First(snapshot.0, &mut entry) }.is_ok();
    while more {
        if entry.th32OwnerProcessID == pid {
            ids.push(entry.th32ThreadID);
        }
        // SAFETY: as above.
        more = unsafe { Thread32Next(snapshot.0, &mut entry) }.is_ok();
    }
    Ok(ids)
}

/// Apply `op` to every thread of `pid`.
fn for_each_thread(pid: u32, op: unsafe fn(HANDLE) -> u32) -> io::Result<SignalOutcome> {
    let threads = thread_ids(pid)?;
    if threads.is_empty() {
        return Ok(SignalOutcome::AlreadyGone);
    }
    for tid in threads {
        // SAFETY: plain FFI; the returned handle is owned and closed.
        let handle = match unsafe { OpenThread(THREAD_SUSPEND_RESUME, false, tid) } {
            Ok(h) => OwnedHandle(h),
            Err(e) => {
                // Threads can exit between the snapshot and here.
                warn!(pid, tid, error = %e, "could not open thread");
                continue;
            }
        };
        // SAFETY: the handle carries THREAD_SUSPEND_RESUME access.
        let previous = unsafe { op(handle.0) };
        if previous == u32::MAX {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(SignalOutcome::Delivered)
}

fn terminate(pid: u32) -> io::Result<SignalOutcome> {
    // SAFETY: plain FFI; the returned handle is owned and closed.
    let handle = match unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) } {
        Ok(h) => OwnedHandle(h),
        Err(e) if is_invalid_parameter(&e) => return Ok(SignalOutcome::AlreadyGone),
        Err(e) => return Err(win_err(e)),
    };
    // SAFETY: the handle carries PROCESS_TERMINATE access.
    unsafe { TerminateProcess(handle.0, 1) }.map_err(win_err)?;
    Ok(SignalOutcome::Delivered)
}

unsafe fn suspend_thread(h: HANDLE) -> u32 {
    // SAFETY: forwarded from the caller.
    unsafe { SuspendThread(h) }
}

unsafe fn resume_thread(h: HANDLE) -> u32 {
    // SAFETY: forwarded from the caller.
    unsafe { ResumeThread(h) }
}

/// Windows process control via Win32 APIs.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsControl;

impl WindowsControl {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessControl for WindowsControl {
    fn name(&self) -> &str {
        "win32"
    }

    fn status(&self, pid: u32) -> Option<OsProcessState> {
        if pid == 0 {
            return None;
        }
        // SAFETY: plain FFI; the returned handle is owned and closed.
        let handle = match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) } {
            Ok(h) => OwnedHandle(h),
            Err(e) if is_invalid_parameter(&e) => return None,
            // Access denied and friends: the process exists.
            Err(_) => return Some(OsProcessState::Unknown),
        };
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer; the handle has query access.
        match unsafe { GetExitCodeProcess(handle.0, &mut code) } {
            Ok(()) if code == STILL_ACTIVE.0 as u32 => Some(OsProcessState::Unknown),
            Ok(()) => None,
            Err(_) => Some(OsProcessState::Unknown),
        }
    }

    fn descendants(&self, pid: u32) -> io::Result<Vec<Vec<u32>>> {
        let table = snapshot_processes()?;
        Ok(descendant_generations(&table, pid))
    }

    fn suspend(&self, pid: u32) -> io::Result<SignalOutcome> {
        for_each_thread(pid, suspend_thread)
    }

    fn resume(&self, pid: u32) -> io::Result<SignalOutcome> {
        for_each_thread(pid, resume_thread)
    }

    fn interrupt_group(&self, pid: u32) -> io::Result<SignalOutcome> {
        if self.status(pid).is_none() {
            return Ok(SignalOutcome::AlreadyGone);
        }
        // SAFETY: plain FFI. The group id of a CREATE_NEW_PROCESS_GROUP
        // child equals its pid.
        match unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(e) if is_invalid_parameter(&e) => Ok(SignalOutcome::AlreadyGone),
            Err(e) => Err(win_err(e)),
        }
    }

    fn kill_group(&self, pid: u32) -> io::Result<SignalOutcome> {
        // No signal reaches a whole console group; walk the tree instead.
        let generations = self.descendants(pid)?;
        for child in generations.iter().rev().flatten() {
            if let Err(e) = terminate(*child) {
                warn!(pid, child, error = %e, "could not terminate descendant");
            }
        }
        terminate(pid)
    }
}
