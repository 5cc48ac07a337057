//! Resolve an attach target (PID or process name) to an owned process handle.
//!
//! On Linux the handle is a pidfd, so a `ProcessRef` keeps referring to the
//! same process even if its pid is recycled while the attach is in flight.
//! Kernels without `pidfd_open` fall back to probing `/proc/<pid>`.

#![allow(unsafe_code)] // pidfd syscalls have no safe std wrapper

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use crate::domain::{LocateError, Pid, ProcessTarget};

/// Opaque OS handle kept for the duration of one attach attempt
#[derive(Debug)]
enum ProcessHandle {
    PidFd(OwnedFd),
    Procfs,
}

/// Open process, released (handle closed) on drop
#[derive(Debug)]
pub struct ProcessRef {
    pid: Pid,
    exe_path: Option<PathBuf>,
    command: Option<String>,
    handle: ProcessHandle,
}

impl ProcessRef {
    /// Open a handle to `pid` with the access attach requires.
    ///
    /// Attach needs to read the target's memory maps (to find hosted runtimes),
    /// so a process whose maps are unreadable is reported as `AccessDenied`.
    ///
    /// # Errors
    /// `ProcessNotFound` if the process does not exist, `AccessDenied` if it
    /// cannot be inspected.
    pub fn open(pid: Pid) -> Result<Self, LocateError> {
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.0));
        if !proc_dir.exists() {
            return Err(LocateError::ProcessNotFound(pid));
        }

        let handle = match pidfd_open(pid) {
            Ok(fd) => ProcessHandle::PidFd(fd),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                return Err(LocateError::ProcessNotFound(pid));
            }
            Err(e) => {
                debug!("pidfd_open({}) unavailable ({e}), falling back to /proc probing", pid.0);
                ProcessHandle::Procfs
            }
        };

        match fs::File::open(proc_dir.join("maps")) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(LocateError::AccessDenied(pid));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LocateError::ProcessNotFound(pid));
            }
            Err(e) => return Err(LocateError::Io(e)),
        }

        let exe_path = resolve_exe_path(pid.0).ok();
        let command = fs::read_to_string(proc_dir.join("stat"))
            .ok()
            .and_then(|stat| extract_comm(&stat).ok());

        Ok(Self { pid, exe_path, command, handle })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Executable path from `/proc/<pid>/exe`, if readable
    #[must_use]
    pub fn exe_path(&self) -> Option<&Path> {
        self.exe_path.as_deref()
    }

    /// Command name from `/proc/<pid>/stat`, if readable
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Whether the handle still refers to a running process
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match &self.handle {
            ProcessHandle::PidFd(fd) => pidfd_alive(fd),
            ProcessHandle::Procfs => Path::new(&format!("/proc/{}", self.pid.0)).exists(),
        }
    }
}

/// Resolves a logical target to an open process
pub trait ProcessLocator: Send + Sync {
    /// # Errors
    /// Returns a `LocateError` when the target cannot be resolved or opened
    fn locate(&self, target: &ProcessTarget) -> Result<ProcessRef, LocateError>;
}

/// Locator backed by `/proc`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsLocator;

impl ProcessLocator for ProcfsLocator {
    fn locate(&self, target: &ProcessTarget) -> Result<ProcessRef, LocateError> {
        match target {
            ProcessTarget::Pid(pid) => ProcessRef::open(*pid),
            ProcessTarget::Name(name) => {
                let pid = find_process_by_name(name)?;
                ProcessRef::open(pid)
            }
        }
    }
}

/// Find a process by name.
///
/// Searches `/proc` for processes matching the given name.
/// Matches against the command name from `/proc/<pid>/stat` and
/// the executable basename from `/proc/<pid>/exe`. The calling process is
/// never a candidate.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<Pid, LocateError> {
    let own_pid = std::process::id();
    let mut matches: Vec<Pid> = Vec::new();

    for entry in fs::read_dir("/proc")?.flatten() {
        let file_name = entry.file_name();
        let Ok(pid) = file_name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        // Skip kernel threads and inaccessible processes
        let Ok(exe_path) = resolve_exe_path(pid) else {
            continue;
        };

        let Ok(stat_content) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Ok(command) = extract_comm(&stat_content) else {
            continue;
        };

        if is_match(&command, &exe_path, name) {
            matches.push(Pid(pid));
        }
    }

    match matches.len() {
        0 => Err(LocateError::NoMatch(name.to_string())),
        1 => Ok(matches[0]),
        _ => {
            warn!("{} processes match '{name}', specify the pid explicitly", matches.len());
            Err(LocateError::Ambiguous { name: name.to_string(), candidates: matches })
        }
    }
}

/// Resolve binary path from PID via `/proc/<pid>/exe`.
///
/// # Errors
/// Returns error if the process doesn't exist or `/proc/<pid>/exe` is not readable.
pub fn resolve_exe_path(pid: u32) -> Result<PathBuf> {
    let exe_link = format!("/proc/{pid}/exe");
    fs::read_link(&exe_link).with_context(|| format!("Cannot read {exe_link}"))
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// Check if process matches the search pattern.
///
/// Managed apps are often started through a host executable, so a pattern
/// with a `.exe`/`.dll` suffix also matches the bare command name.
fn is_match(command: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);
    let pattern_stem = pattern_basename
        .strip_suffix(".exe")
        .or_else(|| pattern_basename.strip_suffix(".dll"))
        .unwrap_or(pattern_basename);

    command == pattern_basename
        || command == pattern_stem
        || exe_basename == pattern_basename
        || exe_basename == pattern_stem
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn pidfd_open(pid: Pid) -> io::Result<OwnedFd> {
    // SAFETY: pidfd_open takes no pointers; a non-negative return is a new fd owned by us.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.0 as libc::pid_t, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn pidfd_alive(fd: &OwnedFd) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check; siginfo may be null.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            fd.as_raw_fd(),
            0,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
