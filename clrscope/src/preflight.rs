//! Pre-flight checks for clrscope
//!
//! Validates an attach request against the local system before negotiation
//! starts. Provides clear, actionable error messages when requirements
//! aren't met; soft problems are printed as warnings and do not stop the
//! attach.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Object, ObjectKind};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::domain::Pid;

/// Run all pre-flight checks for attaching `component_path` to `pid`
///
/// # Errors
/// Returns the first hard failure: missing component, missing process, or
/// unreadable `/proc` entry
pub fn run_preflight_checks(component_path: &Path, pid: Pid, quiet: bool) -> Result<()> {
    check_component_exists(component_path)?;
    check_component_format(component_path, quiet)?;
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    check_same_user(pid, quiet)?;
    Ok(())
}

/// Check if the component library exists and is a regular file
fn check_component_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "Component not found: {}\n\n\
             --path must point to the event sink library the runtime should load.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --path must point to a shared library, not a directory.",
            path.display()
        );
    }
    Ok(())
}

/// Warn when the component does not look like a loadable shared library
fn check_component_format(path: &Path, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let file_data = std::fs::read(path)
        .with_context(|| format!("Failed to read component: {}", path.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        eprintln!(
            "warning: {} is not an object file, the runtime will refuse to load it",
            path.display()
        );
        return Ok(());
    };

    if obj.kind() != ObjectKind::Dynamic {
        eprintln!("warning: {} is not a shared library ({:?})", path.display(), obj.kind());
    }

    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Fails when `/proc/<pid>` is missing
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Fails when `/proc/<pid>/maps` cannot be read
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (run as the process owner)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}

/// Runtimes only accept attach requests from the user that owns the process
fn check_same_user(pid: Pid, quiet: bool) -> Result<()> {
    let owner = std::fs::metadata(format!("/proc/{}", pid.0))
        .with_context(|| format!("Failed to stat /proc/{}", pid.0))?
        .uid();
    let euid = unsafe { libc::geteuid() };

    if euid != 0 && euid != owner && !quiet {
        eprintln!(
            "warning: process {pid} belongs to uid {owner}, \
             the runtime will likely reject the attach"
        );
    }
    Ok(())
}
