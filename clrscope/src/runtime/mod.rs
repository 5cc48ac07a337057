//! Runtime directory: which runtimes are installed, which a process hosts,
//! and the capability handles used to request an attach.
//!
//! Two hosts ship with the crate:
//! - [`local::LocalHost`] reads the local install tree and `/proc`
//! - [`loopback::LoopbackHost`] treats the current process as the only target
//!   and loads the event sink in-process

pub mod local;
pub mod loopback;
pub mod memory_maps;
pub mod pe_version;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clrscope_common::{Guid, HResult};

use crate::domain::{Pid, RuntimeError};
use crate::process_lookup::ProcessRef;

/// Transport that asks a runtime inside another process to load a component
pub trait ProfilingAttach: Send + Sync {
    /// Blocks for at most `timeout`
    ///
    /// # Errors
    /// Returns the host status; timeout statuses satisfy `HResult::is_timeout`
    fn attach_profiler(
        &self,
        pid: Pid,
        timeout: Duration,
        component: Guid,
        code_path: &Path,
        client_data: &[u8],
    ) -> Result<(), HResult>;
}

impl<T: ProfilingAttach + ?Sized> ProfilingAttach for Arc<T> {
    fn attach_profiler(
        &self,
        pid: Pid,
        timeout: Duration,
        component: Guid,
        code_path: &Path,
        client_data: &[u8],
    ) -> Result<(), HResult> {
        (**self).attach_profiler(pid, timeout, component, code_path, client_data)
    }
}

/// Capability handle for one runtime version
pub trait RuntimeInfo: Send + Sync {
    fn version(&self) -> &str;

    /// # Errors
    /// Returns the host status when the query itself fails
    fn is_loadable(&self) -> Result<bool, HResult>;

    /// # Errors
    /// Returns the host status when the process cannot be inspected
    fn is_loaded_in(&self, process: &ProcessRef) -> Result<bool, HResult>;

    /// # Errors
    /// `E_NOINTERFACE` when this runtime has no attach support
    fn profiling_interface(&self) -> Result<Box<dyn ProfilingAttach>, HResult>;
}

/// A runtime version and its capability handle, owned by whoever requested it
pub struct RuntimeRef {
    info: Box<dyn RuntimeInfo>,
}

impl RuntimeRef {
    #[must_use]
    pub fn new(info: Box<dyn RuntimeInfo>) -> Self {
        Self { info }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        self.info.version()
    }

    #[must_use]
    pub fn info(&self) -> &dyn RuntimeInfo {
        self.info.as_ref()
    }
}

impl fmt::Debug for RuntimeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRef").field("version", &self.version()).finish_non_exhaustive()
    }
}

/// Enumerates and resolves runtimes
pub trait RuntimeHost: Send + Sync {
    /// Runtimes installed on this machine, queried afresh on every call
    ///
    /// # Errors
    /// Returns an error if the install tree cannot be read
    fn installed_runtimes(&self) -> Result<Vec<RuntimeRef>, RuntimeError>;

    /// Runtimes currently hosted by `process`
    ///
    /// # Errors
    /// `ProcessNotFound` if the handle no longer refers to a live process
    fn loaded_runtimes(&self, process: &ProcessRef) -> Result<Vec<RuntimeRef>, RuntimeError>;

    /// Runtime version a managed executable was built against
    ///
    /// # Errors
    /// `UnrecognizedRuntimeFile` when the file carries no version
    fn version_from_file(&self, path: &Path) -> Result<String, RuntimeError>;

    /// Installed runtime with exactly this version string.
    ///
    /// Matching is exact: `"v4.0.30319"` does not match `"4.0.30319"` and
    /// `"8.0"` does not match `"8.0.4"`.
    ///
    /// # Errors
    /// `RuntimeNotInstalled` when no installed runtime has that version
    fn get_runtime(&self, version: &str) -> Result<RuntimeRef, RuntimeError> {
        self.installed_runtimes()?
            .into_iter()
            .find(|runtime| runtime.version() == version)
            .ok_or_else(|| RuntimeError::RuntimeNotInstalled(version.to_string()))
    }
}

/// Major component of a version string (`"v4.0.30319"` -> 4, `"8.0.4"` -> 8)
#[must_use]
pub fn major_version(version: &str) -> Option<u32> {
    version.trim_start_matches(['v', 'V']).split('.').next()?.parse().ok()
}
