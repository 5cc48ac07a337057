//! Runtime directory backed by the local install tree and `/proc`.
//!
//! Installed runtimes live under `<root>/shared/Microsoft.NETCore.App/<version>/`.
//! A process hosts a runtime when that runtime's `libcoreclr.so` is mapped
//! into it.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clrscope_common::HResult;
use log::{debug, warn};

use super::memory_maps::{find_mapped_library, parse_mapped_library};
use super::{major_version, pe_version, ProfilingAttach, RuntimeHost, RuntimeInfo, RuntimeRef};
use crate::domain::RuntimeError;
use crate::process_lookup::ProcessRef;

/// Core runtime library; its presence makes a runtime loadable
pub const CORE_LIBRARY: &str = "libcoreclr.so";

const FRAMEWORK_DIR: &str = "shared/Microsoft.NETCore.App";
const DEFAULT_ROOTS: &[&str] = &["/usr/share/dotnet", "/usr/lib/dotnet"];

/// First major version whose runtime accepts a late attach
const MIN_ATTACH_MAJOR: u32 = 3;

pub struct LocalHost {
    root: PathBuf,
    attach: Option<Arc<dyn ProfilingAttach>>,
}

impl LocalHost {
    /// Host rooted at `DOTNET_ROOT`, or the first default install root that exists
    #[must_use]
    pub fn discover() -> Self {
        let root = std::env::var_os("DOTNET_ROOT")
            .map(PathBuf::from)
            .or_else(|| DEFAULT_ROOTS.iter().map(PathBuf::from).find(|p| p.is_dir()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOTS[0]));
        debug!("Using runtime install root {}", root.display());
        Self::with_root(root)
    }

    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), attach: None }
    }

    /// Transport handed out by every attach-capable runtime of this host
    #[must_use]
    pub fn with_attach(mut self, attach: Arc<dyn ProfilingAttach>) -> Self {
        self.attach = Some(attach);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runtime(&self, version: String, dir: PathBuf) -> RuntimeRef {
        RuntimeRef::new(Box::new(LocalRuntime { version, dir, attach: self.attach.clone() }))
    }
}

impl RuntimeHost for LocalHost {
    fn installed_runtimes(&self) -> Result<Vec<RuntimeRef>, RuntimeError> {
        let framework = self.root.join(FRAMEWORK_DIR);
        let entries = match fs::read_dir(&framework) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No runtimes installed under {}", framework.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut runtimes: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| Some((entry.file_name().into_string().ok()?, entry.path())))
            .collect();
        runtimes.sort();

        Ok(runtimes.into_iter().map(|(version, dir)| self.runtime(version, dir)).collect())
    }

    fn loaded_runtimes(&self, process: &ProcessRef) -> Result<Vec<RuntimeRef>, RuntimeError> {
        if !process.is_alive() {
            return Err(RuntimeError::ProcessNotFound(process.pid()));
        }

        let maps = match fs::read_to_string(format!("/proc/{}/maps", process.pid().0)) {
            Ok(maps) => maps,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RuntimeError::ProcessNotFound(process.pid()));
            }
            Err(e) => return Err(e.into()),
        };
        let libraries = parse_mapped_library(&maps, CORE_LIBRARY)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(libraries
            .into_iter()
            .filter_map(|lib| {
                let dir = lib.path.parent()?.to_path_buf();
                let version = dir.file_name()?.to_str()?.to_string();
                Some(self.runtime(version, dir))
            })
            .collect())
    }

    fn version_from_file(&self, path: &Path) -> Result<String, RuntimeError> {
        pe_version::runtime_version(path)
    }
}

struct LocalRuntime {
    version: String,
    dir: PathBuf,
    attach: Option<Arc<dyn ProfilingAttach>>,
}

impl RuntimeInfo for LocalRuntime {
    fn version(&self) -> &str {
        &self.version
    }

    fn is_loadable(&self) -> Result<bool, HResult> {
        Ok(self.dir.join(CORE_LIBRARY).is_file())
    }

    fn is_loaded_in(&self, process: &ProcessRef) -> Result<bool, HResult> {
        if !process.is_alive() {
            return Err(HResult::ERROR_NOT_FOUND);
        }
        let libraries = find_mapped_library(process.pid().0, CORE_LIBRARY).map_err(|e| {
            warn!("Cannot inspect runtimes of {}: {e:#}", process.pid());
            HResult::E_ACCESSDENIED
        })?;
        let version = OsStr::new(&self.version);
        Ok(libraries.iter().any(|lib| lib.path.parent().and_then(Path::file_name) == Some(version)))
    }

    fn profiling_interface(&self) -> Result<Box<dyn ProfilingAttach>, HResult> {
        match major_version(&self.version) {
            Some(major) if major >= MIN_ATTACH_MAJOR => {}
            _ => return Err(HResult::E_NOINTERFACE),
        }
        match &self.attach {
            Some(attach) => Ok(Box::new(Arc::clone(attach))),
            None => Err(HResult::E_NOTIMPL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use clrscope_common::Guid;
    use std::time::Duration;

    struct NeverAttach;

    impl ProfilingAttach for NeverAttach {
        fn attach_profiler(
            &self,
            _: Pid,
            _: Duration,
            _: Guid,
            _: &Path,
            _: &[u8],
        ) -> Result<(), HResult> {
            Err(HResult::E_FAIL)
        }
    }

    fn install(root: &Path, version: &str, with_library: bool) {
        let dir = root.join(FRAMEWORK_DIR).join(version);
        fs::create_dir_all(&dir).unwrap();
        if with_library {
            fs::write(dir.join(CORE_LIBRARY), b"\x7fELF").unwrap();
        }
    }

    #[test]
    fn test_installed_runtimes() {
        let root = tempfile::tempdir().unwrap();
        install(root.path(), "8.0.4", true);
        install(root.path(), "6.0.25", false);

        let host = LocalHost::with_root(root.path());
        let runtimes = host.installed_runtimes().unwrap();
        let versions: Vec<&str> = runtimes.iter().map(RuntimeRef::version).collect();
        assert_eq!(versions, vec!["6.0.25", "8.0.4"]);

        assert_eq!(runtimes[0].info().is_loadable(), Ok(false));
        assert_eq!(runtimes[1].info().is_loadable(), Ok(true));
    }

    #[test]
    fn test_empty_install_root() {
        let root = tempfile::tempdir().unwrap();
        let host = LocalHost::with_root(root.path());
        assert!(host.installed_runtimes().unwrap().is_empty());
    }

    #[test]
    fn test_get_runtime_is_exact() {
        let root = tempfile::tempdir().unwrap();
        install(root.path(), "8.0.4", true);
        let host = LocalHost::with_root(root.path());

        assert_eq!(host.get_runtime("8.0.4").unwrap().version(), "8.0.4");
        for near_miss in ["8.0", "v8.0.4", "8.0.4 ", "8"] {
            assert!(matches!(
                host.get_runtime(near_miss),
                Err(RuntimeError::RuntimeNotInstalled(v)) if v == near_miss
            ));
        }
    }

    #[test]
    fn test_attach_capability_by_version() {
        let root = tempfile::tempdir().unwrap();
        install(root.path(), "2.1.30", true);
        install(root.path(), "8.0.4", true);

        let bare = LocalHost::with_root(root.path());
        let old = bare.get_runtime("2.1.30").unwrap();
        assert!(matches!(old.info().profiling_interface(), Err(HResult::E_NOINTERFACE)));
        let new = bare.get_runtime("8.0.4").unwrap();
        assert!(matches!(new.info().profiling_interface(), Err(HResult::E_NOTIMPL)));

        let wired = LocalHost::with_root(root.path()).with_attach(Arc::new(NeverAttach));
        assert!(wired.get_runtime("8.0.4").unwrap().info().profiling_interface().is_ok());
    }

    #[test]
    fn test_current_process_hosts_no_runtime() {
        let root = tempfile::tempdir().unwrap();
        install(root.path(), "8.0.4", true);
        let host = LocalHost::with_root(root.path());
        let me = ProcessRef::open(Pid::current()).unwrap();

        assert!(host.loaded_runtimes(&me).unwrap().is_empty());
        let runtime = host.get_runtime("8.0.4").unwrap();
        assert_eq!(runtime.info().is_loaded_in(&me), Ok(false));
    }
}
