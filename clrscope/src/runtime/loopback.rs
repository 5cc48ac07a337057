//! In-process runtime host.
//!
//! The current process is the only attach target. Attaching runs the same
//! sequence a runtime runs when it loads a component: class factory, instance,
//! `initialize_for_attach`, then `ProfilerAttachComplete`. The loaded sink is
//! kept by the host until [`LoopbackHost::take_sink`] hands it out, so recorded
//! events can be replayed into it. A sink that finishes loading after the
//! caller gave up is shut down and released on the loader thread.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, SendError};
use log::{debug, info, warn};
use serde::Deserialize;

use clrscope_common::{
    iid, AssemblyId, ClassId, EventInterest, FunctionId, Guid, HResult, ModuleId, ObjectId,
    TypeToken,
};

use super::{pe_version, ProfilingAttach, RuntimeHost, RuntimeInfo, RuntimeRef};
use crate::domain::{Pid, RuntimeError};
use crate::naming::NameResolver;
use crate::process_lookup::ProcessRef;
use crate::sink::events::RuntimeEvent;
use crate::sink::factory::get_class_object;
use crate::sink::host::{HostInfoProvider, ProfilerInfo};
use crate::sink::{InterfaceRef, SinkServices};

/// Version string the loopback host reports for its single runtime
pub const LOOPBACK_VERSION: &str = "v4.0.30319";

// ============================================================================
// Metadata
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ClassEntry {
    pub id: ClassId,
    pub module: ModuleId,
    pub token: TypeToken,
    /// Empty when the type's name should fail to resolve
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionEntry {
    pub id: FunctionId,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntry {
    pub id: ObjectId,
    pub class: ClassId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyEntry {
    pub id: AssemblyId,
    pub name: String,
}

/// Subject tables the loopback host answers lookups from
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceMetadata {
    pub classes: Vec<ClassEntry>,
    pub functions: Vec<FunctionEntry>,
    pub objects: Vec<ObjectEntry>,
    pub assemblies: Vec<AssemblyEntry>,
}

/// Info capability and name resolver backed by [`TraceMetadata`]
#[derive(Debug, Default)]
pub struct LoopbackInfo {
    classes: HashMap<ClassId, (ModuleId, TypeToken)>,
    type_names: HashMap<(ModuleId, TypeToken), String>,
    functions: HashMap<FunctionId, String>,
    objects: HashMap<ObjectId, ClassId>,
    assemblies: HashMap<AssemblyId, String>,
    masks: Mutex<Vec<EventInterest>>,
    detach_requested: AtomicBool,
}

impl LoopbackInfo {
    #[must_use]
    pub fn new(metadata: TraceMetadata) -> Self {
        let mut info = Self::default();
        for class in metadata.classes {
            info.classes.insert(class.id, (class.module, class.token));
            if !class.name.is_empty() {
                info.type_names.insert((class.module, class.token), class.name);
            }
        }
        info.functions = metadata.functions.into_iter().map(|f| (f.id, f.name)).collect();
        info.objects = metadata.objects.into_iter().map(|o| (o.id, o.class)).collect();
        info.assemblies = metadata.assemblies.into_iter().map(|a| (a.id, a.name)).collect();
        info
    }

    /// Every interest mask the sink has written, oldest first
    #[must_use]
    pub fn masks(&self) -> Vec<EventInterest> {
        self.masks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn detach_requested(&self) -> bool {
        self.detach_requested.load(Ordering::Acquire)
    }
}

impl ProfilerInfo for LoopbackInfo {
    fn set_event_mask(&self, mask: EventInterest) -> Result<(), HResult> {
        if !EventInterest::ALLOWABLE_AFTER_ATTACH.contains(mask) {
            return Err(HResult::E_INVALIDARG);
        }
        self.masks.lock().unwrap_or_else(PoisonError::into_inner).push(mask);
        Ok(())
    }

    fn class_id_info(&self, class: ClassId) -> Result<(ModuleId, TypeToken), HResult> {
        self.classes.get(&class).copied().ok_or(HResult::E_INVALIDARG)
    }

    fn class_from_object(&self, object: ObjectId) -> Result<ClassId, HResult> {
        self.objects.get(&object).copied().ok_or(HResult::E_INVALIDARG)
    }

    fn assembly_name(&self, assembly: AssemblyId) -> Result<String, HResult> {
        self.assemblies.get(&assembly).cloned().ok_or(HResult::E_INVALIDARG)
    }

    fn request_detach(&self, expected_completion: Duration) -> Result<(), HResult> {
        debug!("Detach requested, expected within {}ms", expected_completion.as_millis());
        self.detach_requested.store(true, Ordering::Release);
        Ok(())
    }
}

impl NameResolver for LoopbackInfo {
    fn type_name(&self, module: ModuleId, token: TypeToken) -> String {
        self.type_names.get(&(module, token)).cloned().unwrap_or_default()
    }

    fn function_name(&self, function: FunctionId) -> String {
        self.functions.get(&function).cloned().unwrap_or_default()
    }
}

impl HostInfoProvider for Arc<LoopbackInfo> {
    fn query_info(&self, iid: Guid) -> Result<Arc<dyn ProfilerInfo>, HResult> {
        if iid == iid::PROFILER_INFO_3 || iid == iid::PROFILER_INFO {
            Ok(Arc::clone(self) as Arc<dyn ProfilerInfo>)
        } else {
            Err(HResult::E_NOINTERFACE)
        }
    }
}

// ============================================================================
// Host
// ============================================================================

#[derive(Clone)]
struct Shared {
    info: Arc<LoopbackInfo>,
    services: SinkServices,
    load_delay: Duration,
    loaded: Arc<Mutex<Option<InterfaceRef>>>,
}

pub struct LoopbackHost {
    shared: Shared,
}

impl LoopbackHost {
    #[must_use]
    pub fn new(info: Arc<LoopbackInfo>, services: SinkServices) -> Self {
        Self {
            shared: Shared {
                info,
                services,
                load_delay: Duration::ZERO,
                loaded: Arc::new(Mutex::new(None)),
            },
        }
    }

    /// Delay between receiving an attach and loading the sink, to model a
    /// target that is slow to respond
    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.shared.load_delay = delay;
        self
    }

    #[must_use]
    pub fn info(&self) -> &Arc<LoopbackInfo> {
        &self.shared.info
    }

    /// The sink loaded by the last successful attach
    #[must_use]
    pub fn take_sink(&self) -> Option<InterfaceRef> {
        self.shared.loaded.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Whether a sink is waiting for [`take_sink`](Self::take_sink)
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.shared.loaded.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn runtime(&self) -> RuntimeRef {
        RuntimeRef::new(Box::new(LoopbackRuntime { shared: self.shared.clone() }))
    }
}

impl RuntimeHost for LoopbackHost {
    fn installed_runtimes(&self) -> Result<Vec<RuntimeRef>, RuntimeError> {
        Ok(vec![self.runtime()])
    }

    fn loaded_runtimes(&self, process: &ProcessRef) -> Result<Vec<RuntimeRef>, RuntimeError> {
        if !process.is_alive() {
            return Err(RuntimeError::ProcessNotFound(process.pid()));
        }
        if process.pid() == Pid::current() {
            Ok(vec![self.runtime()])
        } else {
            Ok(Vec::new())
        }
    }

    fn version_from_file(&self, path: &Path) -> Result<String, RuntimeError> {
        pe_version::runtime_version(path)
    }
}

struct LoopbackRuntime {
    shared: Shared,
}

impl RuntimeInfo for LoopbackRuntime {
    fn version(&self) -> &str {
        LOOPBACK_VERSION
    }

    fn is_loadable(&self) -> Result<bool, HResult> {
        Ok(true)
    }

    fn is_loaded_in(&self, process: &ProcessRef) -> Result<bool, HResult> {
        Ok(process.pid() == Pid::current())
    }

    fn profiling_interface(&self) -> Result<Box<dyn ProfilingAttach>, HResult> {
        Ok(Box::new(LoopbackAttach { shared: self.shared.clone() }))
    }
}

struct LoopbackAttach {
    shared: Shared,
}

impl ProfilingAttach for LoopbackAttach {
    fn attach_profiler(
        &self,
        pid: Pid,
        timeout: Duration,
        component: Guid,
        code_path: &Path,
        client_data: &[u8],
    ) -> Result<(), HResult> {
        if pid != Pid::current() {
            return Err(HResult::ERROR_NOT_FOUND);
        }
        if !code_path.is_file() {
            return Err(HResult::E_INVALIDARG);
        }

        // Rendezvous: a send either reaches a waiting caller or hands the
        // sink back once the caller has timed out
        let (tx, rx) = bounded(0);
        let shared = self.shared.clone();
        let client_data = client_data.to_vec();
        thread::Builder::new()
            .name("clrscope-loopback".to_string())
            .spawn(move || {
                let loaded = load_sink(&shared, component, &client_data);
                if let Err(SendError(Ok(sink))) = tx.send(loaded) {
                    warn!("Event sink finished loading after the attach timed out, unloading it");
                    retire(sink);
                }
            })
            .map_err(|_| HResult::E_FAIL)?;

        match rx.recv_timeout(timeout) {
            Ok(loaded) => {
                let sink = loaded?;
                info!("Event sink loaded into process {}", Pid::current());
                let displaced =
                    self.shared.loaded.lock().unwrap_or_else(PoisonError::into_inner).replace(sink);
                if let Some(previous) = displaced {
                    debug!("Replacing the sink of an earlier attach");
                    retire(previous);
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("Loopback attach did not finish within {}ms", timeout.as_millis());
                Err(HResult::ERROR_TIMEOUT)
            }
            Err(RecvTimeoutError::Disconnected) => Err(HResult::E_UNEXPECTED),
        }
    }
}

/// What the runtime does on the target side of an attach: create through
/// the oldest attach-capable interface, then move to the newest one
fn load_sink(
    shared: &Shared,
    component: Guid,
    client_data: &[u8],
) -> Result<InterfaceRef, HResult> {
    thread::sleep(shared.load_delay);

    let factory = get_class_object(component, iid::CLASS_FACTORY, shared.services.clone())?;
    let created = factory.create_instance(iid::CALLBACK_3).map_err(|e| e.status())?;
    let sink = match created.sink().query_interface(iid::CALLBACK_9) {
        Ok(latest) => {
            created.release().map_err(|e| e.status())?;
            latest
        }
        Err(_) => created,
    };
    sink.initialize_for_attach(&shared.info, client_data).map_err(|e| e.status())?;
    sink.dispatch(&RuntimeEvent::ProfilerAttachComplete).map_err(|e| e.status())?;
    Ok(sink)
}

fn retire(sink: InterfaceRef) {
    if let Err(e) = sink.shutdown() {
        debug!("Shutdown of a retired sink failed: {e}");
    }
    if let Err(e) = sink.release() {
        debug!("Release of a retired sink failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;
    use clrscope_common::SINK_COMPONENT_ID;
    use std::time::Instant;

    fn host() -> (LoopbackHost, Arc<MemoryLogger>) {
        let info = Arc::new(LoopbackInfo::new(TraceMetadata::default()));
        let logger = Arc::new(MemoryLogger::new());
        let services = SinkServices::new(logger.clone(), info.clone());
        (LoopbackHost::new(info, services), logger)
    }

    fn attach(host: &LoopbackHost, pid: Pid, timeout: Duration) -> Result<(), HResult> {
        let runtime = host.get_runtime(LOOPBACK_VERSION).unwrap();
        let transport = runtime.info().profiling_interface().unwrap();
        let code = std::env::current_exe().unwrap();
        transport.attach_profiler(pid, timeout, SINK_COMPONENT_ID, &code, b"")
    }

    #[test]
    fn test_metadata_lookups() {
        let metadata: TraceMetadata = serde_json::from_str(
            r#"{
                "classes": [{"id": 100, "module": 1, "token": 33554433, "name": "System.String"},
                            {"id": 101, "module": 1, "token": 33554434}],
                "functions": [{"id": 7, "name": "Program::Main"}],
                "objects": [{"id": 4096, "class": 100}]
            }"#,
        )
        .unwrap();
        let info = LoopbackInfo::new(metadata);

        assert_eq!(info.class_id_info(ClassId(100)), Ok((ModuleId(1), TypeToken(0x0200_0001))));
        assert_eq!(info.type_name(ModuleId(1), TypeToken(0x0200_0001)), "System.String");
        assert_eq!(info.type_name(ModuleId(1), TypeToken(0x0200_0002)), "");
        assert_eq!(info.function_name(FunctionId(7)), "Program::Main");
        assert_eq!(info.class_from_object(ObjectId(4096)), Ok(ClassId(100)));
        assert_eq!(info.assembly_name(AssemblyId(1)), Err(HResult::E_INVALIDARG));
    }

    #[test]
    fn test_attach_loads_sink() {
        let (host, logger) = host();
        attach(&host, Pid::current(), Duration::from_secs(5)).unwrap();

        let sink = host.take_sink().unwrap();
        assert_eq!(sink.ref_count(), 1);
        assert_eq!(sink.state(), crate::domain::LifecycleState::Attached);
        assert_eq!(host.info().masks().len(), 1);
        assert!(logger.contains("Profiler attach complete"));
        assert!(host.take_sink().is_none());
    }

    #[test]
    fn test_attach_other_process() {
        let (host, _) = host();
        assert_eq!(attach(&host, Pid(1), Duration::from_secs(1)), Err(HResult::ERROR_NOT_FOUND));
    }

    #[test]
    fn test_slow_target_times_out() {
        let (host, _) = host();
        let host = host.with_load_delay(Duration::from_millis(500));
        let result = attach(&host, Pid::current(), Duration::from_millis(20));
        assert_eq!(result, Err(HResult::ERROR_TIMEOUT));
    }

    #[test]
    fn test_attach_moves_to_newest_interface() {
        let (host, _) = host();
        attach(&host, Pid::current(), Duration::from_secs(5)).unwrap();

        let sink = host.take_sink().unwrap();
        assert_eq!(sink.iid(), iid::CALLBACK_9);
        assert_eq!(sink.sink().interface_version(), 9);
    }

    #[test]
    fn test_late_completion_is_unloaded() {
        let (host, logger) = host();
        let host = host.with_load_delay(Duration::from_millis(100));
        let result = attach(&host, Pid::current(), Duration::from_millis(10));
        assert_eq!(result, Err(HResult::ERROR_TIMEOUT));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !logger.contains("Profiler shutdown") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(logger.contains("Profiler attach complete"));
        assert!(logger.contains("Profiler shutdown"));
        assert!(!host.has_sink());
    }

    #[test]
    fn test_second_attach_retires_the_first_sink() {
        let (host, logger) = host();
        attach(&host, Pid::current(), Duration::from_secs(5)).unwrap();
        assert!(!logger.contains("Profiler shutdown"));

        attach(&host, Pid::current(), Duration::from_secs(5)).unwrap();
        assert!(logger.contains("Profiler shutdown"));

        let sink = host.take_sink().unwrap();
        assert_eq!(sink.state(), crate::domain::LifecycleState::Attached);
        assert_eq!(sink.ref_count(), 1);
    }

    #[test]
    fn test_detach_request_is_recorded() {
        let info = LoopbackInfo::default();
        assert!(!info.detach_requested());
        assert_eq!(info.request_detach(Duration::from_millis(3000)), Ok(()));
        assert!(info.detach_requested());
    }

    #[test]
    fn test_allocation_mask_is_rejected() {
        let info = LoopbackInfo::default();
        assert_eq!(info.set_event_mask(EventInterest::startup(true)), Err(HResult::E_INVALIDARG));
        assert!(info.masks().is_empty());
    }
}
