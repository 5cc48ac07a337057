//! Events with behavior beyond the default reply.
//!
//! Each handler resolves what names it can and writes one line to the
//! logger. A failed lookup leaves the name empty; it never fails the event.
//! Exceptions, allocations and runtime pauses also feed the session analysis,
//! and unload events evict cached names.

use clrscope_common::{ClassId, FunctionId, ObjectId};

use super::events::{Reply, RuntimeEvent};
use super::EventSink;
use crate::logging::Severity;

/// `None` means the event takes the default path
pub(super) fn handle(sink: &EventSink, event: &RuntimeEvent) -> Option<Reply> {
    match event {
        RuntimeEvent::AssemblyLoadFinished { assembly, status } => {
            if !status.is_success() {
                sink.log(Severity::Warning, || {
                    format!("Assembly {assembly} failed to load ({status})")
                });
            } else if let Some(name) =
                sink.info().and_then(|info| info.assembly_name(*assembly).ok())
            {
                sink.log(Severity::Info, || format!("Assembly loaded: {name} (id={assembly})"));
            }
        }
        RuntimeEvent::ModuleUnloadFinished { module, .. } => {
            sink.services.resolver.forget_module(*module);
            sink.log(Severity::Verbose, || format!("Module {module} unloaded"));
        }
        RuntimeEvent::ClassLoadFinished { class, status } => {
            let name = class_name(sink, *class);
            if status.is_success() {
                sink.log(Severity::Info, || format!("Type '{name}' loaded"));
            } else {
                sink.log(Severity::Warning, || {
                    format!("Type '{name}' failed to load ({status})")
                });
            }
        }
        RuntimeEvent::FunctionUnloadStarted { function }
        | RuntimeEvent::DynamicMethodUnloaded { function } => {
            let name = function_name(sink, *function);
            sink.services.resolver.forget_function(*function);
            sink.log(Severity::Verbose, || format!("Function {function} unloaded: {name}"));
        }
        RuntimeEvent::JitCompilationStarted { function, .. } => {
            let name = function_name(sink, *function);
            sink.log(Severity::Info, || format!("JIT compilation started: {name}"));
        }
        RuntimeEvent::JitCompilationFinished { function, status, .. } => {
            let name = function_name(sink, *function);
            if status.is_success() {
                sink.log(Severity::Info, || format!("JIT compilation finished: {name}"));
            } else {
                sink.log(Severity::Warning, || {
                    format!("JIT compilation failed: {name} ({status})")
                });
            }
        }
        RuntimeEvent::ThreadCreated { thread } => {
            sink.log(Severity::Info, || format!("Thread {thread} created"));
        }
        RuntimeEvent::ThreadDestroyed { thread } => {
            // Delivered on the dying thread
            let frames = sink.tracker.forget_current_thread();
            if frames > 0 {
                sink.log(Severity::Warning, || {
                    format!("Thread {thread} destroyed inside {frames} exception frames")
                });
            }
            sink.log(Severity::Info, || format!("Thread {thread} destroyed"));
        }
        RuntimeEvent::ThreadAssignedToOsThread { thread, os_thread } => {
            sink.log(Severity::Info, || {
                format!("Thread {thread} assigned to OS thread {os_thread}")
            });
        }
        RuntimeEvent::ThreadNameChanged { thread, name } => {
            sink.log(Severity::Info, || format!("Thread {thread} renamed to '{name}'"));
        }
        RuntimeEvent::ExceptionThrown { object } => {
            let name = object_class_name(sink, *object);
            sink.analysis.record_exception(&name);
            sink.log(Severity::Info, || format!("Exception {name} thrown"));
        }
        RuntimeEvent::ExceptionSearchFunctionEnter { function } => {
            let name = function_name(sink, *function);
            sink.log(Severity::Info, || format!("Exception search entered {name}"));
        }
        RuntimeEvent::ExceptionCatcherLeave => {
            sink.log(Severity::Info, || "Exception catcher left".to_string());
        }
        RuntimeEvent::ExceptionClrCatcherExecute => {
            sink.log(Severity::Info, || "Exception caught by the runtime".to_string());
        }
        RuntimeEvent::RuntimeSuspendStarted { reason } => {
            sink.analysis.suspend_started();
            sink.log(Severity::Verbose, || format!("Runtime suspend started ({reason})"));
        }
        RuntimeEvent::RuntimeSuspendAborted => {
            sink.analysis.suspend_aborted();
            sink.log(Severity::Verbose, || "Runtime suspend aborted".to_string());
        }
        RuntimeEvent::RuntimeResumeStarted => {
            if let Some(pause) = sink.analysis.resume_started() {
                sink.log(Severity::Verbose, || {
                    format!("Runtime resumed after {}us", pause.as_micros())
                });
            }
        }
        RuntimeEvent::GarbageCollectionStarted { generations, reason } => {
            let collected =
                |n: usize| if generations.get(n).copied().unwrap_or(false) { "Yes" } else { "No" };
            sink.log(Severity::Info, || {
                format!(
                    "GC started. Gen0={}, Gen1={}, Gen2={} (reason: {reason})",
                    collected(0),
                    collected(1),
                    collected(2)
                )
            });
        }
        RuntimeEvent::GarbageCollectionFinished => {
            sink.log(Severity::Info, || "GC finished".to_string());
        }
        RuntimeEvent::ObjectAllocated { object, class } => {
            let name = class_name(sink, *class);
            sink.analysis.record_allocations(&name, 1);
            if !name.is_empty() {
                sink.log(Severity::Info, || format!("Allocated object {object} of type {name}"));
            }
        }
        RuntimeEvent::ObjectsAllocatedByClass { counts } => {
            for count in counts {
                let name = class_name(sink, count.class);
                sink.analysis.record_allocations(&name, u64::from(count.objects));
            }
            sink.log(Severity::Verbose, || {
                format!("Allocation counts for {} classes", counts.len())
            });
        }
        RuntimeEvent::UnmanagedToManagedTransition { function, reason }
        | RuntimeEvent::ManagedToUnmanagedTransition { function, reason } => {
            sink.log(Severity::Verbose, || format!("{} {function} ({reason})", event.kind()));
        }
        RuntimeEvent::ProfilerAttachComplete => {
            sink.log(Severity::Info, || "Profiler attach complete".to_string());
            if let Some(delay) = sink.services.config.detach_after {
                sink.schedule_detach(delay);
            }
        }
        RuntimeEvent::ProfilerDetachSucceeded => {
            sink.log(Severity::Info, || "Profiler detach succeeded".to_string());
        }
        _ => return None,
    }
    Some(Reply::Ack)
}

/// class -> (module, token) through the host, then the resolver
fn class_name(sink: &EventSink, class: ClassId) -> String {
    let Some(info) = sink.info() else {
        return String::new();
    };
    match info.class_id_info(class) {
        Ok((module, token)) => sink.services.resolver.type_name(module, token),
        Err(_) => String::new(),
    }
}

fn object_class_name(sink: &EventSink, object: ObjectId) -> String {
    match sink.info().map(|info| info.class_from_object(object)) {
        Some(Ok(class)) => class_name(sink, class),
        _ => String::new(),
    }
}

fn function_name(sink: &EventSink, function: FunctionId) -> String {
    sink.services.resolver.function_name(function)
}
