//! Runtime events delivered to the sink.
//!
//! One variant per callback of the `ICorProfilerCallback`..`ICorProfilerCallback9`
//! surface. `EventKind` is the field-less discriminant, so the whole surface can
//! be enumerated (`EventKind::iter()`) without constructing events.
//!
//! Variants are serde-tagged by `"event"` so recorded traces read like
//! `{"event": "class_load_finished", "class": 4096, "status": 0}`.

use std::fmt;

use clrscope_common::{
    AppDomainId, AssemblyId, ClassId, FunctionId, GcHandleId, Guid, HResult, MethodToken,
    ModuleId, ObjectId, OsThreadId, ReJitId, ThreadId,
};
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, EnumIter, IntoStaticStr};

// ============================================================================
// Payload types
// ============================================================================

/// Why the runtime crossed a managed/unmanaged boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Call,
    Return,
}

/// Why the runtime is suspending managed threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    Other,
    Gc,
    AppDomainShutdown,
    CodePitching,
    Shutdown,
    InprocDebugger,
    GcPrep,
    ProfilerRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum GcReason {
    Induced,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSearchResult {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    Stack,
    Finalizer,
    Handle,
    Other,
}

/// Contiguous block of objects the GC relocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedRange {
    pub old_start: ObjectId,
    pub new_start: ObjectId,
    pub length: u64,
}

/// Contiguous block of objects that survived a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRange {
    pub start: ObjectId,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootReference {
    pub object: ObjectId,
    pub kind: RootKind,
    pub flags: u32,
    pub root_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassAllocationCount {
    pub class: ClassId,
    pub objects: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeakTableEntry {
    pub key: ObjectId,
    pub value: ObjectId,
    pub handle: GcHandleId,
}

fn default_safe_to_block() -> bool {
    true
}

// ============================================================================
// Events
// ============================================================================

/// A single callback from the runtime host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[serde(tag = "event", rename_all = "snake_case")]
#[strum_discriminants(name(EventKind))]
#[strum_discriminants(derive(Hash, EnumIter, IntoStaticStr, strum::Display, strum::EnumCount))]
pub enum RuntimeEvent {
    // Application domains
    AppDomainCreationStarted { domain: AppDomainId },
    AppDomainCreationFinished { domain: AppDomainId, status: HResult },
    AppDomainShutdownStarted { domain: AppDomainId },
    AppDomainShutdownFinished { domain: AppDomainId, status: HResult },

    // Assemblies, modules, classes
    AssemblyLoadStarted { assembly: AssemblyId },
    AssemblyLoadFinished { assembly: AssemblyId, status: HResult },
    AssemblyUnloadStarted { assembly: AssemblyId },
    AssemblyUnloadFinished { assembly: AssemblyId, status: HResult },
    ModuleLoadStarted { module: ModuleId },
    ModuleLoadFinished { module: ModuleId, status: HResult },
    ModuleUnloadStarted { module: ModuleId },
    ModuleUnloadFinished { module: ModuleId, status: HResult },
    ModuleAttachedToAssembly { module: ModuleId, assembly: AssemblyId },
    ClassLoadStarted { class: ClassId },
    ClassLoadFinished { class: ClassId, status: HResult },
    ClassUnloadStarted { class: ClassId },
    ClassUnloadFinished { class: ClassId, status: HResult },
    FunctionUnloadStarted { function: FunctionId },

    // JIT
    JitCompilationStarted {
        function: FunctionId,
        #[serde(default = "default_safe_to_block")]
        is_safe_to_block: bool,
    },
    JitCompilationFinished {
        function: FunctionId,
        status: HResult,
        #[serde(default = "default_safe_to_block")]
        is_safe_to_block: bool,
    },
    JitCachedFunctionSearchStarted { function: FunctionId },
    JitCachedFunctionSearchFinished { function: FunctionId, result: CacheSearchResult },
    JitFunctionPitched { function: FunctionId },
    JitInlining { caller: FunctionId, callee: FunctionId },

    // Threads
    ThreadCreated { thread: ThreadId },
    ThreadDestroyed { thread: ThreadId },
    ThreadAssignedToOsThread { thread: ThreadId, os_thread: OsThreadId },

    // Remoting
    RemotingClientInvocationStarted,
    RemotingClientSendingMessage { cookie: Guid, is_async: bool },
    RemotingClientReceivingReply { cookie: Guid, is_async: bool },
    RemotingClientInvocationFinished,
    RemotingServerReceivingMessage { cookie: Guid, is_async: bool },
    RemotingServerInvocationStarted,
    RemotingServerInvocationReturned,
    RemotingServerSendingReply { cookie: Guid, is_async: bool },

    // Transitions
    UnmanagedToManagedTransition { function: FunctionId, reason: TransitionReason },
    ManagedToUnmanagedTransition { function: FunctionId, reason: TransitionReason },

    // Suspension
    RuntimeSuspendStarted { reason: SuspendReason },
    RuntimeSuspendFinished,
    RuntimeSuspendAborted,
    RuntimeResumeStarted,
    RuntimeResumeFinished,
    RuntimeThreadSuspended { thread: ThreadId },
    RuntimeThreadResumed { thread: ThreadId },

    // Heap
    MovedReferences { ranges: Vec<MovedRange> },
    ObjectAllocated { object: ObjectId, class: ClassId },
    ObjectsAllocatedByClass { counts: Vec<ClassAllocationCount> },
    ObjectReferences { object: ObjectId, class: ClassId, references: Vec<ObjectId> },
    RootReferences { roots: Vec<ObjectId> },

    // Exceptions
    ExceptionThrown { object: ObjectId },
    ExceptionSearchFunctionEnter { function: FunctionId },
    ExceptionSearchFunctionLeave,
    ExceptionSearchFilterEnter { function: FunctionId },
    ExceptionSearchFilterLeave,
    ExceptionSearchCatcherFound { function: FunctionId },
    ExceptionOsHandlerEnter { function: FunctionId },
    ExceptionOsHandlerLeave { function: FunctionId },
    ExceptionUnwindFunctionEnter { function: FunctionId },
    ExceptionUnwindFunctionLeave,
    ExceptionUnwindFinallyEnter { function: FunctionId },
    ExceptionUnwindFinallyLeave,
    ExceptionCatcherEnter { function: FunctionId, object: ObjectId },
    ExceptionCatcherLeave,

    // COM interop
    ComClassicVTableCreated { class: ClassId, implemented_iid: Guid, slots: u32 },
    ComClassicVTableDestroyed { class: ClassId, implemented_iid: Guid },

    ExceptionClrCatcherFound,
    ExceptionClrCatcherExecute,

    // ICorProfilerCallback2
    ThreadNameChanged { thread: ThreadId, name: String },
    GarbageCollectionStarted { generations: Vec<bool>, reason: GcReason },
    SurvivingReferences { ranges: Vec<ObjectRange> },
    GarbageCollectionFinished,
    FinalizeableObjectQueued { flags: u32, object: ObjectId },
    RootReferences2 { roots: Vec<RootReference> },
    HandleCreated { handle: GcHandleId, initial_object: ObjectId },
    HandleDestroyed { handle: GcHandleId },

    // ICorProfilerCallback3
    ProfilerAttachComplete,
    ProfilerDetachSucceeded,

    // ICorProfilerCallback4
    ReJitCompilationStarted {
        function: FunctionId,
        rejit: ReJitId,
        #[serde(default = "default_safe_to_block")]
        is_safe_to_block: bool,
    },
    GetReJitParameters { module: ModuleId, method: MethodToken },
    ReJitCompilationFinished {
        function: FunctionId,
        rejit: ReJitId,
        status: HResult,
        #[serde(default = "default_safe_to_block")]
        is_safe_to_block: bool,
    },
    ReJitError { module: ModuleId, method: MethodToken, function: FunctionId, status: HResult },
    MovedReferences2 { ranges: Vec<MovedRange> },
    SurvivingReferences2 { ranges: Vec<ObjectRange> },

    // ICorProfilerCallback5
    ConditionalWeakTableElementReferences { entries: Vec<WeakTableEntry> },

    // ICorProfilerCallback6
    GetAssemblyReferences { assembly_path: String },

    // ICorProfilerCallback7
    ModuleInMemorySymbolsUpdated { module: ModuleId },

    // ICorProfilerCallback8
    DynamicMethodJitCompilationStarted {
        function: FunctionId,
        #[serde(default = "default_safe_to_block")]
        is_safe_to_block: bool,
        il_header_size: u32,
    },
    DynamicMethodJitCompilationFinished {
        function: FunctionId,
        status: HResult,
        #[serde(default = "default_safe_to_block")]
        is_safe_to_block: bool,
    },

    // ICorProfilerCallback9
    DynamicMethodUnloaded { function: FunctionId },
}

impl RuntimeEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        EventKind::from(self)
    }

    /// Completion status carried by `*Finished` events
    #[must_use]
    pub fn status(&self) -> Option<HResult> {
        match self {
            RuntimeEvent::AppDomainCreationFinished { status, .. }
            | RuntimeEvent::AppDomainShutdownFinished { status, .. }
            | RuntimeEvent::AssemblyLoadFinished { status, .. }
            | RuntimeEvent::AssemblyUnloadFinished { status, .. }
            | RuntimeEvent::ModuleLoadFinished { status, .. }
            | RuntimeEvent::ModuleUnloadFinished { status, .. }
            | RuntimeEvent::ClassLoadFinished { status, .. }
            | RuntimeEvent::ClassUnloadFinished { status, .. }
            | RuntimeEvent::JitCompilationFinished { status, .. }
            | RuntimeEvent::ReJitCompilationFinished { status, .. }
            | RuntimeEvent::ReJitError { status, .. }
            | RuntimeEvent::DynamicMethodJitCompilationFinished { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// How this event takes part in start/finish pairing and exception nesting
    #[must_use]
    pub fn pairing(&self) -> Option<Pairing> {
        use PairKind as P;
        use Pairing::{Close, Enter, Leave, Open};
        use RuntimeEvent as E;
        use StackKind as S;
        let id = Subject::Id;

        let pairing = match self {
            E::AppDomainCreationStarted { domain } => Open(P::AppDomainCreation, id(domain.0)),
            E::AppDomainCreationFinished { domain, .. } => {
                Close(P::AppDomainCreation, id(domain.0))
            }
            E::AppDomainShutdownStarted { domain } => Open(P::AppDomainShutdown, id(domain.0)),
            E::AppDomainShutdownFinished { domain, .. } => {
                Close(P::AppDomainShutdown, id(domain.0))
            }
            E::AssemblyLoadStarted { assembly } => Open(P::AssemblyLoad, id(assembly.0)),
            E::AssemblyLoadFinished { assembly, .. } => Close(P::AssemblyLoad, id(assembly.0)),
            E::AssemblyUnloadStarted { assembly } => Open(P::AssemblyUnload, id(assembly.0)),
            E::AssemblyUnloadFinished { assembly, .. } => Close(P::AssemblyUnload, id(assembly.0)),
            E::ModuleLoadStarted { module } => Open(P::ModuleLoad, id(module.0)),
            E::ModuleLoadFinished { module, .. } => Close(P::ModuleLoad, id(module.0)),
            E::ModuleUnloadStarted { module } => Open(P::ModuleUnload, id(module.0)),
            E::ModuleUnloadFinished { module, .. } => Close(P::ModuleUnload, id(module.0)),
            E::ClassLoadStarted { class } => Open(P::ClassLoad, id(class.0)),
            E::ClassLoadFinished { class, .. } => Close(P::ClassLoad, id(class.0)),
            E::ClassUnloadStarted { class } => Open(P::ClassUnload, id(class.0)),
            E::ClassUnloadFinished { class, .. } => Close(P::ClassUnload, id(class.0)),
            E::JitCompilationStarted { function, .. } => Open(P::JitCompilation, id(function.0)),
            E::JitCompilationFinished { function, .. } => Close(P::JitCompilation, id(function.0)),
            E::JitCachedFunctionSearchStarted { function } => {
                Open(P::JitCacheSearch, id(function.0))
            }
            E::JitCachedFunctionSearchFinished { function, .. } => {
                Close(P::JitCacheSearch, id(function.0))
            }
            E::ReJitCompilationStarted { rejit, .. } => Open(P::ReJitCompilation, id(rejit.0)),
            E::ReJitCompilationFinished { rejit, .. } => Close(P::ReJitCompilation, id(rejit.0)),
            E::DynamicMethodJitCompilationStarted { function, .. } => {
                Open(P::DynamicMethodJit, id(function.0))
            }
            E::DynamicMethodJitCompilationFinished { function, .. } => {
                Close(P::DynamicMethodJit, id(function.0))
            }
            E::RemotingClientInvocationStarted => Open(P::RemotingClient, Subject::CurrentThread),
            E::RemotingClientInvocationFinished => Close(P::RemotingClient, Subject::CurrentThread),
            E::RemotingServerInvocationStarted => Open(P::RemotingServer, Subject::CurrentThread),
            E::RemotingServerInvocationReturned => Close(P::RemotingServer, Subject::CurrentThread),
            E::RuntimeSuspendStarted { .. } => Open(P::RuntimeSuspend, Subject::Runtime),
            E::RuntimeSuspendFinished | E::RuntimeSuspendAborted => {
                Close(P::RuntimeSuspend, Subject::Runtime)
            }
            E::RuntimeResumeStarted => Open(P::RuntimeResume, Subject::Runtime),
            E::RuntimeResumeFinished => Close(P::RuntimeResume, Subject::Runtime),
            E::GarbageCollectionStarted { .. } => Open(P::GarbageCollection, Subject::Runtime),
            E::GarbageCollectionFinished => Close(P::GarbageCollection, Subject::Runtime),

            E::ExceptionSearchFunctionEnter { function } => Enter(S::SearchFunction, *function),
            E::ExceptionSearchFunctionLeave => Leave(S::SearchFunction),
            E::ExceptionSearchFilterEnter { function } => Enter(S::SearchFilter, *function),
            E::ExceptionSearchFilterLeave => Leave(S::SearchFilter),
            E::ExceptionOsHandlerEnter { function } => Enter(S::OsHandler, *function),
            E::ExceptionOsHandlerLeave { .. } => Leave(S::OsHandler),
            E::ExceptionUnwindFunctionEnter { function } => Enter(S::UnwindFunction, *function),
            E::ExceptionUnwindFunctionLeave => Leave(S::UnwindFunction),
            E::ExceptionUnwindFinallyEnter { function } => Enter(S::UnwindFinally, *function),
            E::ExceptionUnwindFinallyLeave => Leave(S::UnwindFinally),
            E::ExceptionCatcherEnter { function, .. } => Enter(S::Catcher, *function),
            E::ExceptionCatcherLeave => Leave(S::Catcher),
            _ => return None,
        };
        Some(pairing)
    }
}

impl EventKind {
    /// Lowest callback interface version that declares this event
    #[must_use]
    pub fn min_interface_version(self) -> u8 {
        match self {
            EventKind::ThreadNameChanged
            | EventKind::GarbageCollectionStarted
            | EventKind::SurvivingReferences
            | EventKind::GarbageCollectionFinished
            | EventKind::FinalizeableObjectQueued
            | EventKind::RootReferences2
            | EventKind::HandleCreated
            | EventKind::HandleDestroyed => 2,
            EventKind::ProfilerAttachComplete | EventKind::ProfilerDetachSucceeded => 3,
            EventKind::ReJitCompilationStarted
            | EventKind::GetReJitParameters
            | EventKind::ReJitCompilationFinished
            | EventKind::ReJitError
            | EventKind::MovedReferences2
            | EventKind::SurvivingReferences2 => 4,
            EventKind::ConditionalWeakTableElementReferences => 5,
            EventKind::GetAssemblyReferences => 6,
            EventKind::ModuleInMemorySymbolsUpdated => 7,
            EventKind::DynamicMethodJitCompilationStarted
            | EventKind::DynamicMethodJitCompilationFinished => 8,
            EventKind::DynamicMethodUnloaded => 9,
            _ => 1,
        }
    }
}

// ============================================================================
// Pairing
// ============================================================================

/// Start/finish pair families tracked per subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PairKind {
    AppDomainCreation,
    AppDomainShutdown,
    AssemblyLoad,
    AssemblyUnload,
    ModuleLoad,
    ModuleUnload,
    ClassLoad,
    ClassUnload,
    JitCompilation,
    JitCacheSearch,
    ReJitCompilation,
    DynamicMethodJit,
    RemotingClient,
    RemotingServer,
    RuntimeSuspend,
    RuntimeResume,
    GarbageCollection,
}

/// Exception-phase frames that nest like a stack on each thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum StackKind {
    SearchFunction,
    SearchFilter,
    OsHandler,
    UnwindFunction,
    UnwindFinally,
    Catcher,
}

/// What a start/finish pair is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Host-issued subject id
    Id(u64),
    /// The runtime as a whole (GC, suspension)
    Runtime,
    /// The delivering thread (remoting invocations carry no id)
    CurrentThread,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Id(id) => write!(f, "0x{id:x}"),
            Subject::Runtime => write!(f, "runtime"),
            Subject::CurrentThread => write!(f, "current thread"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    Open(PairKind, Subject),
    Close(PairKind, Subject),
    Enter(StackKind, FunctionId),
    Leave(StackKind),
}

// ============================================================================
// Replies
// ============================================================================

/// Answer handed back to the host for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Handled (or defaulted), no decision to report
    Ack,
    /// Out-parameter of `JitCachedFunctionSearchStarted`
    UseCachedCode(bool),
    /// Out-parameter of `JitInlining`
    ShouldInline(bool),
}

impl Reply {
    /// Default answer for `kind` when no handler overrides it
    #[must_use]
    pub fn default_for(kind: EventKind) -> Self {
        match kind {
            EventKind::JitCachedFunctionSearchStarted => Reply::UseCachedCode(true),
            EventKind::JitInlining => Reply::ShouldInline(true),
            _ => Reply::Ack,
        }
    }
}
