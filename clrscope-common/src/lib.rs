//! # Shared Identifiers (controller ↔ runtime host ↔ event sink)
//!
//! Defines the identifiers that cross every boundary in clrscope: subject ids
//! handed out by the runtime host, the status codes every host call returns,
//! the interface and component GUIDs used during negotiation, and the
//! event-interest bitmask the sink writes back to the host.
//!
//! Nothing in here allocates, so the crate stays `no_std` and can be linked
//! into an out-of-process attach transport as well as into the sink itself.
//!
//! ## Key Types
//!
//! - [`HResult`] - Host status code (success/failure by sign bit)
//! - [`EventInterest`] - Event categories requested from the host
//! - [`iid`] - Interface identities of the callback family and host info
//! - Subject ids: [`ModuleId`], [`AssemblyId`], [`ClassId`], [`FunctionId`],
//!   [`ThreadId`], [`ObjectId`], [`AppDomainId`], [`GcHandleId`], [`ReJitId`]

#![no_std]

use core::fmt;

pub use uguid::{guid, Guid};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Status Codes
// ============================================================================

/// Status code returned by every host call and every sink callback.
///
/// Negative values are failures. The numeric value is kept verbatim so that
/// callers can tell "target refused" from "target hung" when diagnosing an
/// attach.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct HResult(pub i32);

#[allow(clippy::cast_possible_wrap)]
impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const S_FALSE: HResult = HResult(1);
    pub const E_NOTIMPL: HResult = HResult(0x8000_4001_u32 as i32);
    pub const E_NOINTERFACE: HResult = HResult(0x8000_4002_u32 as i32);
    pub const E_POINTER: HResult = HResult(0x8000_4003_u32 as i32);
    pub const E_ABORT: HResult = HResult(0x8000_4004_u32 as i32);
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    pub const E_UNEXPECTED: HResult = HResult(0x8000_FFFF_u32 as i32);
    pub const E_ACCESSDENIED: HResult = HResult(0x8007_0005_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057_u32 as i32);
    pub const CLASS_E_CLASSNOTAVAILABLE: HResult = HResult(0x8004_0111_u32 as i32);
    /// `HRESULT_FROM_WIN32(WAIT_TIMEOUT)`
    pub const WAIT_TIMEOUT: HResult = HResult(0x8007_0102_u32 as i32);
    /// `HRESULT_FROM_WIN32(ERROR_TIMEOUT)`
    pub const ERROR_TIMEOUT: HResult = HResult(0x8007_05B4_u32 as i32);
    /// `HRESULT_FROM_WIN32(ERROR_NOT_FOUND)`
    pub const ERROR_NOT_FOUND: HResult = HResult(0x8007_0490_u32 as i32);

    /// Returns true for success codes (`S_OK`, `S_FALSE`, ...)
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Returns true for the statuses a host uses to report an expired wait
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        self.0 == Self::WAIT_TIMEOUT.0 || self.0 == Self::ERROR_TIMEOUT.0
    }

    /// Wrap a host status in a `Result`
    ///
    /// # Errors
    /// Returns the status itself when it is a failure code
    pub const fn ok(self) -> Result<(), HResult> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[allow(clippy::cast_sign_loss)]
impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HResult({self})")
    }
}

// ============================================================================
// Subject Identifiers
// ============================================================================

macro_rules! subject_id {
    ($(#[$meta:meta])* $name:ident($repr:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
        pub struct $name(pub $repr);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> Self {
                $name(raw)
            }
        }
    };
}

subject_id!(
    /// Application domain handle issued by the host
    AppDomainId(u64)
);
subject_id!(
    /// Loaded assembly handle
    AssemblyId(u64)
);
subject_id!(
    /// Loaded module handle
    ModuleId(u64)
);
subject_id!(
    /// Loaded type handle
    ClassId(u64)
);
subject_id!(
    /// Method handle (stable for the lifetime of the owning module)
    FunctionId(u64)
);
subject_id!(
    /// Managed thread handle (not an OS thread id)
    ThreadId(u64)
);
subject_id!(
    /// Heap object address; moves across garbage collections
    ObjectId(u64)
);
subject_id!(
    /// GC handle
    GcHandleId(u64)
);
subject_id!(
    /// ReJIT version of a function
    ReJitId(u64)
);
subject_id!(
    /// Metadata token of a type definition inside a module
    TypeToken(u32)
);
subject_id!(
    /// Metadata token of a method definition inside a module
    MethodToken(u32)
);

/// OS thread id a managed thread is currently running on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct OsThreadId(pub u32);

impl fmt::Display for OsThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Interface and Component Identities
// ============================================================================

/// Interface identities known to the sink and to the host.
///
/// The callback family is a chain of supersets: `ICorProfilerCallbackN`
/// carries every event of `ICorProfilerCallbackN-1` plus its own.
pub mod iid {
    use super::{guid, Guid};

    pub const IUNKNOWN: Guid = guid!("00000000-0000-0000-c000-000000000046");
    pub const CLASS_FACTORY: Guid = guid!("00000001-0000-0000-c000-000000000046");

    pub const CALLBACK: Guid = guid!("176fbed1-a55c-4796-98ca-a9da0ef883e7");
    pub const CALLBACK_2: Guid = guid!("8a8cc829-ccf2-49fe-bbae-0f022228071a");
    pub const CALLBACK_3: Guid = guid!("4fd2ed52-7731-4b8d-9469-03d2cc3086c5");
    pub const CALLBACK_4: Guid = guid!("7b63b2e3-107d-4d48-b2f6-f61e229470d2");
    pub const CALLBACK_5: Guid = guid!("8dfba405-8c9f-45f8-bffa-83b14cef78b5");
    pub const CALLBACK_6: Guid = guid!("fc13df4b-4448-4f4f-950c-ba8d19d00c36");
    pub const CALLBACK_7: Guid = guid!("f76a2dba-1d52-4539-866c-2aa518f9efc3");
    pub const CALLBACK_8: Guid = guid!("5bed9b15-c079-4d47-bfe2-215a140c07e0");
    pub const CALLBACK_9: Guid = guid!("27583ec3-c8f5-482f-8052-194b8ce4705a");
    pub const CALLBACK_10: Guid = guid!("cec5b60e-c69c-495f-87f6-84d28ee16ffb");
    pub const CALLBACK_11: Guid = guid!("42350846-aaed-47f7-b128-fd0c98881cde");

    pub const PROFILER_INFO: Guid = guid!("28b5557d-3f3f-48b4-90b2-5f9eea2f6c48");
    /// First info interface that supports attach-time initialization
    pub const PROFILER_INFO_3: Guid = guid!("b555ed4f-452a-4e54-8b39-b5360bad32a0");
}

/// Component id of the clrscope event sink
pub const SINK_COMPONENT_ID: Guid = guid!("805a308b-061c-47f3-9b30-f785c3186e82");

// ============================================================================
// Event Interest
// ============================================================================

bitflags::bitflags! {
    /// Event categories the sink asks the host to deliver.
    ///
    /// Bit values match the runtime's monitor flags so the mask can be handed
    /// to a host unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventInterest: u32 {
        const FUNCTION_UNLOADS = 0x1;
        const CLASS_LOADS = 0x2;
        const MODULE_LOADS = 0x4;
        const ASSEMBLY_LOADS = 0x8;
        const APPDOMAIN_LOADS = 0x10;
        const JIT_COMPILATION = 0x20;
        const EXCEPTIONS = 0x40;
        const GC = 0x80;
        const OBJECT_ALLOCATED = 0x100;
        const THREADS = 0x200;
        const REMOTING = 0x400;
        const CODE_TRANSITIONS = 0x800;
        const ENTERLEAVE = 0x1000;
        const CCW = 0x2000;
        const SUSPENDS = 0x10000;
        const CACHE_SEARCHES = 0x20000;
        const ENABLE_REJIT = 0x40000;
        const ENABLE_OBJECT_ALLOCATED = 0x80_0000;
        const CLR_EXCEPTIONS = 0x100_0000;
        const ENABLE_STACK_SNAPSHOT = 0x1000_0000;

        /// Categories requested by a sink loaded at process startup
        const STARTUP = Self::MODULE_LOADS.bits()
            | Self::ASSEMBLY_LOADS.bits()
            | Self::GC.bits()
            | Self::CLASS_LOADS.bits()
            | Self::THREADS.bits()
            | Self::EXCEPTIONS.bits()
            | Self::JIT_COMPILATION.bits();

        /// Allocation tracking; only legal when requested at startup
        const ALLOCATIONS = Self::OBJECT_ALLOCATED.bits() | Self::ENABLE_OBJECT_ALLOCATED.bits();

        /// Every flag a host accepts after a late attach
        const ALLOWABLE_AFTER_ATTACH = Self::THREADS.bits()
            | Self::MODULE_LOADS.bits()
            | Self::ASSEMBLY_LOADS.bits()
            | Self::APPDOMAIN_LOADS.bits()
            | Self::ENABLE_STACK_SNAPSHOT.bits()
            | Self::GC.bits()
            | Self::SUSPENDS.bits()
            | Self::CLASS_LOADS.bits()
            | Self::EXCEPTIONS.bits()
            | Self::JIT_COMPILATION.bits()
            | Self::ENABLE_REJIT.bits();
    }
}

impl EventInterest {
    /// Startup mask, optionally with allocation tracking
    #[must_use]
    pub const fn startup(track_allocations: bool) -> Self {
        if track_allocations {
            Self::STARTUP.union(Self::ALLOCATIONS)
        } else {
            Self::STARTUP
        }
    }

    /// Mask requested after a late attach: the full startup set without
    /// allocation tracking, narrowed to what the host accepts post-attach.
    ///
    /// Always a strict subset of `startup(true)`. With allocation tracking
    /// off the startup mask carries no attach-illegal flag, so the two match.
    #[must_use]
    pub const fn for_attach() -> Self {
        Self::startup(true).difference(Self::ALLOCATIONS).intersection(Self::ALLOWABLE_AFTER_ATTACH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hresult_sign() {
        assert!(HResult::S_OK.is_success());
        assert!(HResult::S_FALSE.is_success());
        assert!(!HResult::E_FAIL.is_success());
        assert_eq!(HResult::E_NOINTERFACE.ok(), Err(HResult::E_NOINTERFACE));
    }

    #[test]
    fn test_timeout_codes() {
        assert!(HResult::ERROR_TIMEOUT.is_timeout());
        assert!(HResult::WAIT_TIMEOUT.is_timeout());
        assert!(!HResult::E_ACCESSDENIED.is_timeout());
    }

    #[test]
    fn test_attach_mask_is_strict_subset_of_startup() {
        let startup = EventInterest::startup(true);
        let attach = EventInterest::for_attach();
        assert!(startup.contains(attach));
        assert_ne!(startup, attach);
        assert!(!attach.intersects(EventInterest::ALLOCATIONS));
        assert!(EventInterest::ALLOWABLE_AFTER_ATTACH.contains(attach));
    }

    #[test]
    fn test_attach_mask_ignores_allocation_setting() {
        let attach = EventInterest::for_attach();
        assert_eq!(attach, EventInterest::STARTUP);
        assert!(EventInterest::startup(false).contains(attach));
        assert!(EventInterest::startup(true).bits() & !attach.bits() != 0);
    }

    #[test]
    fn test_startup_mask_values() {
        assert_eq!(EventInterest::STARTUP.bits(), 0x2EE);
        assert_eq!(EventInterest::startup(true).bits(), 0x2EE | 0x80_0100);
    }
}
