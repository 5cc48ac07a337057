//! Structured error types for clrscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! The enums follow the failure taxonomy of the attach pipeline:
//! resolution errors come back as typed outcomes, host-protocol violations
//! get their own variants, and attach-call failures keep the host status.

use std::path::PathBuf;
use std::time::Duration;

use clrscope_common::{Guid, HResult};
use thiserror::Error;

use super::types::{LifecycleState, Pid};
use crate::sink::events::EventKind;
use crate::sink::tracker::SequenceViolation;

/// Failure to turn a `ProcessTarget` into a `ProcessRef`
#[derive(Error, Debug)]
pub enum LocateError {
    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("No process matching '{0}' found")]
    NoMatch(String),

    #[error(
        "Multiple processes match '{name}': {}",
        .candidates.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    Ambiguous { name: String, candidates: Vec<Pid> },

    #[error("Permission denied opening process {0}")]
    AccessDenied(Pid),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure reported by a runtime directory
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Process {0} is no longer running")]
    ProcessNotFound(Pid),

    #[error("No runtime version recognized in {path}: {reason}")]
    UnrecognizedRuntimeFile { path: PathBuf, reason: String },

    #[error("Runtime {0} is not installed")]
    RuntimeNotInstalled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invalid `AttachRequest` input, rejected before any host call
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("Attach timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Component path must be absolute: {0}")]
    RelativeComponentPath(PathBuf),

    #[error("Component id must not be nil")]
    NilComponentId,

    #[error("Invalid component id '{0}'")]
    InvalidComponentId(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Failed attach attempt
///
/// Every variant that involves a host call keeps the status it returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachFailure {
    #[error("Process {target} not found: {reason}")]
    ProcessNotFound { target: String, reason: String },

    #[error("Runtime {version} is not loadable")]
    RuntimeNotLoadable { version: String, status: Option<HResult> },

    #[error("Runtime {version} is not loaded in process {pid}")]
    RuntimeNotPresentInProcess { version: String, pid: Pid, status: Option<HResult> },

    #[error("Runtime {version} does not support attach ({status})")]
    InterfaceNotSupported { version: String, status: HResult },

    #[error("Attach to process {pid} timed out after {}ms ({status})", .timeout.as_millis())]
    AttachTimedOut { pid: Pid, timeout: Duration, status: HResult },

    #[error("Attach to process {pid} rejected ({status})")]
    AttachRejected { pid: Pid, status: HResult },
}

impl AttachFailure {
    /// Underlying host status, when the failure came from a host call
    #[must_use]
    pub fn status(&self) -> Option<HResult> {
        match self {
            AttachFailure::ProcessNotFound { .. } => None,
            AttachFailure::RuntimeNotLoadable { status, .. }
            | AttachFailure::RuntimeNotPresentInProcess { status, .. } => *status,
            AttachFailure::InterfaceNotSupported { status, .. }
            | AttachFailure::AttachTimedOut { status, .. }
            | AttachFailure::AttachRejected { status, .. } => Some(*status),
        }
    }
}

/// Host-protocol violations and fatal lifecycle failures of the event sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Interface query with a nil identity")]
    NullInterfaceQuery,

    #[error("Interface {0} is not supported")]
    NotSupported(Guid),

    #[error("Event sink used after its last reference was released")]
    Released,

    #[error("{operation} is not valid in state {state}")]
    InvalidState { state: LifecycleState, operation: &'static str },

    #[error("Host does not expose the profiler info interface ({0})")]
    CapabilityMissing(HResult),

    #[error("Host rejected event interest mask 0x{mask:x} ({status})")]
    InterestRejected { mask: u32, status: HResult },

    #[error("{kind} belongs to callback interface {required}, the host negotiated {negotiated}")]
    EventAboveInterface { kind: EventKind, required: u8, negotiated: u8 },

    #[error("Host refused to detach the event sink ({0})")]
    DetachRefused(HResult),

    #[error(transparent)]
    SequenceViolation(#[from] SequenceViolation),
}

impl SinkError {
    /// Status handed back to the host for this error
    #[must_use]
    pub fn status(&self) -> HResult {
        match self {
            SinkError::NullInterfaceQuery => HResult::E_POINTER,
            SinkError::NotSupported(_) => HResult::E_NOINTERFACE,
            SinkError::Released | SinkError::InvalidState { .. } => HResult::E_UNEXPECTED,
            SinkError::CapabilityMissing(status)
            | SinkError::InterestRejected { status, .. }
            | SinkError::DetachRefused(status) => *status,
            SinkError::EventAboveInterface { .. } => HResult::E_NOTIMPL,
            SinkError::SequenceViolation(_) => HResult::E_FAIL,
        }
    }
}

/// Failure to load or drive a recorded event trace
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to parse trace file: {0}")]
    TraceParseFailed(#[from] serde_json::Error),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Loopback attach failed: {0}")]
    AttachFailed(#[from] AttachFailure),

    #[error("Event sink was not loaded by the loopback host")]
    SinkMissing,

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_error_display() {
        let err = LocateError::ProcessNotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err =
            LocateError::Ambiguous { name: "dotnet".into(), candidates: vec![Pid(1), Pid(2)] };
        assert_eq!(err.to_string(), "Multiple processes match 'dotnet': PID:1, PID:2");
    }

    #[test]
    fn test_attach_failure_keeps_status() {
        let err = AttachFailure::AttachRejected { pid: Pid(42), status: HResult::E_ACCESSDENIED };
        assert_eq!(err.status(), Some(HResult::E_ACCESSDENIED));
        assert!(err.to_string().contains("0x80070005"));

        let err = AttachFailure::AttachTimedOut {
            pid: Pid(42),
            timeout: Duration::from_millis(10_000),
            status: HResult::ERROR_TIMEOUT,
        };
        assert!(err.to_string().contains("10000ms"));
    }

    #[test]
    fn test_sink_error_status_mapping() {
        assert_eq!(SinkError::NullInterfaceQuery.status(), HResult::E_POINTER);
        assert_eq!(SinkError::NotSupported(Guid::ZERO).status(), HResult::E_NOINTERFACE);
        assert_eq!(SinkError::Released.status(), HResult::E_UNEXPECTED);
        assert_eq!(SinkError::DetachRefused(HResult::E_FAIL).status(), HResult::E_FAIL);

        let err = SinkError::EventAboveInterface {
            kind: EventKind::DynamicMethodUnloaded,
            required: 9,
            negotiated: 3,
        };
        assert_eq!(err.status(), HResult::E_NOTIMPL);
        assert_eq!(
            err.to_string(),
            "DynamicMethodUnloaded belongs to callback interface 9, the host negotiated 3"
        );
    }
}
