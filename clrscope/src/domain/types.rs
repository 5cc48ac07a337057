//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a managed thread
//! handle where an OS process id is expected, and make function signatures
//! more expressive.

use std::fmt;

/// Process ID
///
/// Represents an OS process id on the controller's host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl Pid {
    /// Pid of the calling process
    #[must_use]
    pub fn current() -> Self {
        Pid(std::process::id())
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Logical attach target, resolved to a process handle by a `ProcessLocator`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTarget {
    /// Explicit process id
    Pid(Pid),
    /// Process name (command name or executable basename)
    Name(String),
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessTarget::Pid(pid) => write!(f, "{pid}"),
            ProcessTarget::Name(name) => write!(f, "'{name}'"),
        }
    }
}

impl From<Pid> for ProcessTarget {
    fn from(pid: Pid) -> Self {
        ProcessTarget::Pid(pid)
    }
}

/// Lifecycle of an event sink instance
///
/// `Created -> Initialized | Attached -> ShuttingDown -> Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum LifecycleState {
    /// Built by the factory, no host capability yet
    Created,
    /// Loaded at process startup via `initialize`
    Initialized,
    /// Loaded into a running process via `initialize_for_attach`
    Attached,
    /// Inside `shutdown`
    ShuttingDown,
    /// `shutdown` completed; only `release` remains legal
    Terminated,
}

impl LifecycleState {
    /// Whether the host may deliver events in this state
    #[must_use]
    pub fn accepts_events(self) -> bool {
        matches!(self, LifecycleState::Initialized | LifecycleState::Attached)
    }
}
