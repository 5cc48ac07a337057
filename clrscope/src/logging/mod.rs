//! Logger collaborator used by the event sink.
//!
//! The sink runs inside the target process, which may have no `log`
//! subscriber installed, so it writes through this trait instead of calling
//! `log` macros directly. Three sinks are provided:
//!
//! - [`LogFacade`] forwards to the `log` crate (default)
//! - [`file::FileLogger`] appends JSON lines from a background thread
//! - [`MemoryLogger`] keeps records in memory for tests and replay reports

pub mod file;

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use file::FileLogger;

/// Record severity, lowest first
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Severity {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl From<Severity> for log::Level {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Verbose => log::Level::Trace,
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error | Severity::Fatal => log::Level::Error,
        }
    }
}

/// Append-only sink for formatted messages
pub trait Logger: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    /// Flush and close any backing store; later records are discarded
    fn shutdown(&self) {}
}

/// One logged line, as written by `FileLogger`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: u64,
    pub level: Severity,
    pub pid: u32,
    pub message: String,
}

impl LogRecord {
    #[must_use]
    pub fn now(level: Severity, message: &str) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self { timestamp_ms, level, pid: std::process::id(), message: message.to_string() }
    }
}

/// Forwards to the `log` facade under the `clrscope::sink` target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFacade;

impl Logger for LogFacade {
    fn log(&self, severity: Severity, message: &str) {
        log::log!(target: "clrscope::sink", log::Level::from(severity), "{message}");
    }

    fn shutdown(&self) {
        log::logger().flush();
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Messages at or above `min`
    #[must_use]
    pub fn messages(&self, min: Severity) -> Vec<String> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.level >= min)
            .map(|r| r.message.clone())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.message.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn log(&self, severity: Severity, message: &str) {
        let record = LogRecord::now(severity, message);
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }
}
