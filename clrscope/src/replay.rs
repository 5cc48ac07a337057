//! Trace replay
//!
//! Loads a recorded event trace, attaches a real event sink to the current
//! process through the loopback host, and feeds it every recorded event in
//! order. The sink behaves as it would inside a target: it negotiates its
//! interest mask, resolves names through the trace's metadata tables and
//! checks start/finish pairing. A trace holds the whole session, so under
//! strict sequencing a finish without its start is a violation even though
//! the sink came in through attach.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;

use crate::attach::{AttachNegotiator, AttachRequest, PresenceCheck};
use crate::domain::{Pid, ReplayError, SinkError};
use crate::logging::Logger;
use crate::naming::CachingResolver;
use crate::process_lookup::ProcfsLocator;
use crate::runtime::loopback::{LoopbackHost, LoopbackInfo, TraceMetadata, LOOPBACK_VERSION};
use crate::sink::analysis::AnalysisSnapshot;
use crate::sink::events::{EventKind, RuntimeEvent};
use crate::sink::stats::StatsSnapshot;
use crate::sink::{SinkConfig, SinkServices};

/// Recorded trace: subject tables plus the events in delivery order
#[derive(Debug, Default, Deserialize)]
pub struct TraceFile {
    #[serde(default)]
    pub metadata: TraceMetadata,
    pub events: Vec<RuntimeEvent>,
}

impl TraceFile {
    /// # Errors
    /// `Io` if the file can't be read, `TraceParseFailed` if it isn't a trace
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// # Errors
    /// `TraceParseFailed` on malformed JSON or unknown event kinds
    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Event the sink refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub index: usize,
    pub kind: EventKind,
    pub error: SinkError,
}

#[derive(Debug)]
pub struct ReplayReport {
    pub runtime: String,
    pub events: usize,
    pub failures: Vec<ReplayFailure>,
    /// Pairs still open when the trace ended
    pub outstanding: Vec<String>,
    pub stats: StatsSnapshot,
    pub analysis: AnalysisSnapshot,
    pub names_cached: usize,
    pub detached: bool,
}

impl ReplayReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.outstanding.is_empty()
    }
}

/// Replay `trace` into a freshly attached sink that logs to `logger`.
///
/// The logger is left open; whoever created it shuts it down.
///
/// # Errors
/// Fails when the loopback attach fails or the sink refuses to shut down.
/// Events the sink rejects are collected in the report instead.
pub fn replay(
    trace: TraceFile,
    config: SinkConfig,
    logger: Arc<dyn Logger>,
) -> Result<ReplayReport, ReplayError> {
    let strict = config.strict_sequencing;
    let info = Arc::new(LoopbackInfo::new(trace.metadata));
    let resolver = Arc::new(CachingResolver::new(Arc::clone(&info)));
    let services = SinkServices::new(logger, resolver.clone()).with_config(config);
    let host = LoopbackHost::new(info, services);

    let request = AttachRequest::builder()
        .target(Pid::current())
        .runtime_version(LOOPBACK_VERSION)
        .code_path(std::env::current_exe()?)
        .presence(PresenceCheck::Strict)
        .build()?;
    let attached = AttachNegotiator::new(&ProcfsLocator, &host).attach(&request)?;
    let sink = host.take_sink().ok_or(ReplayError::SinkMissing)?;
    if strict {
        sink.tracker().set_tolerate_orphans(false);
    }
    info!("Replaying {} events into sink attached to {}", trace.events.len(), attached.pid);

    let mut failures = Vec::new();
    for (index, event) in trace.events.iter().enumerate() {
        if let Err(error) = sink.dispatch(event) {
            warn!("Event #{index} ({}) rejected: {error}", event.kind());
            failures.push(ReplayFailure { index, kind: event.kind(), error });
        }
    }

    let outstanding = sink
        .tracker()
        .outstanding()
        .into_iter()
        .map(|(kind, subject)| format!("{kind} for {subject}"))
        .collect();
    let stats = sink.stats();
    let analysis = sink.analysis();

    // The loopback runtime completes a requested detach as soon as the trace ends
    let detached = host.info().detach_requested();
    if detached {
        sink.dispatch(&RuntimeEvent::ProfilerDetachSucceeded)?;
    }
    sink.shutdown()?;
    sink.release()?;

    Ok(ReplayReport {
        runtime: attached.runtime,
        events: trace.events.len(),
        failures,
        outstanding,
        stats,
        analysis,
        names_cached: resolver.cached(),
        detached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;
    use crate::sink::tracker::SequenceViolation;
    use std::time::Duration;

    const TRACE: &str = r#"{
        "metadata": {
            "classes": [{"id": 100, "module": 1, "token": 33554433, "name": "Demo.Widget"}],
            "functions": [{"id": 7, "name": "Demo.Program::Main"}]
        },
        "events": [
            {"event": "thread_created", "thread": 1},
            {"event": "jit_compilation_started", "function": 7, "is_safe_to_block": true},
            {"event": "jit_compilation_finished", "function": 7, "status": 0,
             "is_safe_to_block": true},
            {"event": "class_load_started", "class": 100},
            {"event": "class_load_finished", "class": 100, "status": 0},
            {"event": "class_load_started", "class": 100}
        ]
    }"#;

    #[test]
    fn test_replay_reports_open_pairs() {
        let logger = Arc::new(MemoryLogger::new());
        let trace = TraceFile::parse(TRACE).unwrap();
        let report = replay(trace, SinkConfig::default(), logger.clone()).unwrap();

        assert_eq!(report.runtime, LOOPBACK_VERSION);
        assert_eq!(report.events, 6);
        assert!(report.failures.is_empty());
        assert_eq!(report.outstanding.len(), 1);
        assert!(!report.is_clean());
        assert_eq!(report.stats.dispatched, 6);

        assert!(logger.contains("JIT compilation finished: Demo.Program::Main"));
        assert!(logger.contains("Type 'Demo.Widget' loaded"));
        assert!(logger.contains("started but never finished"));
    }

    #[test]
    fn test_strict_replay_collects_violations() {
        let trace = TraceFile::parse(
            r#"{"events": [
                {"event": "class_load_started", "class": 5},
                {"event": "class_load_started", "class": 5}
            ]}"#,
        )
        .unwrap();
        let config = SinkConfig { strict_sequencing: true, ..SinkConfig::default() };
        let report = replay(trace, config, Arc::new(MemoryLogger::new())).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].kind, EventKind::ClassLoadStarted);
        assert!(matches!(
            report.failures[0].error,
            SinkError::SequenceViolation(SequenceViolation::AlreadyOpen { .. })
        ));
    }

    const ORPHANS: &str = r#"{"events": [
        {"event": "class_load_finished", "class": 5, "status": 0},
        {"event": "exception_catcher_leave"},
        {"event": "garbage_collection_finished"}
    ]}"#;

    #[test]
    fn test_strict_replay_rejects_orphan_finishes() {
        let logger = Arc::new(MemoryLogger::new());
        let lenient = replay(TraceFile::parse(ORPHANS).unwrap(), SinkConfig::default(), logger);
        assert!(lenient.unwrap().failures.is_empty());

        let config = SinkConfig { strict_sequencing: true, ..SinkConfig::default() };
        let trace = TraceFile::parse(ORPHANS).unwrap();
        let report = replay(trace, config, Arc::new(MemoryLogger::new())).unwrap();
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.stats.violations, 3);
        assert!(matches!(
            report.failures[1].error,
            SinkError::SequenceViolation(SequenceViolation::UnmatchedLeave { .. })
        ));
    }

    #[test]
    fn test_detach_after_attach_completes() {
        let trace = TraceFile::parse(r#"{"events": [{"event": "thread_created", "thread": 1}]}"#)
            .unwrap();
        let logger = Arc::new(MemoryLogger::new());
        let config = SinkConfig { detach_after: Some(Duration::ZERO), ..SinkConfig::default() };
        let report = replay(trace, config, logger.clone()).unwrap();

        assert!(report.detached);
        assert!(logger.contains("Detach requested"));
        assert!(logger.contains("Profiler detach succeeded"));
    }

    #[test]
    fn test_unknown_event_kind() {
        let err = TraceFile::parse(r#"{"events": [{"event": "not_an_event"}]}"#).unwrap_err();
        assert!(matches!(err, ReplayError::TraceParseFailed(_)));
    }
}
