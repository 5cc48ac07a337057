//! # Event Sink (loaded by the runtime host)
//!
//! The component a runtime loads into the target process and drives through
//! lifecycle and event callbacks.
//!
//! ```text
//! factory ──create_instance──> EventSink (refs = 1)
//!                                 │
//!              initialize | initialize_for_attach
//!                                 │  query PROFILER_INFO_3, write EventInterest
//!                                 ▼
//!                      dispatch(RuntimeEvent) * N   (any thread)
//!                                 │  PairingTracker ─> handlers ─> Reply
//!                                 ▼
//!                              shutdown
//!                                 │
//!                      release ... refs == 0 ─> teardown (once)
//! ```
//!
//! The interface family is a lookup table ([`identity`]); every event goes
//! through one `dispatch` with a default reply, and the `handlers` module overrides
//! the events that log something or feed the session analysis.

pub mod analysis;
pub mod events;
pub mod factory;
mod handlers;
pub mod host;
pub mod identity;
pub mod stats;
pub mod tracker;

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use clrscope_common::{iid, EventInterest, Guid};

use crate::domain::{LifecycleState, SinkError};
use crate::logging::{Logger, Severity};
use crate::naming::NameResolver;
use analysis::{AnalysisSnapshot, SessionAnalysis};
use events::{Reply, RuntimeEvent};
use host::{HostInfoProvider, ProfilerInfo};
use stats::{DispatchStats, StatsSnapshot};
use tracker::PairingTracker;

/// Settings read inside the target process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Request allocation events on the startup path (never after attach)
    pub track_allocations: bool,
    /// Fail the callback on an ordering violation instead of only counting it
    pub strict_sequencing: bool,
    /// Write JSON lines here instead of forwarding to `log`
    pub log_file: Option<PathBuf>,
    pub min_severity: Severity,
    /// Ask the host to detach this long after attach completes
    pub detach_after: Option<Duration>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            track_allocations: true,
            strict_sequencing: false,
            log_file: None,
            min_severity: Severity::Info,
            detach_after: None,
        }
    }
}

/// Time the host is told a detach should take
pub const DETACH_COMPLETION: Duration = Duration::from_millis(3000);

impl SinkConfig {
    /// Read `CLRSCOPE_*` variables, keeping defaults for unset or malformed ones
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            match lookup(key).as_deref().map(str::to_ascii_lowercase) {
                None => default,
                Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
                Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
                Some(v) => {
                    log::warn!("Ignoring {key}={v}, expected a boolean");
                    default
                }
            }
        };

        let min_severity = match lookup("CLRSCOPE_LOG_LEVEL") {
            None => defaults.min_severity,
            Some(level) => level.parse().unwrap_or_else(|_| {
                log::warn!("Ignoring CLRSCOPE_LOG_LEVEL={level}");
                defaults.min_severity
            }),
        };

        let detach_after = lookup("CLRSCOPE_DETACH_AFTER_MS").and_then(|ms| match ms.parse() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                log::warn!("Ignoring CLRSCOPE_DETACH_AFTER_MS={ms}, expected milliseconds");
                None
            }
        });

        Self {
            track_allocations: flag("CLRSCOPE_TRACK_ALLOCATIONS", defaults.track_allocations),
            strict_sequencing: flag("CLRSCOPE_STRICT_SEQUENCING", defaults.strict_sequencing),
            log_file: lookup("CLRSCOPE_LOG_FILE").filter(|p| !p.is_empty()).map(PathBuf::from),
            min_severity,
            detach_after,
        }
    }
}

/// Process-scoped collaborators shared by every sink instance
#[derive(Clone)]
pub struct SinkServices {
    pub logger: Arc<dyn Logger>,
    pub resolver: Arc<dyn NameResolver>,
    pub config: SinkConfig,
}

impl SinkServices {
    #[must_use]
    pub fn new(logger: Arc<dyn Logger>, resolver: Arc<dyn NameResolver>) -> Self {
        Self { logger, resolver, config: SinkConfig::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: SinkConfig) -> Self {
        self.config = config;
        self
    }
}

pub struct EventSink {
    refs: AtomicU32,
    state: RwLock<LifecycleState>,
    info: RwLock<Option<Arc<dyn ProfilerInfo>>>,
    interest: AtomicU32,
    /// Highest callback interface handed out, 0 until the first query
    interface_version: AtomicU8,
    tracker: PairingTracker,
    stats: DispatchStats,
    analysis: SessionAnalysis,
    services: SinkServices,
}

impl EventSink {
    /// New sink holding one reference, owned by the caller
    #[must_use]
    pub fn new(services: SinkServices) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicU32::new(1),
            state: RwLock::new(LifecycleState::Created),
            info: RwLock::new(None),
            interest: AtomicU32::new(0),
            interface_version: AtomicU8::new(0),
            tracker: PairingTracker::new(),
            stats: DispatchStats::default(),
            analysis: SessionAnalysis::new(),
            services,
        })
    }

    // ------------------------------------------------------------------
    // Identity and reference counting
    // ------------------------------------------------------------------

    /// Answer an interface-identity query; success takes a reference
    ///
    /// # Errors
    /// `NullInterfaceQuery` for the nil id, `NotSupported` outside the
    /// implemented family, `Released` after teardown
    pub fn query_interface(self: &Arc<Self>, iid: Guid) -> Result<InterfaceRef, SinkError> {
        self.ensure_live()?;
        if iid == Guid::ZERO {
            return Err(SinkError::NullInterfaceQuery);
        }
        if !identity::is_supported(iid) {
            self.log(Severity::Debug, || {
                format!("QueryInterface {} not supported", identity::describe(iid))
            });
            return Err(SinkError::NotSupported(iid));
        }
        self.retain()?;
        if let Some(version) = identity::family_version(iid) {
            self.interface_version.fetch_max(version, Ordering::AcqRel);
        }
        Ok(InterfaceRef { iid, sink: Arc::clone(self), released: false })
    }

    /// Highest callback interface version handed out so far
    #[must_use]
    pub fn interface_version(&self) -> u8 {
        self.interface_version.load(Ordering::Acquire)
    }

    /// # Errors
    /// `Released` once the count has reached zero
    pub fn retain(&self) -> Result<u32, SinkError> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    n.checked_add(1)
                }
            })
            .map(|previous| previous + 1)
            .map_err(|_| SinkError::Released)
    }

    /// Drop one reference; the call that reaches zero tears the sink down
    ///
    /// # Errors
    /// `Released` once the count has reached zero
    pub fn release(&self) -> Result<u32, SinkError> {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| SinkError::Released)?;
        if previous == 1 {
            self.teardown();
        }
        Ok(previous - 1)
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), SinkError> {
        if self.ref_count() == 0 {
            Err(SinkError::Released)
        } else {
            Ok(())
        }
    }

    fn teardown(&self) {
        let state = self.state();
        if state.accepts_events() {
            self.log(Severity::Warning, || {
                format!("Event sink released while {state}, shutdown was never called")
            });
            self.info.write().unwrap_or_else(PoisonError::into_inner).take();
        }
        self.tracker.clear();
        self.analysis.clear();
        self.log(Severity::Debug, || "Event sink released".to_string());
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interest mask last written to the host
    #[must_use]
    pub fn interest(&self) -> EventInterest {
        EventInterest::from_bits_retain(self.interest.load(Ordering::Acquire))
    }

    /// Startup path: the sink was loaded with the process
    ///
    /// # Errors
    /// `InvalidState` unless freshly created, `CapabilityMissing` or
    /// `InterestRejected` from the host
    pub fn initialize(&self, host: &dyn HostInfoProvider) -> Result<(), SinkError> {
        self.log(Severity::Info, || "Initialize".to_string());
        let mask = EventInterest::startup(self.services.config.track_allocations);
        self.tracker.set_tolerate_orphans(false);
        self.enter(host, mask, LifecycleState::Initialized, "initialize")
    }

    /// Late-attach path: the process has been running for an unknown time.
    ///
    /// The client blob is opaque; only its size is logged.
    ///
    /// # Errors
    /// `InvalidState` unless freshly created, `CapabilityMissing` or
    /// `InterestRejected` from the host
    pub fn initialize_for_attach(
        &self,
        host: &dyn HostInfoProvider,
        client_data: &[u8],
    ) -> Result<(), SinkError> {
        self.log(Severity::Info, || {
            format!("InitializeForAttach ({} bytes of client data)", client_data.len())
        });
        let mask = EventInterest::for_attach();
        // Anything in flight at attach time started before we were listening
        self.tracker.set_tolerate_orphans(true);
        self.enter(host, mask, LifecycleState::Attached, "initialize_for_attach")?;
        self.log(Severity::Info, || format!("Attached to process {}", std::process::id()));
        Ok(())
    }

    fn enter(
        &self,
        host: &dyn HostInfoProvider,
        mask: EventInterest,
        target: LifecycleState,
        operation: &'static str,
    ) -> Result<(), SinkError> {
        self.ensure_live()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != LifecycleState::Created {
            return Err(SinkError::InvalidState { state: *state, operation });
        }

        let info = host.query_info(iid::PROFILER_INFO_3).map_err(|status| {
            self.log(Severity::Error, || {
                format!("{operation}: host has no {} ({status})", iid::PROFILER_INFO_3)
            });
            SinkError::CapabilityMissing(status)
        })?;

        info.set_event_mask(mask).map_err(|status| {
            self.log(Severity::Error, || {
                format!("{operation}: SetEventMask(0x{:x}) failed ({status})", mask.bits())
            });
            SinkError::InterestRejected { mask: mask.bits(), status }
        })?;

        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
        self.interest.store(mask.bits(), Ordering::Release);
        *state = target;
        Ok(())
    }

    /// Release the info capability and stop accepting events.
    ///
    /// The logger is process-scoped and stays open.
    ///
    /// # Errors
    /// `InvalidState` unless initialized, `Released` after teardown
    pub fn shutdown(&self) -> Result<(), SinkError> {
        self.ensure_live()?;
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.accepts_events() {
                return Err(SinkError::InvalidState { state: *state, operation: "shutdown" });
            }
            *state = LifecycleState::ShuttingDown;
        }

        for (kind, subject) in self.tracker.outstanding() {
            self.log(Severity::Warning, || {
                format!("{kind} for {subject} started but never finished")
            });
        }
        let frames = self.tracker.open_frames();
        if frames > 0 {
            self.log(Severity::Warning, || {
                format!("{frames} exception frames entered but never left")
            });
        }
        for line in self.analysis.summary() {
            self.log(Severity::Info, || line);
        }

        let stats = self.stats.snapshot();
        self.log(Severity::Info, || {
            format!(
                "Profiler shutdown (PID={}): {} events, {} handled, {} ordering violations",
                std::process::id(),
                stats.dispatched,
                stats.handled,
                stats.violations
            )
        });

        self.info.write().unwrap_or_else(PoisonError::into_inner).take();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = LifecycleState::Terminated;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Deliver one event. Safe to call from many threads at once.
    ///
    /// # Errors
    /// `Released`, `InvalidState` outside initialize..shutdown,
    /// `EventAboveInterface` for an event newer than the negotiated callback
    /// interface, and `SequenceViolation` when strict sequencing is on
    pub fn dispatch(&self, event: &RuntimeEvent) -> Result<Reply, SinkError> {
        self.ensure_live()?;
        let state = self.state();
        if !state.accepts_events() {
            return Err(SinkError::InvalidState { state, operation: "dispatch" });
        }

        // A sink nobody has queried for a callback interface is not bound to one
        let negotiated = self.interface_version();
        let required = event.kind().min_interface_version();
        if negotiated > 0 && required > negotiated {
            return Err(SinkError::EventAboveInterface { kind: event.kind(), required, negotiated });
        }

        if let Some(pairing) = event.pairing() {
            if let Err(violation) = self.tracker.observe(pairing) {
                self.stats.record_violation();
                self.log(Severity::Warning, || format!("Ordering violation: {violation}"));
                if self.services.config.strict_sequencing {
                    return Err(violation.into());
                }
            }
        }

        let handled = handlers::handle(self, event);
        self.stats.record_dispatch(handled.is_some());
        match handled {
            Some(reply) => Ok(reply),
            None => {
                if let Some(status) = event.status().filter(|status| !status.is_success()) {
                    self.log(Severity::Warning, || format!("{} failed ({status})", event.kind()));
                }
                Ok(Reply::default_for(event.kind()))
            }
        }
    }

    /// Ask the host to unload this sink.
    ///
    /// # Errors
    /// `InvalidState` outside initialize..shutdown, `DetachRefused` with the
    /// host status
    pub fn request_detach(&self) -> Result<(), SinkError> {
        self.ensure_live()?;
        let state = self.state();
        let info = match self.info() {
            Some(info) if state.accepts_events() => info,
            _ => return Err(SinkError::InvalidState { state, operation: "request_detach" }),
        };
        info.request_detach(DETACH_COMPLETION).map_err(|status| {
            self.log(Severity::Warning, || format!("Detach request refused ({status})"));
            SinkError::DetachRefused(status)
        })?;
        self.log(Severity::Info, || "Detach requested".to_string());
        Ok(())
    }

    /// Request a detach after `delay` from a helper thread, or right away
    fn schedule_detach(&self, delay: Duration) {
        if delay.is_zero() {
            let _ = self.request_detach();
            return;
        }
        let Some(info) = self.info() else {
            return;
        };
        let logger = Arc::clone(&self.services.logger);
        let spawned = thread::Builder::new().name("clrscope-detach".to_string()).spawn(move || {
            thread::sleep(delay);
            match info.request_detach(DETACH_COMPLETION) {
                Ok(()) => logger.log(Severity::Info, "Detach requested"),
                Err(status) => {
                    logger.log(Severity::Warning, &format!("Detach request refused ({status})"));
                }
            }
        });
        if let Err(e) = spawned {
            self.log(Severity::Warning, || format!("Cannot schedule detach: {e}"));
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &PairingTracker {
        &self.tracker
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Exceptions, allocations and pauses aggregated so far
    #[must_use]
    pub fn analysis(&self) -> AnalysisSnapshot {
        self.analysis.snapshot()
    }

    #[must_use]
    pub fn services(&self) -> &SinkServices {
        &self.services
    }

    fn info(&self) -> Option<Arc<dyn ProfilerInfo>> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn log(&self, severity: Severity, message: impl FnOnce() -> String) {
        if severity >= self.services.config.min_severity {
            self.services.logger.log(severity, &message());
        }
    }
}

/// Counted reference to the sink obtained through `query_interface`.
///
/// Dropping it releases the reference; `release` does the same and reports
/// the remaining count.
pub struct InterfaceRef {
    iid: Guid,
    sink: Arc<EventSink>,
    released: bool,
}

impl InterfaceRef {
    #[must_use]
    pub fn iid(&self) -> Guid {
        self.iid
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<EventSink> {
        &self.sink
    }

    /// # Errors
    /// `Released` if the sink was already torn down
    pub fn release(mut self) -> Result<u32, SinkError> {
        self.released = true;
        self.sink.release()
    }
}

impl Deref for InterfaceRef {
    type Target = EventSink;

    fn deref(&self) -> &EventSink {
        &self.sink
    }
}

impl Drop for InterfaceRef {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.sink.release();
        }
    }
}

impl std::fmt::Debug for InterfaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRef")
            .field("iid", &identity::describe(self.iid))
            .field("refs", &self.sink.ref_count())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;
    use crate::naming::NullResolver;
    use crate::sink::events::EventKind;
    use crate::sink::testing::*;
    use clrscope_common::{ClassId, FunctionId, HResult, ModuleId, ThreadId};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn teardowns(logger: &MemoryLogger) -> usize {
        logger.records().iter().filter(|r| r.message == "Event sink released").count()
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CLRSCOPE_TRACK_ALLOCATIONS", "off"),
            ("CLRSCOPE_STRICT_SEQUENCING", "1"),
            ("CLRSCOPE_LOG_LEVEL", "debug"),
            ("CLRSCOPE_LOG_FILE", "/tmp/clrscope.log"),
            ("CLRSCOPE_DETACH_AFTER_MS", "250"),
        ]);
        let config = SinkConfig::from_lookup(|k| vars.get(k).map(ToString::to_string));
        assert!(!config.track_allocations);
        assert!(config.strict_sequencing);
        assert_eq!(config.min_severity, Severity::Debug);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/clrscope.log")));
        assert_eq!(config.detach_after, Some(Duration::from_millis(250)));

        let malformed = |key: &str| match key {
            "CLRSCOPE_TRACK_ALLOCATIONS" => Some("maybe".to_string()),
            "CLRSCOPE_DETACH_AFTER_MS" => Some("soon".to_string()),
            _ => None,
        };
        assert_eq!(SinkConfig::from_lookup(malformed), SinkConfig::default());
    }

    #[test]
    fn test_query_interface_family() {
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        for id in identity::supported() {
            let iface = sink.query_interface(id).unwrap();
            assert_eq!(iface.iid(), id);
            assert_eq!(sink.ref_count(), 2);
            assert_eq!(iface.release().unwrap(), 1);
        }

        for id in [iid::CALLBACK_10, iid::CLASS_FACTORY] {
            assert_eq!(sink.query_interface(id).unwrap_err(), SinkError::NotSupported(id));
        }
        assert_eq!(sink.query_interface(Guid::ZERO).unwrap_err(), SinkError::NullInterfaceQuery);
        assert_eq!(sink.ref_count(), 1);
        assert_eq!(sink.interface_version(), identity::IMPLEMENTED_VERSION);
    }

    #[test]
    fn test_refcount_balance_and_teardown_once() {
        let (sink, logger) = sink_with(Arc::new(NullResolver), verbose());
        assert_eq!(sink.retain().unwrap(), 2);
        assert_eq!(sink.retain().unwrap(), 3);
        assert_eq!(sink.release().unwrap(), 2);
        assert_eq!(sink.release().unwrap(), 1);
        assert_eq!(sink.release().unwrap(), 0);

        assert_eq!(sink.release().unwrap_err(), SinkError::Released);
        assert_eq!(sink.retain().unwrap_err(), SinkError::Released);
        assert_eq!(sink.query_interface(iid::CALLBACK).unwrap_err(), SinkError::Released);
        assert_eq!(sink.ref_count(), 0);
        assert_eq!(teardowns(&logger), 1);
    }

    #[test]
    fn test_concurrent_retain_release_tears_down_once() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;
        let (sink, logger) = sink_with(Arc::new(NullResolver), verbose());

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        sink.retain().unwrap();
                    }
                    for _ in 0..ROUNDS {
                        sink.release().unwrap();
                    }
                });
            }
        });
        assert_eq!(sink.ref_count(), 1);
        assert_eq!(teardowns(&logger), 0);

        // Each thread drops one reference it owns; exactly one sees zero
        for _ in 1..THREADS {
            sink.retain().unwrap();
        }
        let reached_zero = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    if sink.release() == Ok(0) {
                        reached_zero.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(reached_zero.load(Ordering::SeqCst), 1);
        assert_eq!(sink.ref_count(), 0);
        assert_eq!(teardowns(&logger), 1);
        assert_eq!(sink.retain(), Err(SinkError::Released));
    }

    #[test]
    fn test_concurrent_dispatch_keeps_exact_counts() {
        const THREADS: u64 = 8;
        const ROUNDS: u64 = 200;
        let host = FakeHost::new();
        let strict = SinkConfig { strict_sequencing: true, ..SinkConfig::default() };
        let (sink, _) = sink_with(Arc::new(NullResolver), strict);
        sink.initialize(&host).unwrap();

        thread::scope(|scope| {
            for t in 0..THREADS {
                let sink = &sink;
                scope.spawn(move || {
                    for round in 0..ROUNDS {
                        let class = ClassId(t * ROUNDS + round + 1);
                        let function = FunctionId(round);
                        let events = [
                            RuntimeEvent::ThreadCreated { thread: ThreadId(t) },
                            RuntimeEvent::JitInlining { caller: function, callee: function },
                            RuntimeEvent::ClassLoadStarted { class },
                            RuntimeEvent::ExceptionSearchFunctionEnter { function },
                            RuntimeEvent::ExceptionSearchFunctionLeave,
                            RuntimeEvent::ClassLoadFinished { class, status: HResult::S_OK },
                        ];
                        for event in &events {
                            sink.dispatch(event).unwrap();
                        }
                    }
                });
            }
        });

        let per_kind = THREADS * ROUNDS;
        let stats = sink.stats();
        assert_eq!(stats.dispatched, 6 * per_kind);
        assert_eq!(stats.handled, 3 * per_kind);
        assert_eq!(stats.defaulted, 3 * per_kind);
        assert_eq!(stats.violations, 0);
        assert!(sink.tracker().outstanding().is_empty());
        assert_eq!(sink.tracker().open_frames(), 0);
    }

    #[test]
    fn test_dropped_interface_releases() {
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        {
            let _iface = sink.query_interface(iid::CALLBACK_9).unwrap();
            assert_eq!(sink.ref_count(), 2);
        }
        assert_eq!(sink.ref_count(), 1);
    }

    #[test]
    fn test_initialize_writes_startup_mask() {
        let host = FakeHost::new();
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        sink.initialize(&host).unwrap();

        assert_eq!(sink.state(), LifecycleState::Initialized);
        assert_eq!(host.masks(), vec![EventInterest::startup(true)]);
        assert_eq!(sink.interest(), EventInterest::startup(true));
        assert!(!sink.tracker().tolerates_orphans());
    }

    #[test]
    fn test_initialize_without_allocations() {
        let host = FakeHost::new();
        let config = SinkConfig { track_allocations: false, ..SinkConfig::default() };
        let (sink, _) = sink_with(Arc::new(NullResolver), config);
        sink.initialize(&host).unwrap();
        assert_eq!(host.masks(), vec![EventInterest::STARTUP]);
    }

    #[test]
    fn test_attach_mask_is_strict_subset() {
        for track_allocations in [true, false] {
            let host = FakeHost::new();
            let config = SinkConfig { track_allocations, ..SinkConfig::default() };
            let (sink, _) = sink_with(Arc::new(NullResolver), config);
            sink.initialize_for_attach(&host, &[]).unwrap();

            let attach = host.masks()[0];
            let startup = EventInterest::startup(true);
            assert!(startup.contains(attach) && attach != startup);
            assert!(!attach.intersects(EventInterest::ALLOCATIONS));
            assert_eq!(sink.state(), LifecycleState::Attached);
            assert!(sink.tracker().tolerates_orphans());
        }
    }

    #[test]
    fn test_missing_capability_is_fatal() {
        let host = FakeHost { info: None };
        let (sink, logger) = sink_with(Arc::new(NullResolver), SinkConfig::default());

        assert_eq!(
            sink.initialize(&host).unwrap_err(),
            SinkError::CapabilityMissing(HResult::E_NOINTERFACE)
        );
        assert_eq!(sink.state(), LifecycleState::Created);
        assert!(logger.messages(Severity::Error).iter().any(|m| m.contains("initialize")));
    }

    #[test]
    fn test_rejected_mask_is_surfaced() {
        let info = FakeInfo { reject_mask: Some(HResult::E_INVALIDARG), ..FakeInfo::default() };
        let host = FakeHost { info: Some(Arc::new(info)) };
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());

        let err = sink.initialize_for_attach(&host, b"cfg").unwrap_err();
        assert!(matches!(err, SinkError::InterestRejected { status: HResult::E_INVALIDARG, .. }));
        assert_eq!(err.status(), HResult::E_INVALIDARG);
        assert_eq!(sink.state(), LifecycleState::Created);
    }

    #[test]
    fn test_lifecycle_misuse() {
        let host = FakeHost::new();
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());

        assert!(matches!(
            sink.shutdown(),
            Err(SinkError::InvalidState { state: LifecycleState::Created, .. })
        ));
        assert!(matches!(
            sink.dispatch(&RuntimeEvent::GarbageCollectionFinished),
            Err(SinkError::InvalidState { .. })
        ));

        sink.initialize(&host).unwrap();
        assert!(matches!(
            sink.initialize_for_attach(&host, &[]),
            Err(SinkError::InvalidState { .. })
        ));

        sink.shutdown().unwrap();
        assert_eq!(sink.state(), LifecycleState::Terminated);
        assert!(matches!(
            sink.shutdown(),
            Err(SinkError::InvalidState { state: LifecycleState::Terminated, .. })
        ));
    }

    #[test]
    fn test_default_replies() {
        let host = FakeHost::new();
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        sink.initialize(&host).unwrap();

        let (caller, callee) = (FunctionId(1), FunctionId(2));
        let reply = sink.dispatch(&RuntimeEvent::JitInlining { caller, callee });
        assert_eq!(reply, Ok(Reply::ShouldInline(true)));
        let search = RuntimeEvent::JitCachedFunctionSearchStarted { function: caller };
        let reply = sink.dispatch(&search);
        assert_eq!(reply, Ok(Reply::UseCachedCode(true)));
        let reply = sink.dispatch(&RuntimeEvent::RootReferences { roots: vec![] });
        assert_eq!(reply, Ok(Reply::Ack));

        let stats = sink.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.defaulted, 3);
    }

    #[test]
    fn test_failed_completion_on_default_path_warns() {
        let host = FakeHost::new();
        let (sink, logger) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        sink.initialize(&host).unwrap();

        sink.dispatch(&RuntimeEvent::ModuleLoadStarted { module: ModuleId(0x40) }).unwrap();
        let failed =
            RuntimeEvent::ModuleLoadFinished { module: ModuleId(0x40), status: HResult::E_FAIL };
        assert_eq!(sink.dispatch(&failed), Ok(Reply::Ack));

        let warnings = logger.messages(Severity::Warning);
        assert!(warnings.iter().any(|m| m.starts_with("ModuleLoadFinished failed")));
        assert_eq!(sink.stats().defaulted, 2);
    }

    #[test]
    fn test_events_above_negotiated_interface() {
        let host = FakeHost::new();
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        let v3 = sink.query_interface(iid::CALLBACK_3).unwrap();
        sink.initialize(&host).unwrap();

        let unloaded = RuntimeEvent::DynamicMethodUnloaded { function: FunctionId(4) };
        assert_eq!(
            sink.dispatch(&unloaded),
            Err(SinkError::EventAboveInterface {
                kind: EventKind::DynamicMethodUnloaded,
                required: 9,
                negotiated: 3
            })
        );
        assert_eq!(sink.dispatch(&RuntimeEvent::ProfilerAttachComplete), Ok(Reply::Ack));

        let v9 = sink.query_interface(iid::CALLBACK_9).unwrap();
        assert_eq!(sink.interface_version(), 9);
        assert_eq!(sink.dispatch(&unloaded), Ok(Reply::Ack));
        drop((v3, v9));
    }

    #[test]
    fn test_violations_counted_or_fatal() {
        let host = FakeHost::new();
        let (sink, logger) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        sink.initialize(&host).unwrap();

        let orphan = RuntimeEvent::ClassLoadFinished { class: ClassId(3), status: HResult::S_OK };
        assert!(sink.dispatch(&orphan).is_ok());
        assert_eq!(sink.stats().violations, 1);
        assert!(logger.contains("Ordering violation"));

        let strict = SinkConfig { strict_sequencing: true, ..SinkConfig::default() };
        let (sink, _) = sink_with(Arc::new(NullResolver), strict);
        sink.initialize(&host).unwrap();
        assert!(matches!(sink.dispatch(&orphan), Err(SinkError::SequenceViolation(_))));
    }

    #[test]
    fn test_shutdown_reports_unfinished_pairs() {
        let host = FakeHost::new();
        let (sink, logger) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        sink.initialize(&host).unwrap();
        sink.dispatch(&RuntimeEvent::ModuleLoadStarted { module: ModuleId(0x40) }).unwrap();

        assert_eq!(sink.tracker().outstanding().len(), 1);
        sink.shutdown().unwrap();
        assert!(logger.contains("ModuleLoad for 0x40 started but never finished"));
    }

    #[test]
    fn test_release_before_shutdown_still_tears_down() {
        let host = FakeHost::new();
        let (sink, logger) = sink_with(Arc::new(NullResolver), SinkConfig::default());
        sink.initialize(&host).unwrap();
        assert_eq!(sink.release().unwrap(), 0);
        assert!(logger.contains("shutdown was never called"));
        assert_eq!(
            sink.dispatch(&RuntimeEvent::GarbageCollectionFinished),
            Err(SinkError::Released)
        );
    }

    #[test]
    fn test_detach_requested_on_attach_complete() {
        let host = FakeHost::new();
        let config = SinkConfig { detach_after: Some(Duration::ZERO), ..SinkConfig::default() };
        let (sink, logger) = sink_with(Arc::new(NullResolver), config);
        sink.initialize_for_attach(&host, &[]).unwrap();

        sink.dispatch(&RuntimeEvent::ProfilerAttachComplete).unwrap();
        assert_eq!(host.detaches(), vec![DETACH_COMPLETION]);
        assert!(logger.contains("Detach requested"));

        sink.dispatch(&RuntimeEvent::ProfilerDetachSucceeded).unwrap();
        assert!(logger.contains("Profiler detach succeeded"));
        sink.shutdown().unwrap();
    }

    #[test]
    fn test_delayed_detach_runs_on_helper_thread() {
        let host = FakeHost::new();
        let delay = Duration::from_millis(20);
        let config = SinkConfig { detach_after: Some(delay), ..SinkConfig::default() };
        let (sink, _) = sink_with(Arc::new(NullResolver), config);
        sink.initialize_for_attach(&host, &[]).unwrap();

        let started = Instant::now();
        sink.dispatch(&RuntimeEvent::ProfilerAttachComplete).unwrap();
        assert!(host.detaches().is_empty());

        while host.detaches().is_empty() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(host.detaches(), vec![DETACH_COMPLETION]);
        assert!(started.elapsed() >= delay);
    }

    #[test]
    fn test_refused_detach() {
        let info = FakeInfo { reject_detach: Some(HResult::E_FAIL), ..FakeInfo::default() };
        let host = FakeHost { info: Some(Arc::new(info)) };
        let (sink, _) = sink_with(Arc::new(NullResolver), SinkConfig::default());

        assert!(matches!(sink.request_detach(), Err(SinkError::InvalidState { .. })));
        sink.initialize_for_attach(&host, &[]).unwrap();
        assert_eq!(sink.request_detach(), Err(SinkError::DetachRefused(HResult::E_FAIL)));
    }
}
