//! Attach negotiation
//!
//! Drives one [`AttachRequest`] through the runtime host:
//!
//! ```text
//! Start -> ProcessResolved -> RuntimeResolved -> LoadabilityChecked
//!       -> (PresenceChecked) -> CapabilityObtained -> Attached
//! ```
//!
//! The first failing step ends the attempt. Nothing is retried and nothing is
//! kept between calls; the only blocking step is the attach call itself,
//! bounded by the request timeout.

pub mod request;

pub use request::{AttachRequest, AttachRequestBuilder, PresenceCheck, DEFAULT_TIMEOUT};

use log::{debug, error, info, warn};

use crate::domain::{AttachFailure, Pid};
use crate::process_lookup::ProcessLocator;
use crate::runtime::RuntimeHost;

/// Result of one attach attempt
pub type AttachOutcome = Result<Attached, AttachFailure>;

/// Successful attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub pid: Pid,
    pub runtime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum Stage {
    Start,
    ProcessResolved,
    RuntimeResolved,
    LoadabilityChecked,
    PresenceChecked,
    CapabilityObtained,
    Attached,
}

pub struct AttachNegotiator<'a> {
    locator: &'a dyn ProcessLocator,
    host: &'a dyn RuntimeHost,
}

impl<'a> AttachNegotiator<'a> {
    #[must_use]
    pub fn new(locator: &'a dyn ProcessLocator, host: &'a dyn RuntimeHost) -> Self {
        Self { locator, host }
    }

    /// Run one attach attempt
    ///
    /// # Errors
    /// The failure of the first step that did not succeed, with the host
    /// status that caused it when there is one
    pub fn attach(&self, request: &AttachRequest) -> AttachOutcome {
        advance(Stage::Start);
        let version = request.runtime_version();

        let process = self.locator.locate(request.target()).map_err(|e| {
            error!("Process lookup for {} failed: {e}", request.target());
            AttachFailure::ProcessNotFound {
                target: request.target().to_string(),
                reason: e.to_string(),
            }
        })?;
        let pid = process.pid();
        advance(Stage::ProcessResolved);

        let runtime = self.host.get_runtime(version).map_err(|e| {
            error!("Runtime lookup for {version} failed: {e}");
            AttachFailure::RuntimeNotLoadable { version: version.to_string(), status: None }
        })?;
        advance(Stage::RuntimeResolved);

        match runtime.info().is_loadable() {
            Ok(true) => {}
            Ok(false) => {
                error!("Runtime {version} is installed but cannot be loaded");
                return Err(AttachFailure::RuntimeNotLoadable {
                    version: version.to_string(),
                    status: None,
                });
            }
            Err(status) => {
                error!("IsLoadable for {version} failed: {status}");
                return Err(AttachFailure::RuntimeNotLoadable {
                    version: version.to_string(),
                    status: Some(status),
                });
            }
        }
        advance(Stage::LoadabilityChecked);

        if request.presence() != PresenceCheck::Skip {
            let (present, status) = match runtime.info().is_loaded_in(&process) {
                Ok(present) => (present, None),
                Err(status) => (false, Some(status)),
            };
            if !present {
                let failure = AttachFailure::RuntimeNotPresentInProcess {
                    version: version.to_string(),
                    pid,
                    status,
                };
                if request.presence() == PresenceCheck::Strict {
                    error!("{failure}");
                    return Err(failure);
                }
                warn!("{failure}, attaching anyway");
            }
            advance(Stage::PresenceChecked);
        }

        let transport = runtime.info().profiling_interface().map_err(|status| {
            error!("Runtime {version} has no attach interface: {status}");
            AttachFailure::InterfaceNotSupported { version: version.to_string(), status }
        })?;
        advance(Stage::CapabilityObtained);

        info!(
            "Attaching {} to {pid} (runtime {version}, timeout {}ms)",
            request.code_path().display(),
            request.timeout().as_millis()
        );
        transport
            .attach_profiler(
                pid,
                request.timeout(),
                request.component(),
                request.code_path(),
                request.client_data(),
            )
            .map_err(|status| {
                if status.is_timeout() {
                    error!("AttachProfiler to {pid} timed out: {status}");
                    AttachFailure::AttachTimedOut { pid, timeout: request.timeout(), status }
                } else {
                    error!("AttachProfiler to {pid} failed: {status}");
                    AttachFailure::AttachRejected { pid, status }
                }
            })?;
        advance(Stage::Attached);

        Ok(Attached { pid, runtime: runtime.version().to_string() })
    }
}

fn advance(stage: Stage) {
    debug!("attach: {stage}");
}
