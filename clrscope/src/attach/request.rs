//! Attach request construction and validation

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clrscope_common::{Guid, SINK_COMPONENT_ID};

use crate::domain::{ProcessTarget, RequestError};

/// Default wait for the target to load the component
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// What to do when the runtime is not seen in the target before attaching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PresenceCheck {
    /// Do not look
    Skip,
    /// Log a warning and attach anyway
    #[default]
    Warn,
    /// Fail with `RuntimeNotPresentInProcess`
    Strict,
}

/// One attach attempt, validated at construction and immutable afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    target: ProcessTarget,
    runtime_version: String,
    component: Guid,
    code_path: PathBuf,
    timeout: Duration,
    client_data: Vec<u8>,
    presence: PresenceCheck,
}

impl AttachRequest {
    #[must_use]
    pub fn builder() -> AttachRequestBuilder {
        AttachRequestBuilder::default()
    }

    #[must_use]
    pub fn target(&self) -> &ProcessTarget {
        &self.target
    }

    #[must_use]
    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    #[must_use]
    pub fn component(&self) -> Guid {
        self.component
    }

    #[must_use]
    pub fn code_path(&self) -> &Path {
        &self.code_path
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn client_data(&self) -> &[u8] {
        &self.client_data
    }

    #[must_use]
    pub fn presence(&self) -> PresenceCheck {
        self.presence
    }
}

#[derive(Debug, Default)]
pub struct AttachRequestBuilder {
    target: Option<ProcessTarget>,
    runtime_version: Option<String>,
    component: Option<Guid>,
    code_path: Option<PathBuf>,
    timeout: Option<Duration>,
    client_data: Vec<u8>,
    presence: PresenceCheck,
}

impl AttachRequestBuilder {
    #[must_use]
    pub fn target(mut self, target: impl Into<ProcessTarget>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    /// Defaults to the clrscope sink when not set
    #[must_use]
    pub fn component(mut self, component: Guid) -> Self {
        self.component = Some(component);
        self
    }

    /// Parse a component id in registry form, with or without braces
    ///
    /// # Errors
    /// `InvalidComponentId` when the text is not a GUID
    pub fn component_str(self, component: &str) -> Result<Self, RequestError> {
        let trimmed = component.trim().trim_start_matches('{').trim_end_matches('}');
        let guid = Guid::from_str(trimmed)
            .map_err(|_| RequestError::InvalidComponentId(component.to_string()))?;
        Ok(self.component(guid))
    }

    #[must_use]
    pub fn code_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn client_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.client_data = data.into();
        self
    }

    #[must_use]
    pub fn presence(mut self, presence: PresenceCheck) -> Self {
        self.presence = presence;
        self
    }

    /// # Errors
    /// The first invalid or missing field
    pub fn build(self) -> Result<AttachRequest, RequestError> {
        let target = self.target.ok_or(RequestError::MissingField("target"))?;
        let runtime_version =
            self.runtime_version.ok_or(RequestError::MissingField("runtime_version"))?;
        let code_path = self.code_path.ok_or(RequestError::MissingField("code_path"))?;

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(RequestError::ZeroTimeout);
        }
        if !code_path.is_absolute() {
            return Err(RequestError::RelativeComponentPath(code_path));
        }
        let component = self.component.unwrap_or(SINK_COMPONENT_ID);
        if component == Guid::ZERO {
            return Err(RequestError::NilComponentId);
        }

        Ok(AttachRequest {
            target,
            runtime_version,
            component,
            code_path,
            timeout,
            client_data: self.client_data,
            presence: self.presence,
        })
    }
}
