use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::classification::ErrorType;
use crate::context::SwitchRecord;
use crate::pipeline::{PipelineMetadata, Stage};

/// Raw failure reported by a provider call.
///
/// This is what operations hand back to the retry system. It carries the
/// pieces the classifier inspects: message, an optional error code such as
/// `ECONNREFUSED`, an optional HTTP status, and lower-cased response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    message: String,
    code: Option<String>,
    status: Option<u16>,
    headers: BTreeMap<String, String>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
            headers: BTreeMap::new(),
        }
    }

    /// Upstream answered with a non-success HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message).with_code("ETIMEDOUT")
    }

    pub fn connection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(message).with_code(code)
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::http(429, "too many requests")
            .with_header("retry-after", retry_after_secs.to_string())
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value);
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {status})")?;
        }
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {}

/// Aggregated failure returned once every candidate provider has been tried.
#[derive(Debug, Clone, Error)]
#[error(
    "request '{request_id}' failed after {total_attempts} attempt(s) and {provider_switches} provider switch(es); last error ({last_error_type}): {last_error}"
)]
pub struct ExhaustedError {
    pub request_id: String,
    pub total_attempts: u32,
    pub provider_switches: u32,
    pub last_error: String,
    pub last_error_type: ErrorType,
    pub last_provider: Option<String>,
    pub switch_history: Vec<SwitchRecord>,
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid provider: {reason}")]
    InvalidProvider { reason: String },

    #[error("provider '{name}' is not registered")]
    ProviderNotFound { name: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Exhausted(#[from] ExhaustedError),

    #[error("request '{request_id}' was cancelled after {total_attempts} attempt(s)")]
    Cancelled {
        request_id: String,
        total_attempts: u32,
        provider_switches: u32,
    },

    #[error("request '{request_id}' exceeded its deadline after {total_attempts} attempt(s)")]
    DeadlineExceeded {
        request_id: String,
        total_attempts: u32,
        provider_switches: u32,
    },

    #[error("response processing failed at stage '{stage}': {message}")]
    Pipeline {
        stage: Stage,
        message: String,
        metadata: Box<PipelineMetadata>,
    },

    #[error("provider health probe failed for '{name}': {source}")]
    HealthProbe {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("toml decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("toml encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

impl CoreError {
    pub fn invalid_provider(reason: impl Into<String>) -> Self {
        Self::InvalidProvider {
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Attempts and switches spent before the error, when the error came out
    /// of a fallback run.
    pub fn attempt_summary(&self) -> Option<(u32, u32)> {
        match self {
            Self::Exhausted(error) => Some((error.total_attempts, error.provider_switches)),
            Self::Cancelled {
                total_attempts,
                provider_switches,
                ..
            }
            | Self::DeadlineExceeded {
                total_attempts,
                provider_switches,
                ..
            } => Some((*total_attempts, *provider_switches)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let error = ProviderError::http(429, "slow down").with_header("Retry-After", "60");

        assert_eq!(error.header("retry-after"), Some("60"));
        assert_eq!(error.header("RETRY-AFTER"), Some("60"));
        assert_eq!(error.status(), Some(429));
    }

    #[test]
    fn display_includes_status_and_code() {
        let error = ProviderError::connection("ECONNREFUSED", "connect failed").with_status(503);

        assert_eq!(error.to_string(), "connect failed (status 503) [ECONNREFUSED]");
    }

    #[test]
    fn exhausted_message_reports_attempts_switches_and_last_error() {
        let error = ExhaustedError {
            request_id: String::from("req-1"),
            total_attempts: 4,
            provider_switches: 1,
            last_error: String::from("boom"),
            last_error_type: ErrorType::ProviderError,
            last_provider: Some(String::from("beta")),
            switch_history: Vec::new(),
        };

        let message = error.to_string();
        assert!(message.contains("4 attempt(s)"));
        assert!(message.contains("1 provider switch(es)"));
        assert!(message.contains("provider_error"));
        assert!(message.contains("boom"));
        assert_eq!(CoreError::from(error).attempt_summary(), Some((4, 1)));
    }
}
