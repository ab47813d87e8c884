//! Error classification driving retry and failover decisions.
//!
//! Classification is a pure function of the error: an ordered rule table is
//! evaluated top to bottom and the first matching rule wins.
//!
//! | Order | Match | Type | Severity | Retryable |
//! |-------|-------|------|----------|-----------|
//! | 1 | `<providerMethod> is not a function` | `provider_method` | critical | no |
//! | 2 | `substring is not a function`, JSON parse failures | `response_parsing` | high | yes |
//! | 3 | `ECONNREFUSED`, `ENOTFOUND`, refused connections | `network_error` | medium | yes |
//! | 4 | `timeout`, `timed out`, `ETIMEDOUT` | `timeout` | medium | yes |
//! | 5 | HTTP 429, "rate limit" | `rate_limit` | medium | yes |
//! | 6 | HTTP 401/403 | `authentication` | high | no |
//! | 7 | missing configuration | `configuration` | high | no |
//! | 8 | validation failures | `validation` | medium | yes |
//! | 9 | HTTP >= 500 | `provider_error` | medium | yes |
//! | 10 | anything else | `unknown` | medium | yes |

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;

/// Error taxonomy shared by the retry system, health history, and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ResponseParsing,
    ProviderMethod,
    NetworkError,
    Timeout,
    RateLimit,
    Authentication,
    ProviderError,
    Configuration,
    Validation,
    Unknown,
}

impl ErrorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResponseParsing => "response_parsing",
            Self::ProviderMethod => "provider_method",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::ProviderError => "provider_error",
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    /// Multiplier applied to the retry backoff for this error type.
    pub const fn backoff_multiplier(self) -> f64 {
        match self {
            Self::RateLimit => 2.0,
            Self::Timeout => 1.5,
            Self::NetworkError => 1.2,
            Self::ResponseParsing => 0.8,
            _ => 1.0,
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery path suggested for a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Retry the same provider after exponential backoff.
    RetryWithBackoff,
    /// Retry once the upstream-advertised delay has elapsed.
    RetryAfterDelay,
    /// Re-run the response pipeline fallbacks; the provider is fine.
    RepairResponse,
    /// Move to the next provider without spending retries.
    SwitchProvider,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub retryable: bool,
    pub recoverable: bool,
    pub strategy: RecoveryStrategy,
    pub suggested_backoff_multiplier: f64,
    /// Upstream `Retry-After` hint, when one was sent.
    pub retry_after: Option<Duration>,
}

impl ErrorClassification {
    fn new(error_type: ErrorType, severity: Severity, retryable: bool) -> Self {
        let recoverable = !matches!(
            error_type,
            ErrorType::ProviderMethod | ErrorType::Authentication | ErrorType::Configuration
        );
        let strategy = if !retryable {
            RecoveryStrategy::SwitchProvider
        } else if error_type == ErrorType::ResponseParsing {
            RecoveryStrategy::RepairResponse
        } else {
            RecoveryStrategy::RetryWithBackoff
        };

        Self {
            error_type,
            severity,
            retryable,
            recoverable,
            strategy,
            suggested_backoff_multiplier: error_type.backoff_multiplier(),
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        if retry_after.is_some() {
            self.strategy = RecoveryStrategy::RetryAfterDelay;
        }
        self.retry_after = retry_after;
        self
    }
}

/// Provider capability methods; calling a missing one is a wiring bug.
const PROVIDER_METHODS: &[&str] = &[
    "generateDream",
    "generate_dream",
    "testConnection",
    "test_connection",
    "generate",
    "complete",
    "chat",
];

static NOT_A_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_$][\w$]*)\s+is not a function").expect("static pattern is valid")
});

static PARSE_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)substring is not a function|unexpected token|unexpected end of (json )?input|json\s*(\.parse|parse|parsing|decode)|invalid json|not valid json|expected value at line|eof while parsing|trailing comma",
    )
    .expect("static pattern is valid")
});

static NETWORK_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)econnrefused|enotfound|econnreset|connection refused|connection failed|connection reset|dns error")
        .expect("static pattern is valid")
});

static TIMEOUT_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)timeout|timed out|etimedout").expect("static pattern is valid")
});

static RATE_LIMIT_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate limit|too many requests|quota exceeded").expect("static pattern is valid")
});

static CONFIGURATION_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)not configured|missing api key|invalid configuration|unknown model")
        .expect("static pattern is valid")
});

static VALIDATION_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)validation failed|schema violation|pipeline_failure")
        .expect("static pattern is valid")
});

/// Classify a provider error. Pure: the same error always yields the same
/// classification.
pub fn classify(error: &ProviderError) -> ErrorClassification {
    let message = error.message();
    let code = error.code().unwrap_or_default();
    let haystack = format!("{code} {message}");

    if let Some(captures) = NOT_A_FUNCTION.captures(message) {
        let callee = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if PROVIDER_METHODS.contains(&callee) {
            return ErrorClassification::new(ErrorType::ProviderMethod, Severity::Critical, false);
        }
    }

    if PARSE_FAILURE.is_match(message) {
        return ErrorClassification::new(ErrorType::ResponseParsing, Severity::High, true);
    }

    if NETWORK_FAILURE.is_match(&haystack) {
        return ErrorClassification::new(ErrorType::NetworkError, Severity::Medium, true);
    }

    if TIMEOUT_FAILURE.is_match(&haystack) {
        return ErrorClassification::new(ErrorType::Timeout, Severity::Medium, true);
    }

    let status = error.status();
    if status == Some(429) || RATE_LIMIT_FAILURE.is_match(message) {
        return ErrorClassification::new(ErrorType::RateLimit, Severity::Medium, true)
            .with_retry_after(retry_after(error));
    }

    if matches!(status, Some(401) | Some(403)) {
        return ErrorClassification::new(ErrorType::Authentication, Severity::High, false);
    }

    if code.eq_ignore_ascii_case("configuration") || CONFIGURATION_FAILURE.is_match(message) {
        return ErrorClassification::new(ErrorType::Configuration, Severity::High, false);
    }

    if code.eq_ignore_ascii_case("validation") || VALIDATION_FAILURE.is_match(&haystack) {
        return ErrorClassification::new(ErrorType::Validation, Severity::Medium, true);
    }

    if status.is_some_and(|status| status >= 500) {
        return ErrorClassification::new(ErrorType::ProviderError, Severity::Medium, true);
    }

    ErrorClassification::new(ErrorType::Unknown, Severity::Medium, true)
}

/// Longest `Retry-After` taken from an upstream header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(86_400);

/// Parse `Retry-After` given in delta-seconds, capped at [`MAX_RETRY_AFTER`].
fn retry_after(error: &ProviderError) -> Option<Duration> {
    let value = error.header("retry-after")?.trim();
    let delay = match value.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => value
            .parse::<f64>()
            .ok()
            .filter(|seconds| *seconds >= 0.0)
            .map(|seconds| Duration::try_from_secs_f64(seconds).unwrap_or(MAX_RETRY_AFTER))?,
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Keys never copied into logs or failure history.
const SENSITIVE_KEYS: &[&str] = &["password", "token", "key", "secret", "authorization"];

/// Longest string kept verbatim in sanitized context.
pub const MAX_CONTEXT_FIELD_LEN: usize = 500;

const MAX_CONTEXT_ARRAY_LEN: usize = 20;
const MAX_CONTEXT_DEPTH: usize = 6;

/// Strip sensitive keys and truncate large payload fields.
pub fn sanitize_context(context: &Value) -> Value {
    sanitize_value(context, 0)
}

fn sanitize_value(value: &Value, depth: usize) -> Value {
    if depth >= MAX_CONTEXT_DEPTH {
        return Value::String(String::from("[truncated: depth]"));
    }

    match value {
        Value::Object(map) => {
            let mut clean = Map::with_capacity(map.len());
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    continue;
                }
                clean.insert(key.clone(), sanitize_value(nested, depth + 1));
            }
            Value::Object(clean)
        }
        Value::Array(items) => {
            let mut clean = items
                .iter()
                .take(MAX_CONTEXT_ARRAY_LEN)
                .map(|item| sanitize_value(item, depth + 1))
                .collect::<Vec<_>>();
            if items.len() > MAX_CONTEXT_ARRAY_LEN {
                clean.push(Value::String(format!(
                    "[truncated: {} more item(s)]",
                    items.len() - MAX_CONTEXT_ARRAY_LEN
                )));
            }
            Value::Array(clean)
        }
        Value::String(text) => Value::String(truncate_field(text)),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lowered.contains(needle))
}

fn truncate_field(text: &str) -> String {
    let total = text.chars().count();
    if total <= MAX_CONTEXT_FIELD_LEN {
        return text.to_owned();
    }
    let kept = text.chars().take(MAX_CONTEXT_FIELD_LEN).collect::<String>();
    format!("{kept}...[truncated {} chars]", total - MAX_CONTEXT_FIELD_LEN)
}
