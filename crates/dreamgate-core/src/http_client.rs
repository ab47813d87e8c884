//! Transport seam for HTTP-backed providers.
//!
//! Adapters build an [`HttpRequest`] and hand it to an [`HttpClient`]; tests
//! substitute a canned client. Transport failures come back as
//! [`HttpError`] and convert into [`ProviderError`]s the classifier
//! understands.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::ProviderError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Credentials attached to provider requests.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum HttpAuth {
    #[default]
    None,
    /// `authorization: Bearer <token>`
    BearerToken(String),
    /// Vendor key header such as `x-api-key`.
    ApiKeyHeader { name: String, key: String },
}

impl HttpAuth {
    pub const fn is_configured(&self) -> bool {
        !matches!(self, Self::None)
    }

    fn header(&self) -> Option<(String, String)> {
        match self {
            Self::None => None,
            Self::BearerToken(token) => Some((String::from("authorization"), format!("Bearer {token}"))),
            Self::ApiKeyHeader { name, key } => Some((name.to_ascii_lowercase(), key.clone())),
        }
    }
}

// Keys must never reach a log line.
impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
            Self::ApiKeyHeader { name, .. } => write!(f, "ApiKeyHeader({name}: <redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub json: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            json: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn post(url: impl Into<String>, json: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            json: Some(json),
            ..Self::get(url)
        }
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        if let Some((name, value)) = auth.header() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Response with lower-cased header names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, 200..=299)
    }

    /// Body as JSON, or as a JSON string when it does not parse.
    pub fn json_body(self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::String(self.body))
    }

    /// Status error carrying the upstream headers, so `Retry-After` reaches
    /// the classifier.
    pub fn into_provider_error(self, provider: &str) -> ProviderError {
        ProviderError::http(
            self.status,
            format!("provider '{provider}' returned HTTP {}", self.status),
        )
        .with_headers(self.headers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Connect,
    Body,
    Other,
}

/// Transport failure before a status line was read, or while reading the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::new(HttpErrorKind::Timeout, format!("request timed out: {error}"))
        } else if error.is_connect() {
            Self::new(HttpErrorKind::Connect, format!("connection failed: {error}"))
        } else if error.is_body() || error.is_decode() {
            Self::new(HttpErrorKind::Body, format!("failed to read response body: {error}"))
        } else {
            Self::new(HttpErrorKind::Other, format!("request failed: {error}"))
        }
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

impl From<HttpError> for ProviderError {
    fn from(error: HttpError) -> Self {
        match error.kind {
            HttpErrorKind::Timeout => Self::timeout(error.message),
            HttpErrorKind::Connect => Self::connection("ECONNREFUSED", error.message),
            HttpErrorKind::Body | HttpErrorKind::Other => Self::new(error.message),
        }
    }
}

pub trait HttpClient: Send + Sync {
    fn execute(&self, request: HttpRequest) -> HttpFuture<'_>;
}

/// [`HttpClient`] over a shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dreamgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute(&self, request: HttpRequest) -> HttpFuture<'_> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            }
            .timeout(request.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(json) = &request.json {
                builder = builder.json(json);
            }

            let response = builder
                .send()
                .await
                .map_err(|error| HttpError::from_reqwest(&error))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    let value = value.to_str().ok()?;
                    Some((name.as_str().to_ascii_lowercase(), value.to_owned()))
                })
                .collect();
            let body = response
                .text()
                .await
                .map_err(|error| HttpError::from_reqwest(&error))?;

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}
