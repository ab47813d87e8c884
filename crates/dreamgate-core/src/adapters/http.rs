use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::http_client::{HttpAuth, HttpClient, HttpRequest, ReqwestHttpClient};
use crate::provider::{GenerationOptions, ProviderCapability, ProviderFuture};

const DEFAULT_MAX_TOKENS: u32 = 1_500;
const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_TIMEOUT_MS: u64 = 20_000;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider backed by a JSON completion endpoint.
///
/// Requests are `POST {endpoint}` with `{prompt, max_tokens, temperature}`
/// and optional bearer auth. The JSON body is returned as-is; non-JSON
/// bodies come back as a string value.
#[derive(Clone)]
pub struct HttpLlmProvider {
    name: String,
    endpoint: String,
    health_url: Option<String>,
    model: Option<String>,
    auth: HttpAuth,
    timeout_ms: u64,
    http_client: Arc<dyn HttpClient>,
}

impl HttpLlmProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::with_http_client(name, endpoint, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn with_http_client(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            health_url: None,
            model: None,
            auth: HttpAuth::None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            http_client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.auth = HttpAuth::BearerToken(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn payload(&self, prompt: &str, options: &GenerationOptions) -> Value {
        let mut payload = Map::new();
        for (key, value) in &options.extra {
            payload.insert(key.clone(), value.clone());
        }
        payload.insert(String::from("prompt"), Value::String(prompt.to_owned()));
        payload.insert(
            String::from("max_tokens"),
            json!(options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        payload.insert(
            String::from("temperature"),
            json!(options.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        );
        if let Some(model) = &self.model {
            payload.insert(String::from("model"), Value::String(model.clone()));
        }
        Value::Object(payload)
    }
}

impl std::fmt::Debug for HttpLlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlmProvider")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("authenticated", &self.auth.is_configured())
            .finish()
    }
}

impl ProviderCapability for HttpLlmProvider {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn generate_dream<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
        _context: Option<&'a Value>,
    ) -> ProviderFuture<'a, Value> {
        Box::pin(async move {
            let request = HttpRequest::post(&self.endpoint, self.payload(prompt, options))
                .with_auth(&self.auth)
                .with_timeout(Duration::from_millis(self.timeout_ms));

            debug!(provider = %self.name, endpoint = %self.endpoint, "sending generation request");
            let response = self.http_client.execute(request).await?;
            if !response.is_success() {
                return Err(response.into_provider_error(&self.name));
            }
            Ok(response.json_body())
        })
    }

    fn test_connection<'a>(&'a self) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let url = self.health_url.as_deref().unwrap_or(&self.endpoint);
            let request = HttpRequest::get(url)
                .with_auth(&self.auth)
                .with_timeout(PROBE_TIMEOUT);
            let response = self.http_client.execute(request).await?;

            // Completion endpoints commonly reject GET; reachability is what counts.
            match response.status {
                401 | 403 | 429 | 500.. => Err(response.into_provider_error(&self.name)),
                _ => Ok(()),
            }
        })
    }
}
