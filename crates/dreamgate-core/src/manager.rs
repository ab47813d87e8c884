//! Provider manager: the single entry point callers talk to.
//!
//! The manager owns the provider table and wires the shared pieces together:
//!
//! ```text
//! request ─▶ cache lookup ─hit──────────────────────────────▶ response
//!               │ miss
//!               ▼
//!          rank providers (priority, context rules, open circuits skipped)
//!               │
//!               ▼
//!          intelligent retry ─▶ provider.generate_dream
//!               │ raw payload
//!               ▼
//!          response pipeline ─▶ cache store ─────────────────▶ response
//! ```
//!
//! Health, preference and retry state are shared by every request; the
//! manager adds no locking of its own beyond the provider table.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheMode, CacheStats, CachedResponse, ResponseCache, TtlPolicy};
use crate::circuit_breaker::CircuitState;
use crate::classification::{classify, ErrorType};
use crate::config::CoreConfig;
use crate::context::SwitchRecord;
use crate::error::{CoreError, ProviderError};
use crate::events::{CoreEvent, EventBus, EventSubscription};
use crate::health::{HealthState, HealthTracker, ProviderHealth};
use crate::intelligent_retry::{
    IntelligentRetrySystem, ProviderHandle, RetryOptions, RetryOutcome, RetryStats,
};
use crate::pipeline::stages::FallbackStrategy;
use crate::pipeline::{OperationType, PipelineMetadata, ResponseProcessingPipeline};
use crate::preference::{ProviderPreferenceManager, RequestContext};
use crate::provider::{GenerationOptions, ProviderCapability, ProviderLimits};
use crate::registry::{ProviderEntry, ProviderRegistry};
use crate::throttling::ThrottlingQueue;

/// Registration settings for a provider instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Base priority; the configured default when absent.
    pub priority: Option<f64>,
    pub limits: ProviderLimits,
    pub enabled: bool,
    pub timeout_multiplier: Option<f64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            priority: None,
            limits: ProviderLimits::default(),
            enabled: true,
            timeout_multiplier: None,
        }
    }
}

impl ProviderSettings {
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl From<&ProviderEntry> for ProviderSettings {
    fn from(entry: &ProviderEntry) -> Self {
        Self {
            priority: Some(entry.priority),
            limits: entry.limits,
            enabled: entry.enabled,
            timeout_multiplier: entry.timeout_multiplier,
        }
    }
}

struct RegisteredProvider {
    instance: Arc<dyn ProviderCapability>,
    throttle: ThrottlingQueue,
    enabled: bool,
    timeout_multiplier: Option<f64>,
}

impl RegisteredProvider {
    fn handle(&self, name: &str) -> ProviderHandle {
        ProviderHandle::new(name, Arc::clone(&self.instance))
            .with_throttle(self.throttle.clone())
            .with_timeout_multiplier(self.timeout_multiplier)
    }
}

/// Prompt and options a response is cached under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheRequest {
    pub prompt: String,
    pub options: GenerationOptions,
}

/// Options for [`ProviderManager::execute_with_fallback`].
#[derive(Debug, Clone, Default)]
pub struct FallbackOptions {
    /// Explicit provider order. Ranked enabled providers when absent.
    pub providers: Option<Vec<String>>,
    pub retry: RetryOptions,
    /// Request attributes matched against contextual rules.
    pub request: Option<RequestContext>,
    pub operation: OperationType,
    /// Enables caching for this request.
    pub cache: Option<CacheRequest>,
    pub cache_mode: CacheMode,
    pub confidence: Option<f64>,
    pub custom_ttl: Option<Duration>,
}

impl FallbackOptions {
    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = Some(providers.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_operation(mut self, operation: OperationType) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_cache(mut self, prompt: impl Into<String>, options: GenerationOptions) -> Self {
        self.cache = Some(CacheRequest {
            prompt: prompt.into(),
            options,
        });
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    fn ttl_policy(&self, options: &GenerationOptions) -> TtlPolicy {
        let mut policy = TtlPolicy::new(options.quality.unwrap_or_default());
        if let Some(confidence) = self.confidence {
            policy = policy.with_confidence(confidence);
        }
        if let Some(ttl) = self.custom_ttl {
            policy = policy.with_custom_ttl(ttl);
        }
        policy
    }
}

/// Processed content plus how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackResponse {
    pub request_id: String,
    pub content: String,
    pub parsed: Option<Value>,
    pub provider: String,
    pub total_attempts: u32,
    pub provider_switches: u32,
    pub switch_history: Vec<SwitchRecord>,
    pub from_cache: bool,
    pub cache_key: Option<String>,
    /// Absent for cache hits.
    pub pipeline: Option<PipelineMetadata>,
    pub latency_ms: u64,
}

impl FallbackResponse {
    fn from_cached(hit: CachedResponse, request_id: String, started: Instant) -> Option<Self> {
        let content = hit.value.get("content")?.as_str()?.to_owned();
        let provider = hit
            .value
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let parsed = hit.value.get("parsed").filter(|value| !value.is_null()).cloned();
        Some(Self {
            request_id,
            content,
            parsed,
            provider,
            total_attempts: 0,
            provider_switches: 0,
            switch_history: Vec::new(),
            from_cache: true,
            cache_key: Some(hit.key),
            pipeline: None,
            latency_ms: millis(started.elapsed()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMetrics {
    pub kind: &'static str,
    pub enabled: bool,
    pub status: HealthState,
    pub circuit: CircuitState,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub average_latency_ms: f64,
    pub priority: f64,
    pub available_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerMetrics {
    pub providers: BTreeMap<String, ProviderMetrics>,
    pub retry: RetryStats,
    pub cache: CacheStats,
}

/// Registers providers and runs requests across them.
pub struct ProviderManager {
    config: CoreConfig,
    providers: DashMap<String, RegisteredProvider>,
    events: EventBus,
    health: Arc<HealthTracker>,
    preferences: Arc<ProviderPreferenceManager>,
    retry: IntelligentRetrySystem,
    pipeline: ResponseProcessingPipeline,
    cache: ResponseCache,
    shutdown: CancellationToken,
    decay_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager")
            .field("providers", &self.provider_names())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl ProviderManager {
    /// Build a manager with no providers.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] when `config` does not validate.
    pub fn new(config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let events = EventBus::new();
        let health = Arc::new(HealthTracker::new(
            config.circuit_breaker,
            config.health.failure_history_size,
            events.clone(),
        ));
        let preferences = Arc::new(ProviderPreferenceManager::new(
            config.preference.clone(),
            events.clone(),
        ));
        let retry = IntelligentRetrySystem::new(
            config.retry.clone(),
            Arc::clone(&health),
            Arc::clone(&preferences),
            events.clone(),
        );
        let pipeline = ResponseProcessingPipeline::new(config.pipeline.clone());
        let cache = ResponseCache::new(config.cache.clone());

        Ok(Self {
            config,
            providers: DashMap::new(),
            events,
            health,
            preferences,
            retry,
            pipeline,
            cache,
            shutdown: CancellationToken::new(),
            decay_task: Mutex::new(None),
        })
    }

    /// Build a manager and register every entry of `registry`.
    pub fn from_registry(config: CoreConfig, registry: &ProviderRegistry) -> Result<Self, CoreError> {
        let manager = Self::new(config)?;
        for entry in registry.entries() {
            manager.register_with_config(entry)?;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn preferences(&self) -> &Arc<ProviderPreferenceManager> {
        &self.preferences
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn pipeline(&self) -> &ResponseProcessingPipeline {
        &self.pipeline
    }

    /// Add a custom fallback to the response pipeline.
    pub fn register_fallback(&mut self, fallback: Box<dyn FallbackStrategy>) {
        self.pipeline.register_fallback(fallback);
    }

    /// Start the preference decay loop. Must run inside a Tokio runtime;
    /// calling it twice is a no-op.
    pub fn start_background_tasks(&self) {
        let mut task = self
            .decay_task
            .lock()
            .expect("decay task slot should not be poisoned");
        if task.is_none() {
            *task = Some(
                self.preferences
                    .spawn_decay_task(self.shutdown.child_token()),
            );
            debug!("preference decay task started");
        }
    }

    /// Stop background work and wait for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .decay_task
            .lock()
            .expect("decay task slot should not be poisoned")
            .take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "preference decay task ended abnormally");
            }
        }
        info!("provider manager shut down");
    }

    /// Register `instance` under `name` with default settings.
    pub fn register_provider(
        &self,
        name: &str,
        instance: Arc<dyn ProviderCapability>,
    ) -> Result<(), CoreError> {
        self.register_provider_with(name, instance, ProviderSettings::default())
    }

    /// Register `instance` under `name`, replacing any provider of that name.
    /// Health starts `unknown`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidProvider`] for a blank name or invalid
    /// settings.
    pub fn register_provider_with(
        &self,
        name: &str,
        instance: Arc<dyn ProviderCapability>,
        settings: ProviderSettings,
    ) -> Result<(), CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::invalid_provider("provider name must not be empty"));
        }
        if let Some(multiplier) = settings.timeout_multiplier {
            if !multiplier.is_finite() || multiplier <= 0.0 {
                return Err(CoreError::invalid_provider(format!(
                    "provider '{name}' timeout multiplier must be a positive number"
                )));
            }
        }

        let priority = settings
            .priority
            .unwrap_or(self.config.preference.default_priority);
        let kind = instance.kind();
        self.providers.insert(
            name.to_owned(),
            RegisteredProvider {
                instance,
                throttle: ThrottlingQueue::new(&settings.limits),
                enabled: settings.enabled,
                timeout_multiplier: settings.timeout_multiplier,
            },
        );
        self.health.register(name);
        self.preferences.set_base_priority(name, priority);

        info!(provider = name, kind, priority, enabled = settings.enabled, "provider registered");
        Ok(())
    }

    /// Instantiate and register a configured provider.
    pub fn register_with_config(&self, entry: &ProviderEntry) -> Result<(), CoreError> {
        let instance = ProviderRegistry::instantiate(entry)?;
        self.register_provider_with(&entry.name, instance, ProviderSettings::from(entry))
    }

    /// Drop `name` and its health and preference state. Returns whether it
    /// was registered.
    pub fn unregister_provider(&self, name: &str) -> bool {
        let removed = self.providers.remove(name).is_some();
        if removed {
            self.health.remove(name);
            self.preferences.remove_provider(name);
            info!(provider = name, "provider unregistered");
        }
        removed
    }

    pub fn set_provider_enabled(&self, name: &str, enabled: bool) -> Result<(), CoreError> {
        let mut provider = self
            .providers
            .get_mut(name)
            .ok_or_else(|| not_found(name))?;
        provider.enabled = enabled;
        info!(provider = name, enabled, "provider availability changed");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names = self
            .providers
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Cached health records; no provider is contacted. An unknown name
    /// yields an empty map.
    pub fn get_health_status(&self, name: Option<&str>) -> BTreeMap<String, ProviderHealth> {
        match name {
            Some(name) => self
                .health
                .snapshot(name)
                .map(|health| BTreeMap::from([(name.to_owned(), health)]))
                .unwrap_or_default(),
            None => self.health.snapshot_all(),
        }
    }

    /// Probe `name` and fold the outcome into its health record.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ProviderNotFound`] for an unregistered name
    /// - [`CoreError::HealthProbe`] when the probe failed or timed out
    pub async fn check_provider_health(&self, name: &str) -> Result<ProviderHealth, CoreError> {
        let instance = self
            .providers
            .get(name)
            .map(|provider| Arc::clone(&provider.instance))
            .ok_or_else(|| not_found(name))?;

        let probe_timeout = self.config.health.probe_timeout();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(probe_timeout, instance.test_connection()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::timeout(format!(
                "health probe timed out after {} ms",
                probe_timeout.as_millis()
            ))),
        };
        let elapsed = started.elapsed();

        if let Err(error) = outcome {
            let classification = classify(&error);
            self.health.record_failure(
                name,
                &classification,
                error.message(),
                &json!({ "operation": "health_check" }),
                Some(elapsed),
            );
            warn!(
                provider = name,
                error_type = %classification.error_type,
                error = error.message(),
                "health probe failed"
            );
            return Err(CoreError::HealthProbe {
                name: name.to_owned(),
                source: error,
            });
        }

        self.health.record_success(name, elapsed);
        debug!(provider = name, latency_ms = millis(elapsed), "health probe passed");
        self.health.snapshot(name).ok_or_else(|| not_found(name))
    }

    /// Probe every registered provider in name order. Probe failures are
    /// already reflected in the returned records.
    pub async fn check_all_providers(&self) -> BTreeMap<String, ProviderHealth> {
        for name in self.provider_names() {
            if let Err(error) = self.check_provider_health(&name).await {
                debug!(provider = %name, %error, "provider probe reported failure");
            }
        }
        self.health.snapshot_all()
    }

    /// Providers for one request, in attempt order, open circuits skipped.
    ///
    /// An explicit list keeps its order; otherwise enabled providers are
    /// ranked by priority and `request` rules.
    pub fn candidates(
        &self,
        explicit: Option<&[String]>,
        request: Option<&RequestContext>,
    ) -> Result<Vec<ProviderHandle>, CoreError> {
        let names = match explicit {
            Some(names) => {
                let mut ordered: Vec<String> = Vec::with_capacity(names.len());
                for name in names {
                    if !self.providers.contains_key(name) {
                        return Err(not_found(name));
                    }
                    if !ordered.contains(name) {
                        ordered.push(name.clone());
                    }
                }
                ordered
            }
            None => {
                let enabled = self
                    .providers
                    .iter()
                    .filter(|entry| entry.enabled)
                    .map(|entry| entry.key().clone())
                    .collect::<Vec<_>>();
                self.preferences.rank_providers(&enabled, request)
            }
        };

        Ok(names
            .into_iter()
            .filter(|name| {
                let open = self.health.is_circuit_open(name);
                if open {
                    debug!(provider = %name, "skipping provider with open circuit");
                }
                !open
            })
            .filter_map(|name| {
                self.providers
                    .get(&name)
                    .map(|provider| provider.handle(&name))
            })
            .collect())
    }

    /// Run `operation` with retry and failover but no response processing.
    pub async fn execute_raw<T, F, Fut>(
        &self,
        providers: Option<&[String]>,
        request: Option<&RequestContext>,
        options: RetryOptions,
        operation: F,
    ) -> Result<RetryOutcome<T>, CoreError>
    where
        F: FnMut(Arc<dyn ProviderCapability>, String, Value) -> Fut + Send,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        T: Send,
    {
        let handles = self.candidates(providers, request)?;
        self.retry.execute(&handles, options, operation).await
    }

    /// Cache lookup, retry with failover, response pipeline, cache store.
    ///
    /// A pipeline failure is reported but does not trigger another provider.
    /// Structured results without a parsed form (passed through unvalidated,
    /// or truncated) are returned but not cached.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ProviderNotFound`] for an unknown explicit provider
    /// - [`CoreError::Exhausted`], [`CoreError::Cancelled`] or
    ///   [`CoreError::DeadlineExceeded`] from the retry loop
    /// - [`CoreError::Pipeline`] when the payload could not be processed
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        options: FallbackOptions,
        operation: F,
    ) -> Result<FallbackResponse, CoreError>
    where
        F: FnMut(Arc<dyn ProviderCapability>, String, Value) -> Fut + Send,
        Fut: Future<Output = Result<Value, ProviderError>> + Send,
    {
        let started = Instant::now();
        let mut retry_options = options.retry.clone();
        let request_id = retry_options
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        if let Some(cache) = options.cache.as_ref().filter(|_| options.cache_mode.reads()) {
            let hit = self
                .cache
                .lookup(options.operation, &cache.prompt, &cache.options)
                .await;
            if let Some(response) =
                hit.and_then(|hit| FallbackResponse::from_cached(hit, request_id.clone(), started))
            {
                info!(request_id = %request_id, provider = %response.provider, "served from cache");
                return Ok(response);
            }
        }

        let outcome = self
            .execute_raw(
                options.providers.as_deref(),
                options.request.as_ref(),
                retry_options,
                operation,
            )
            .await?;

        let processed = match self
            .pipeline
            .process_response(&outcome.value, &outcome.provider, options.operation)
            .into_result()
        {
            Ok(processed) => processed,
            Err(error) => {
                self.report_pipeline_failure(&outcome, &error);
                return Err(error);
            }
        };

        // Structured content that failed validation is served once, never cached.
        let cacheable = !(options.operation.is_structured() && processed.parsed.is_none());
        if !cacheable {
            debug!(
                request_id = %outcome.request_id,
                provider = %outcome.provider,
                "skipping cache store for unvalidated content"
            );
        }
        let cache_key = match options
            .cache
            .as_ref()
            .filter(|_| cacheable && options.cache_mode.writes())
        {
            Some(cache) => {
                let value = json!({
                    "content": processed.content,
                    "parsed": processed.parsed,
                    "provider": outcome.provider,
                });
                let key = self
                    .cache
                    .store(
                        options.operation,
                        &cache.prompt,
                        &cache.options,
                        value,
                        options.ttl_policy(&cache.options),
                    )
                    .await;
                Some(key)
            }
            None => None,
        };

        Ok(FallbackResponse {
            request_id: outcome.request_id,
            content: processed.content,
            parsed: processed.parsed,
            provider: outcome.provider,
            total_attempts: outcome.total_attempts,
            provider_switches: outcome.provider_switches,
            switch_history: outcome.switch_history,
            from_cache: false,
            cache_key,
            pipeline: Some(processed.metadata),
            latency_ms: millis(started.elapsed()),
        })
    }

    /// Generate a dream for `prompt`, cached under the prompt and options
    /// unless `fallback.cache` names something else.
    pub async fn generate_dream(
        &self,
        prompt: &str,
        options: GenerationOptions,
        mut fallback: FallbackOptions,
    ) -> Result<FallbackResponse, CoreError> {
        if fallback.cache.is_none() {
            fallback.cache = Some(CacheRequest {
                prompt: prompt.to_owned(),
                options: options.clone(),
            });
        }
        let prompt = Arc::<str>::from(prompt);
        let options = Arc::new(options);

        self.execute_with_fallback(fallback, move |provider, _name, context| {
            let prompt = Arc::clone(&prompt);
            let options = Arc::clone(&options);
            async move {
                provider
                    .generate_dream(&prompt, &options, Some(&context))
                    .await
            }
        })
        .await
    }

    pub async fn get_metrics(&self) -> ManagerMetrics {
        let health = self.health.snapshot_all();
        let providers = self
            .providers
            .iter()
            .filter_map(|entry| {
                let name = entry.key();
                let record = health.get(name)?;
                let success_rate = if record.total_requests == 0 {
                    0.0
                } else {
                    record.successes as f64 / record.total_requests as f64
                };
                Some((
                    name.clone(),
                    ProviderMetrics {
                        kind: entry.instance.kind(),
                        enabled: entry.enabled,
                        status: record.status,
                        circuit: record.circuit,
                        total_requests: record.total_requests,
                        successes: record.successes,
                        failures: record.failures,
                        success_rate,
                        consecutive_failures: record.consecutive_failures,
                        average_latency_ms: record.average_latency_ms,
                        priority: self.preferences.get_provider_priority(name),
                        available_slots: entry.throttle.available_slots(),
                    },
                ))
            })
            .collect();

        ManagerMetrics {
            providers,
            retry: self.retry.stats(),
            cache: self.cache.stats().await,
        }
    }

    fn report_pipeline_failure(&self, outcome: &RetryOutcome<Value>, error: &CoreError) {
        let message = error.to_string();
        warn!(
            request_id = %outcome.request_id,
            provider = %outcome.provider,
            error_type = %ErrorType::Validation,
            error = %message,
            "provider response could not be processed"
        );
        self.events.publish(CoreEvent::OperationFailure {
            request_id: outcome.request_id.clone(),
            provider: Some(outcome.provider.clone()),
            error_type: ErrorType::Validation,
            total_attempts: outcome.total_attempts,
            provider_switches: outcome.provider_switches,
            message,
        });
    }
}

fn not_found(name: &str) -> CoreError {
    CoreError::ProviderNotFound {
        name: name.to_owned(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
