//! Retry with exponential backoff and context-preserving provider failover.
//!
//! One logical request moves through these states:
//!
//! ```text
//! TRYING(i) ──fail──▶ BACKOFF ──▶ TRYING(i)
//!     │                               │
//!     │ switch                        │ success
//!     ▼                               ▼
//! SWITCHING(i→i+1) ──▶ TRYING(i+1)  SUCCESS
//!     │
//!     │ no providers left / switch budget spent
//!     ▼
//! EXHAUSTED
//! ```
//!
//! Attempts within a request are strictly sequential. Every attempt that
//! reaches the provider feeds the shared health tracker and preference
//! manager. Attempts refused by the local throttle count against the request
//! budget only.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classification::{classify, ErrorClassification, ErrorType, Severity};
use crate::context::{RetryContext, SwitchRecord};
use crate::error::{CoreError, ExhaustedError, ProviderError};
use crate::events::{CoreEvent, EventBus};
use crate::health::HealthTracker;
use crate::preference::{PerformanceSample, ProviderPreferenceManager};
use crate::provider::ProviderCapability;
use crate::retry::RetryConfig;
use crate::throttling::ThrottlingQueue;

/// Error types for which moving to another provider is preferred once the
/// current one is struggling.
const SWITCH_PREFERRED: [ErrorType; 8] = [
    ErrorType::NetworkError,
    ErrorType::Timeout,
    ErrorType::ProviderError,
    ErrorType::Unknown,
    ErrorType::Authentication,
    ErrorType::Configuration,
    ErrorType::ProviderMethod,
    ErrorType::RateLimit,
];

/// A provider eligible for one request.
#[derive(Clone)]
pub struct ProviderHandle {
    pub name: String,
    pub instance: Arc<dyn ProviderCapability>,
    pub throttle: ThrottlingQueue,
    /// Overrides the configured per-provider timeout multiplier.
    pub timeout_multiplier: Option<f64>,
}

impl ProviderHandle {
    pub fn new(name: impl Into<String>, instance: Arc<dyn ProviderCapability>) -> Self {
        Self {
            name: name.into(),
            instance,
            throttle: ThrottlingQueue::unlimited(),
            timeout_multiplier: None,
        }
    }

    pub fn with_throttle(mut self, throttle: ThrottlingQueue) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_timeout_multiplier(mut self, multiplier: Option<f64>) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.name)
            .field("kind", &self.instance.kind())
            .field("throttle", &self.throttle)
            .finish()
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Generated when absent.
    pub request_id: Option<String>,
    /// Caller context; whitelisted fields survive provider switches.
    pub context: Value,
    /// Overall deadline for the whole request.
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    /// Overrides [`RetryConfig::preserve_context`].
    pub preserve_context: Option<bool>,
}

impl RetryOptions {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_preserve_context(mut self, preserve: bool) -> Self {
        self.preserve_context = Some(preserve);
        self
    }
}

/// Successful request.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub provider: String,
    pub request_id: String,
    pub total_attempts: u32,
    pub provider_switches: u32,
    pub switch_history: Vec<SwitchRecord>,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_attempts: u64,
    pub provider_switches: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_attempts: AtomicU64,
    provider_switches: AtomicU64,
}

enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// A failed attempt.
struct AttemptFailure {
    error: ProviderError,
    latency: Option<Duration>,
    /// Refused by the local throttle before any call went out.
    throttled: bool,
}

impl AttemptFailure {
    fn upstream(error: ProviderError, latency: Duration) -> Self {
        Self {
            error,
            latency: Some(latency),
            throttled: false,
        }
    }

    fn throttled(error: ProviderError) -> Self {
        Self {
            error,
            latency: None,
            throttled: true,
        }
    }
}

struct LastFailure {
    provider: String,
    error: ProviderError,
    classification: ErrorClassification,
}

/// Runs an operation against an ordered provider list.
#[derive(Debug)]
pub struct IntelligentRetrySystem {
    config: RetryConfig,
    health: Arc<HealthTracker>,
    preferences: Arc<ProviderPreferenceManager>,
    events: EventBus,
    counters: RetryCounters,
}

impl IntelligentRetrySystem {
    pub fn new(
        config: RetryConfig,
        health: Arc<HealthTracker>,
        preferences: Arc<ProviderPreferenceManager>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            health,
            preferences,
            events,
            counters: RetryCounters::default(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            successful_requests: self.counters.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.counters.failed_requests.load(Ordering::Relaxed),
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            provider_switches: self.counters.provider_switches.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` over `providers` in order.
    ///
    /// `operation` receives the provider instance, its name, and the context
    /// for this attempt (`requestId`, `attempt`, `totalAttempts`, whitelisted
    /// caller fields and, after a switch, `previousProvider`,
    /// `switchReason` and `switchHistory`).
    ///
    /// # Errors
    ///
    /// - [`CoreError::Exhausted`] when every provider failed or a budget ran out
    /// - [`CoreError::Cancelled`] when the cancellation token fired
    /// - [`CoreError::DeadlineExceeded`] when the request timeout elapsed
    pub async fn execute<T, F, Fut>(
        &self,
        providers: &[ProviderHandle],
        options: RetryOptions,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, CoreError>
    where
        F: FnMut(Arc<dyn ProviderCapability>, String, Value) -> Fut + Send,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let request_id = options
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let preserve = options
            .preserve_context
            .unwrap_or(self.config.preserve_context);
        let mut context = RetryContext::new(
            request_id,
            &options.context,
            &self.config.context_fields,
            preserve,
        );
        let deadline = options.timeout.map(|timeout| started + timeout);
        let cancel = options.cancellation.unwrap_or_default();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut last: Option<LastFailure> = None;
        let mut index = 0;

        'providers: while let Some(provider) = providers.get(index) {
            let mut provider_attempt = 0;

            let reason = loop {
                if let Err(interrupt) = check_interrupt(&cancel, deadline) {
                    return Err(self.interrupted(interrupt, &context, last.as_ref()));
                }
                if context.total_attempts() >= self.config.max_retry_attempts {
                    debug!(
                        request_id = context.request_id(),
                        attempts = context.total_attempts(),
                        "retry attempt budget spent"
                    );
                    break 'providers;
                }

                provider_attempt += 1;
                let total = context.begin_attempt();
                self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
                let attempt_context = context.attempt_context(provider_attempt);
                debug!(
                    request_id = context.request_id(),
                    provider = %provider.name,
                    attempt = provider_attempt,
                    total_attempts = total,
                    "starting attempt"
                );

                let attempt_started = Instant::now();
                let timeout = self.attempt_timeout(provider_attempt, provider, deadline);
                match self
                    .run_attempt(provider, attempt_context.clone(), timeout, &mut operation)
                    .await
                {
                    Ok(value) => {
                        let latency = attempt_started.elapsed();
                        self.health.record_success(&provider.name, latency);
                        self.preferences.update_provider_performance(
                            &provider.name,
                            PerformanceSample::Success { latency },
                        );
                        return Ok(self.succeed(value, provider, context, started));
                    }
                    Err(failure) => {
                        let AttemptFailure {
                            error,
                            latency,
                            throttled,
                        } = failure;
                        let classification = classify(&error);
                        if throttled {
                            debug!(
                                request_id = context.request_id(),
                                provider = %provider.name,
                                attempt = provider_attempt,
                                error = %error,
                                "attempt refused by local throttle"
                            );
                        } else {
                            self.health.record_failure(
                                &provider.name,
                                &classification,
                                &error.to_string(),
                                &attempt_context,
                                latency,
                            );
                            self.preferences.update_provider_performance(
                                &provider.name,
                                PerformanceSample::Failure {
                                    error_type: classification.error_type,
                                },
                            );
                            warn!(
                                request_id = context.request_id(),
                                provider = %provider.name,
                                attempt = provider_attempt,
                                error_type = classification.error_type.as_str(),
                                error = %error,
                                "attempt failed"
                            );
                        }

                        let switch = self.should_switch_provider(
                            &provider.name,
                            &classification,
                            provider_attempt,
                        );
                        let error_type = classification.error_type;
                        let delay = (!switch).then(|| {
                            self.config.retry_delay(
                                provider_attempt,
                                &classification,
                                self.health.recent_failure_rate(&provider.name),
                            )
                        });
                        last = Some(LastFailure {
                            provider: provider.name.clone(),
                            error,
                            classification,
                        });

                        match delay {
                            None => break error_type,
                            Some(delay) => {
                                debug!(
                                    request_id = context.request_id(),
                                    provider = %provider.name,
                                    delay_ms = delay.as_millis() as u64,
                                    "backing off before retry"
                                );
                                if let Err(interrupt) = pause(delay, &cancel, deadline).await {
                                    return Err(self.interrupted(interrupt, &context, last.as_ref()));
                                }
                            }
                        }
                    }
                }
            };

            let Some(next) = providers.get(index + 1) else {
                break;
            };
            if !self.config.enable_provider_switching
                || context.provider_switches() >= self.config.max_provider_switches
            {
                debug!(
                    request_id = context.request_id(),
                    switches = context.provider_switches(),
                    "provider switching unavailable"
                );
                break;
            }

            let record = context.record_switch(&provider.name, &next.name, reason).clone();
            self.counters.provider_switches.fetch_add(1, Ordering::Relaxed);
            info!(
                request_id = context.request_id(),
                from = %record.from,
                to = %record.to,
                reason = reason.as_str(),
                attempt = record.attempt,
                "switching provider"
            );
            self.events.publish(CoreEvent::ProviderSwitch {
                request_id: context.request_id().to_owned(),
                from: record.from,
                to: record.to,
                reason,
                attempt: record.attempt,
            });

            let delay = self.config.switch_delay(context.provider_switches());
            if let Err(interrupt) = pause(delay, &cancel, deadline).await {
                return Err(self.interrupted(interrupt, &context, last.as_ref()));
            }
            index += 1;
        }

        Err(self.exhausted(&context, last))
    }

    /// Whether the next attempt should go to another provider.
    ///
    /// Explicit settings are checked first: critical or non-retryable errors
    /// and `switch_on_first_failure` always switch, and a spent per-provider
    /// budget or a `Retry-After` beyond `max_retry_after_ms` always moves on.
    /// The recent-failure-rate heuristic can add a switch for switch-preferred
    /// error types but never prevents one.
    pub fn should_switch_provider(
        &self,
        provider: &str,
        classification: &ErrorClassification,
        provider_attempt: u32,
    ) -> bool {
        if classification.severity == Severity::Critical || !classification.retryable {
            return true;
        }
        if self.config.switch_on_first_failure {
            return true;
        }
        if provider_attempt >= self.config.max_provider_retries {
            return true;
        }
        if self.config.retry_after_exceeds_cap(classification) {
            return true;
        }
        if self.health.is_circuit_open(provider) {
            return true;
        }
        SWITCH_PREFERRED.contains(&classification.error_type)
            && self.health.recent_failure_rate(provider) > self.config.failure_rate_switch_threshold
    }

    fn attempt_timeout(
        &self,
        attempt: u32,
        provider: &ProviderHandle,
        deadline: Option<Instant>,
    ) -> Duration {
        let timeout = match provider.timeout_multiplier {
            Some(multiplier) => self.config.scaled_attempt_timeout(attempt, multiplier),
            None => self.config.attempt_timeout(attempt, &provider.name),
        };
        match deadline {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        }
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        provider: &ProviderHandle,
        context: Value,
        timeout: Duration,
        operation: &mut F,
    ) -> Result<T, AttemptFailure>
    where
        F: FnMut(Arc<dyn ProviderCapability>, String, Value) -> Fut + Send,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
    {
        if let Err(wait) = provider.throttle.try_acquire() {
            let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return Err(AttemptFailure::throttled(
                ProviderError::rate_limited(seconds.max(1)).with_code("THROTTLED"),
            ));
        }
        let Some(_permit) = provider.throttle.acquire_slot(timeout).await else {
            return Err(AttemptFailure::throttled(ProviderError::timeout(format!(
                "timed out waiting for a concurrency slot on '{}'",
                provider.name
            ))));
        };

        let started = Instant::now();
        let call = operation(
            Arc::clone(&provider.instance),
            provider.name.clone(),
            context,
        );
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(AttemptFailure::upstream(error, started.elapsed())),
            Err(_) => Err(AttemptFailure::upstream(
                ProviderError::timeout(format!(
                    "attempt on '{}' timed out after {}ms",
                    provider.name,
                    timeout.as_millis()
                )),
                started.elapsed(),
            )),
        }
    }

    fn succeed<T>(
        &self,
        value: T,
        provider: &ProviderHandle,
        context: RetryContext,
        started: Instant,
    ) -> RetryOutcome<T> {
        let latency = started.elapsed();
        self.counters
            .successful_requests
            .fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = context.request_id(),
            provider = %provider.name,
            total_attempts = context.total_attempts(),
            provider_switches = context.provider_switches(),
            "request succeeded"
        );
        self.events.publish(CoreEvent::OperationSuccess {
            request_id: context.request_id().to_owned(),
            provider: provider.name.clone(),
            total_attempts: context.total_attempts(),
            provider_switches: context.provider_switches(),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        });

        RetryOutcome {
            value,
            provider: provider.name.clone(),
            request_id: context.request_id().to_owned(),
            total_attempts: context.total_attempts(),
            provider_switches: context.provider_switches(),
            switch_history: context.switch_history().to_vec(),
            latency,
        }
    }

    fn exhausted(&self, context: &RetryContext, last: Option<LastFailure>) -> CoreError {
        let (last_error, last_error_type, last_provider) = match last {
            Some(last) => (
                last.error.to_string(),
                last.classification.error_type,
                Some(last.provider),
            ),
            None => (
                String::from("no providers available"),
                ErrorType::Configuration,
                None,
            ),
        };
        self.record_failure(context, last_provider.clone(), last_error_type, &last_error);

        ExhaustedError {
            request_id: context.request_id().to_owned(),
            total_attempts: context.total_attempts(),
            provider_switches: context.provider_switches(),
            last_error,
            last_error_type,
            last_provider,
            switch_history: context.switch_history().to_vec(),
        }
        .into()
    }

    fn interrupted(
        &self,
        interrupt: Interrupt,
        context: &RetryContext,
        last: Option<&LastFailure>,
    ) -> CoreError {
        let request_id = context.request_id().to_owned();
        let total_attempts = context.total_attempts();
        let provider_switches = context.provider_switches();
        let (error_type, message) = match interrupt {
            Interrupt::Cancelled => (ErrorType::Unknown, "request cancelled"),
            Interrupt::DeadlineExceeded => (ErrorType::Timeout, "request deadline exceeded"),
        };
        self.record_failure(
            context,
            last.map(|last| last.provider.clone()),
            error_type,
            message,
        );

        match interrupt {
            Interrupt::Cancelled => CoreError::Cancelled {
                request_id,
                total_attempts,
                provider_switches,
            },
            Interrupt::DeadlineExceeded => CoreError::DeadlineExceeded {
                request_id,
                total_attempts,
                provider_switches,
            },
        }
    }

    fn record_failure(
        &self,
        context: &RetryContext,
        provider: Option<String>,
        error_type: ErrorType,
        message: &str,
    ) {
        self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
        warn!(
            request_id = context.request_id(),
            total_attempts = context.total_attempts(),
            provider_switches = context.provider_switches(),
            error_type = error_type.as_str(),
            "request failed"
        );
        self.events.publish(CoreEvent::OperationFailure {
            request_id: context.request_id().to_owned(),
            provider,
            error_type,
            total_attempts: context.total_attempts(),
            provider_switches: context.provider_switches(),
            message: message.to_owned(),
        });
    }
}

fn check_interrupt(cancel: &CancellationToken, deadline: Option<Instant>) -> Result<(), Interrupt> {
    if cancel.is_cancelled() {
        return Err(Interrupt::Cancelled);
    }
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(Interrupt::DeadlineExceeded);
    }
    Ok(())
}

/// Sleep for `delay`, cut short by cancellation or the deadline.
async fn pause(
    delay: Duration,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<(), Interrupt> {
    let delay = match deadline {
        Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
        None => delay,
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep(delay) => check_interrupt(cancel, deadline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedProvider;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::preference::PreferenceConfig;
    use crate::provider::{GenerationOptions, ProviderLimits};
    use serde_json::json;

    fn system(config: RetryConfig, names: &[&str]) -> IntelligentRetrySystem {
        let events = EventBus::new();
        let health = Arc::new(HealthTracker::new(
            CircuitBreakerConfig::default(),
            50,
            events.clone(),
        ));
        let preferences = Arc::new(ProviderPreferenceManager::new(
            PreferenceConfig::default(),
            events.clone(),
        ));
        for name in names {
            health.register(name);
            preferences.set_base_priority(name, 50.0);
        }
        IntelligentRetrySystem::new(config, health, preferences, events)
    }

    async fn generate(
        provider: Arc<dyn ProviderCapability>,
        _name: String,
        context: Value,
    ) -> Result<Value, ProviderError> {
        provider
            .generate_dream("a lighthouse", &GenerationOptions::default(), Some(&context))
            .await
    }

    #[tokio::test]
    async fn retries_then_switches_to_healthy_provider() {
        let retry = system(RetryConfig::fast(), &["alpha", "beta"]);
        let alpha = Arc::new(
            ScriptedProvider::new()
                .fail(ProviderError::connection("ECONNREFUSED", "connect failed"))
                .fail(ProviderError::connection("ECONNREFUSED", "connect failed")),
        );
        let beta = Arc::new(ScriptedProvider::answering(json!({ "text": "ok" })));
        let providers = vec![
            ProviderHandle::new("alpha", alpha.clone()),
            ProviderHandle::new("beta", beta.clone()),
        ];

        let outcome = retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect("beta succeeds");

        assert_eq!(outcome.provider, "beta");
        assert_eq!(outcome.total_attempts, 3);
        assert_eq!(outcome.provider_switches, 1);
        assert_eq!(outcome.switch_history[0].reason, ErrorType::NetworkError);
        assert_eq!(alpha.calls(), 2);
        assert_eq!(retry.stats().successful_requests, 1);
    }

    #[tokio::test]
    async fn authentication_failures_switch_without_retrying() {
        let retry = system(RetryConfig::fast(), &["alpha", "beta"]);
        let providers = vec![
            ProviderHandle::new("alpha", Arc::new(ScriptedProvider::failing(ProviderError::http(401, "denied")))),
            ProviderHandle::new("beta", Arc::new(ScriptedProvider::failing(ProviderError::http(403, "forbidden")))),
        ];

        let error = retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect_err("both providers reject");

        let CoreError::Exhausted(exhausted) = error else {
            panic!("expected exhaustion, got {error:?}");
        };
        assert_eq!(exhausted.total_attempts, 2);
        assert_eq!(exhausted.provider_switches, 1);
        assert_eq!(exhausted.last_error_type, ErrorType::Authentication);
        assert_eq!(exhausted.last_provider.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn switch_budget_limits_providers_tried() {
        let config = RetryConfig {
            max_provider_switches: 1,
            ..RetryConfig::fast()
        };
        let retry = system(config, &["a", "b", "c"]);
        let third = Arc::new(ScriptedProvider::answering(json!("never")));
        let providers = vec![
            ProviderHandle::new("a", Arc::new(ScriptedProvider::failing(ProviderError::http(401, "no")))),
            ProviderHandle::new("b", Arc::new(ScriptedProvider::failing(ProviderError::http(401, "no")))),
            ProviderHandle::new("c", third.clone()),
        ];

        let error = retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect_err("switch budget spent before c");

        assert_eq!(error.attempt_summary(), Some((2, 1)));
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn switched_provider_receives_preserved_context() {
        let retry = system(RetryConfig::fast(), &["alpha", "beta"]);
        let beta = Arc::new(ScriptedProvider::answering(json!("ok")));
        let providers = vec![
            ProviderHandle::new("alpha", Arc::new(ScriptedProvider::failing(ProviderError::http(401, "no")))),
            ProviderHandle::new("beta", beta.clone()),
        ];
        let options = RetryOptions::default()
            .with_request_id("req-7")
            .with_context(json!({ "userId": "u1", "apiKey": "secret", "style": "surreal" }));

        retry
            .execute(&providers, options, generate)
            .await
            .expect("beta succeeds");

        let context = &beta.contexts()[0];
        assert_eq!(context["requestId"], "req-7");
        assert_eq!(context["userId"], "u1");
        assert_eq!(context["style"], "surreal");
        assert_eq!(context["previousProvider"], "alpha");
        assert_eq!(context["switchReason"], "authentication");
        assert!(context.get("apiKey").is_none());
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_count_as_failures() {
        let config = RetryConfig {
            attempt_timeout_base_ms: 20,
            attempt_timeout_max_ms: 40,
            max_provider_retries: 1,
            ..RetryConfig::fast()
        };
        let retry = system(config, &["slow", "fast"]);
        let providers = vec![
            ProviderHandle::new(
                "slow",
                Arc::new(ScriptedProvider::new().respond_after(Duration::from_secs(5), json!("late"))),
            ),
            ProviderHandle::new("fast", Arc::new(ScriptedProvider::answering(json!("quick")))),
        ];

        let outcome = retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect("fast provider answers");

        assert_eq!(outcome.value, json!("quick"));
        assert_eq!(outcome.switch_history[0].reason, ErrorType::Timeout);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let config = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
            ..RetryConfig::fast()
        };
        let retry = system(config, &["alpha"]);
        let providers = vec![ProviderHandle::new(
            "alpha",
            Arc::new(ScriptedProvider::failing(ProviderError::http(503, "busy"))),
        )];
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let error = retry
            .execute(&providers, RetryOptions::default().with_cancellation(token), generate)
            .await
            .expect_err("cancelled");

        assert!(matches!(error, CoreError::Cancelled { total_attempts: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deadline_bounds_the_whole_request() {
        let config = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
            ..RetryConfig::fast()
        };
        let retry = system(config, &["alpha"]);
        let providers = vec![ProviderHandle::new(
            "alpha",
            Arc::new(ScriptedProvider::failing(ProviderError::http(503, "busy"))),
        )];

        let error = retry
            .execute(
                &providers,
                RetryOptions::default().with_timeout(Duration::from_millis(30)),
                generate,
            )
            .await
            .expect_err("deadline elapses during backoff");

        assert!(matches!(error, CoreError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn local_throttle_denials_leave_provider_health_untouched() {
        let retry = system(RetryConfig::fast(), &["alpha"]);
        let alpha = Arc::new(ScriptedProvider::new());
        let throttle = ThrottlingQueue::new(&ProviderLimits {
            requests_per_minute: 1,
            tokens_per_minute: 0,
            max_concurrent: 0,
        });
        let providers = vec![ProviderHandle::new("alpha", alpha.clone()).with_throttle(throttle)];

        retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect("first request fits the budget");
        let priority = retry.preferences.get_provider_priority("alpha");

        for _ in 0..5 {
            let error = retry
                .execute(&providers, RetryOptions::default(), generate)
                .await
                .expect_err("minute budget is spent");
            let CoreError::Exhausted(exhausted) = error else {
                panic!("expected exhaustion, got {error:?}");
            };
            assert_eq!(exhausted.total_attempts, 1);
            assert_eq!(exhausted.last_error_type, ErrorType::RateLimit);
        }

        assert_eq!(alpha.calls(), 1);
        assert!(!retry.health.is_circuit_open("alpha"));
        let health = retry.health.snapshot("alpha").expect("alpha is tracked");
        assert_eq!(health.failures, 0);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(retry.preferences.get_provider_priority("alpha"), priority);
    }

    #[tokio::test]
    async fn long_retry_after_switches_instead_of_waiting() {
        let retry = system(RetryConfig::fast(), &["alpha", "beta"]);
        let alpha = Arc::new(ScriptedProvider::failing(ProviderError::rate_limited(3_600)));
        let providers = vec![
            ProviderHandle::new("alpha", alpha.clone()),
            ProviderHandle::new("beta", Arc::new(ScriptedProvider::answering(json!("ok")))),
        ];

        let started = Instant::now();
        let outcome = retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect("beta answers");

        assert_eq!(outcome.provider, "beta");
        assert_eq!(alpha.calls(), 1);
        assert_eq!(outcome.switch_history[0].reason, ErrorType::RateLimit);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn empty_provider_list_is_exhausted_immediately() {
        let retry = system(RetryConfig::fast(), &[]);

        let error = retry
            .execute(&[], RetryOptions::default(), generate)
            .await
            .expect_err("nothing to try");

        assert_eq!(error.attempt_summary(), Some((0, 0)));
    }

    #[tokio::test]
    async fn events_report_switch_and_success() {
        let retry = system(RetryConfig::fast(), &["alpha", "beta"]);
        let mut events = retry.events.subscribe();
        let providers = vec![
            ProviderHandle::new("alpha", Arc::new(ScriptedProvider::failing(ProviderError::http(401, "no")))),
            ProviderHandle::new("beta", Arc::new(ScriptedProvider::answering(json!("ok")))),
        ];

        retry
            .execute(&providers, RetryOptions::default(), generate)
            .await
            .expect("beta succeeds");

        let names = events
            .drain()
            .iter()
            .map(CoreEvent::name)
            .filter(|name| name.starts_with("provider_switch") || name.starts_with("operation_"))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["provider_switch", "operation_success"]);
    }
}
