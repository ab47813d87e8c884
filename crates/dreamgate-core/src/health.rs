//! Per-provider health, circuit breaker and failure history.
//!
//! Every provider owns one record in a sharded map. A failure updates the
//! consecutive-failure count, the failure history, the circuit breaker and
//! the status while holding that record's shard lock, so readers never see a
//! count without its history entry.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitTransition};
use crate::classification::{sanitize_context, ErrorClassification, ErrorType, Severity};
use crate::events::{CoreEvent, EventBus};

/// Failures that mark a provider degraded.
pub const DEGRADED_AFTER: u32 = 2;
/// Failures that mark a provider unhealthy.
pub const UNHEALTHY_AFTER: u32 = 5;

const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(300);
const RECENT_FAILURE_SAMPLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time health snapshot of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub status: HealthState,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub last_error_type: Option<ErrorType>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureHistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub error_type: ErrorType,
    pub severity: Severity,
    /// Sanitized request context.
    pub context: Value,
}

#[derive(Debug)]
struct ProviderRecord {
    status: HealthState,
    consecutive_failures: u32,
    last_check: Option<OffsetDateTime>,
    last_error: Option<String>,
    last_error_type: Option<ErrorType>,
    successes: u64,
    failures: u64,
    latency_total_ms: f64,
    latency_samples: u64,
    breaker: CircuitBreaker,
    history: VecDeque<FailureHistoryEntry>,
    recent_failures: VecDeque<Instant>,
}

impl ProviderRecord {
    fn new(circuit: CircuitBreakerConfig) -> Self {
        Self {
            status: HealthState::Unknown,
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
            last_error_type: None,
            successes: 0,
            failures: 0,
            latency_total_ms: 0.0,
            latency_samples: 0,
            breaker: CircuitBreaker::new(circuit),
            history: VecDeque::new(),
            recent_failures: VecDeque::new(),
        }
    }

    fn compute_status(&self, now: Instant) -> HealthState {
        if self.breaker.is_open(now) || self.consecutive_failures >= UNHEALTHY_AFTER {
            HealthState::Unhealthy
        } else if self.consecutive_failures >= DEGRADED_AFTER
            || (self.consecutive_failures > 0 && self.successes == 0)
        {
            HealthState::Degraded
        } else if self.successes + self.failures == 0 {
            HealthState::Unknown
        } else {
            HealthState::Healthy
        }
    }

    fn snapshot(&self, now: Instant) -> ProviderHealth {
        let average_latency_ms = if self.latency_samples == 0 {
            0.0
        } else {
            self.latency_total_ms / self.latency_samples as f64
        };

        ProviderHealth {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_check: self.last_check,
            last_error: self.last_error.clone(),
            last_error_type: self.last_error_type,
            total_requests: self.successes + self.failures,
            successes: self.successes,
            failures: self.failures,
            average_latency_ms,
            circuit: self.breaker.state(now),
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        self.latency_total_ms += latency.as_secs_f64() * 1_000.0;
        self.latency_samples += 1;
    }
}

/// Sharded health store for all registered providers.
#[derive(Debug)]
pub struct HealthTracker {
    records: DashMap<String, ProviderRecord>,
    circuit: CircuitBreakerConfig,
    history_size: usize,
    events: EventBus,
}

impl HealthTracker {
    pub fn new(circuit: CircuitBreakerConfig, history_size: usize, events: EventBus) -> Self {
        Self {
            records: DashMap::new(),
            circuit,
            history_size: history_size.max(1),
            events,
        }
    }

    /// Start tracking `name` with status `unknown`, replacing any prior state.
    pub fn register(&self, name: &str) {
        self.records
            .insert(name.to_owned(), ProviderRecord::new(self.circuit));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.records.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn record_success(&self, name: &str, latency: Duration) {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let Some(mut record) = self.records.get_mut(name) else {
                return;
            };
            if record.breaker.poll(now) == Some(CircuitTransition::Closed) {
                events.push(CoreEvent::CircuitClosed {
                    provider: name.to_owned(),
                });
            }
            record.consecutive_failures = 0;
            record.successes += 1;
            record.last_check = Some(OffsetDateTime::now_utc());
            record.record_latency(latency);
            let previous = record.status;
            record.status = record.compute_status(now);
            if previous != record.status {
                events.push(CoreEvent::HealthChanged {
                    provider: name.to_owned(),
                    from: previous,
                    to: record.status,
                });
            }
        }
        self.emit(events);
    }

    /// Record a classified failure together with its sanitized context.
    pub fn record_failure(
        &self,
        name: &str,
        classification: &ErrorClassification,
        message: &str,
        context: &Value,
        latency: Option<Duration>,
    ) {
        let now = Instant::now();
        let entry = FailureHistoryEntry {
            timestamp: OffsetDateTime::now_utc(),
            error_type: classification.error_type,
            severity: classification.severity,
            context: sanitize_context(context),
        };

        let mut events = Vec::new();
        {
            let Some(mut record) = self.records.get_mut(name) else {
                return;
            };
            if record.breaker.poll(now) == Some(CircuitTransition::Closed) {
                events.push(CoreEvent::CircuitClosed {
                    provider: name.to_owned(),
                });
            }

            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.failures += 1;
            record.last_check = Some(entry.timestamp);
            record.last_error = Some(message.to_owned());
            record.last_error_type = Some(classification.error_type);
            if let Some(latency) = latency {
                record.record_latency(latency);
            }

            if record.history.len() >= self.history_size {
                record.history.pop_front();
            }
            record.history.push_back(entry);

            record.recent_failures.push_back(now);
            while record.recent_failures.len() > RECENT_FAILURE_SAMPLE {
                record.recent_failures.pop_front();
            }

            if record.breaker.record_failure(now) == Some(CircuitTransition::Opened) {
                let failures = record.breaker.failure_count(now);
                warn!(provider = name, failures, "circuit breaker opened");
                events.push(CoreEvent::CircuitOpened {
                    provider: name.to_owned(),
                    failures,
                });
            }

            let previous = record.status;
            record.status = record.compute_status(now);
            if previous != record.status {
                events.push(CoreEvent::HealthChanged {
                    provider: name.to_owned(),
                    from: previous,
                    to: record.status,
                });
            }
        }
        self.emit(events);
    }

    /// Whether calls to `name` should be skipped right now. Closes circuits
    /// whose quiet period has elapsed.
    pub fn is_circuit_open(&self, name: &str) -> bool {
        let now = Instant::now();
        let mut closed = false;
        let open = {
            let Some(mut record) = self.records.get_mut(name) else {
                return false;
            };
            if record.breaker.poll(now) == Some(CircuitTransition::Closed) {
                closed = true;
                record.status = record.compute_status(now);
            }
            record.breaker.is_open(now)
        };

        if closed {
            info!(provider = name, "circuit breaker closed");
            self.emit(vec![CoreEvent::CircuitClosed {
                provider: name.to_owned(),
            }]);
        }
        open
    }

    /// Share of the last five failures that fell inside the past five
    /// minutes, over a fixed denominator of five.
    pub fn recent_failure_rate(&self, name: &str) -> f64 {
        let Some(record) = self.records.get(name) else {
            return 0.0;
        };
        let now = Instant::now();
        let recent = record
            .recent_failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= RECENT_FAILURE_WINDOW)
            .count();
        recent as f64 / RECENT_FAILURE_SAMPLE as f64
    }

    pub fn snapshot(&self, name: &str) -> Option<ProviderHealth> {
        let now = Instant::now();
        self.records.get(name).map(|record| record.snapshot(now))
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, ProviderHealth> {
        let now = Instant::now();
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot(now)))
            .collect()
    }

    pub fn failure_history(&self, name: &str) -> Vec<FailureHistoryEntry> {
        self.records
            .get(name)
            .map(|record| record.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn emit(&self, events: Vec<CoreEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::classify;
    use crate::error::ProviderError;
    use serde_json::json;

    fn tracker(threshold: u32, history_size: usize) -> HealthTracker {
        HealthTracker::new(
            CircuitBreakerConfig {
                threshold,
                timeout_ms: 60_000,
            },
            history_size,
            EventBus::new(),
        )
    }

    fn fail(tracker: &HealthTracker, name: &str) {
        let error = ProviderError::http(503, "unavailable");
        tracker.record_failure(
            name,
            &classify(&error),
            error.message(),
            &json!({ "token": "secret", "userId": "u" }),
            None,
        );
    }

    #[test]
    fn new_provider_starts_unknown() {
        let tracker = tracker(5, 10);
        tracker.register("alpha");

        let health = tracker.snapshot("alpha").expect("registered");
        assert_eq!(health.status, HealthState::Unknown);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.circuit, CircuitState::Closed);
    }

    #[test]
    fn consecutive_failures_degrade_then_mark_unhealthy() {
        let tracker = tracker(100, 10);
        tracker.register("alpha");
        tracker.record_success("alpha", Duration::from_millis(10));

        fail(&tracker, "alpha");
        assert_eq!(tracker.snapshot("alpha").map(|h| h.status), Some(HealthState::Healthy));
        fail(&tracker, "alpha");
        assert_eq!(tracker.snapshot("alpha").map(|h| h.status), Some(HealthState::Degraded));
        for _ in 0..3 {
            fail(&tracker, "alpha");
        }
        assert_eq!(tracker.snapshot("alpha").map(|h| h.status), Some(HealthState::Unhealthy));

        tracker.record_success("alpha", Duration::from_millis(30));
        let health = tracker.snapshot("alpha").expect("registered");
        assert_eq!(health.status, HealthState::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!((health.average_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn history_is_capped_and_sanitized() {
        let tracker = tracker(100, 3);
        tracker.register("alpha");

        for _ in 0..5 {
            fail(&tracker, "alpha");
        }

        let history = tracker.failure_history("alpha");
        assert_eq!(history.len(), 3);
        assert!(history[0].context.get("token").is_none());
        assert_eq!(history[0].error_type, ErrorType::ProviderError);
        assert_eq!(tracker.snapshot("alpha").map(|h| h.failures), Some(5));
    }

    #[test]
    fn circuit_opens_at_threshold_and_emits_event() {
        let events = EventBus::new();
        let mut subscription = events.subscribe();
        let tracker = HealthTracker::new(
            CircuitBreakerConfig {
                threshold: 2,
                timeout_ms: 60_000,
            },
            10,
            events,
        );
        tracker.register("alpha");

        fail(&tracker, "alpha");
        assert!(!tracker.is_circuit_open("alpha"));
        fail(&tracker, "alpha");
        assert!(tracker.is_circuit_open("alpha"));

        let names = subscription
            .drain()
            .into_iter()
            .map(|event| event.name())
            .collect::<Vec<_>>();
        assert!(names.contains(&"circuit_opened"));
    }

    #[test]
    fn recent_failure_rate_uses_fixed_denominator() {
        let tracker = tracker(100, 10);
        tracker.register("alpha");

        assert_eq!(tracker.recent_failure_rate("alpha"), 0.0);
        fail(&tracker, "alpha");
        fail(&tracker, "alpha");
        assert!((tracker.recent_failure_rate("alpha") - 0.4).abs() < f64::EPSILON);
        for _ in 0..10 {
            fail(&tracker, "alpha");
        }
        assert!((tracker.recent_failure_rate("alpha") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn removing_a_provider_drops_its_state() {
        let tracker = tracker(5, 10);
        tracker.register("alpha");
        fail(&tracker, "alpha");

        assert!(tracker.remove("alpha"));
        assert!(tracker.snapshot("alpha").is_none());
        assert!(tracker.failure_history("alpha").is_empty());
        assert!(!tracker.remove("alpha"));
    }
}
