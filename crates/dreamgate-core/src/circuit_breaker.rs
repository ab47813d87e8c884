use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Runtime circuit state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit.
    pub threshold: u32,
    /// Counting window, and the quiet period required before closing.
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// State change reported by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
}

/// Sliding-window circuit breaker for one provider.
///
/// The breaker holds no lock of its own; it lives inside the provider's
/// health record so a failure, its history entry and the circuit update are
/// applied together. Callers pass `now` so the window is testable.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failures: VecDeque::new(),
            opened_at: None,
            last_failure: None,
        }
    }

    /// Count a failure; reports `Opened` when this failure trips the circuit.
    pub fn record_failure(&mut self, now: Instant) -> Option<CircuitTransition> {
        if self.opened_at.is_some() && !self.is_open(now) {
            self.opened_at = None;
        }
        self.prune(now);
        self.failures.push_back(now);
        self.last_failure = Some(now);

        if self.opened_at.is_none() && self.failures.len() as u64 >= u64::from(self.config.threshold) {
            self.opened_at = Some(now);
            return Some(CircuitTransition::Opened);
        }
        None
    }

    /// Re-evaluate the circuit at `now`; reports `Closed` once the quiet
    /// period has elapsed since the last counted failure.
    pub fn poll(&mut self, now: Instant) -> Option<CircuitTransition> {
        self.opened_at?;
        let quiet = self
            .last_failure
            .map(|last| now.saturating_duration_since(last) >= self.config.timeout())
            .unwrap_or(true);

        if quiet {
            self.opened_at = None;
            self.failures.clear();
            return Some(CircuitTransition::Closed);
        }
        None
    }

    pub fn is_open(&self, now: Instant) -> bool {
        let Some(_) = self.opened_at else {
            return false;
        };
        self.last_failure
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.timeout())
    }

    pub fn state(&self, now: Instant) -> CircuitState {
        if self.is_open(now) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Failures currently inside the window.
    pub fn failure_count(&self, now: Instant) -> usize {
        let window = self.config.timeout();
        self.failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < window)
            .count()
    }

    pub const fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn reset(&mut self) {
        self.failures.clear();
        self.opened_at = None;
        self.last_failure = None;
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.timeout();
        while self
            .failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            self.failures.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            threshold,
            timeout_ms,
        })
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let mut breaker = breaker(3, 1_000);
        let start = Instant::now();

        assert_eq!(breaker.record_failure(start), None);
        assert_eq!(breaker.record_failure(start + Duration::from_millis(10)), None);
        assert_eq!(breaker.state(start + Duration::from_millis(10)), CircuitState::Closed);

        let opened = breaker.record_failure(start + Duration::from_millis(20));
        assert_eq!(opened, Some(CircuitTransition::Opened));
        assert!(breaker.is_open(start + Duration::from_millis(20)));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let mut breaker = breaker(2, 100);
        let start = Instant::now();

        breaker.record_failure(start);
        let later = start + Duration::from_millis(150);
        assert_eq!(breaker.record_failure(later), None);
        assert_eq!(breaker.failure_count(later), 1);
        assert_eq!(breaker.state(later), CircuitState::Closed);
    }

    #[test]
    fn stays_open_while_failures_keep_arriving() {
        let mut breaker = breaker(1, 100);
        let start = Instant::now();

        breaker.record_failure(start);
        let during = start + Duration::from_millis(80);
        breaker.record_failure(during);

        let after_first_timeout = start + Duration::from_millis(120);
        assert_eq!(breaker.poll(after_first_timeout), None);
        assert!(breaker.is_open(after_first_timeout));

        let quiet = during + Duration::from_millis(100);
        assert_eq!(breaker.poll(quiet), Some(CircuitTransition::Closed));
        assert_eq!(breaker.state(quiet), CircuitState::Closed);
        assert_eq!(breaker.failure_count(quiet), 0);
    }

    #[test]
    fn success_does_not_close_an_open_circuit() {
        let mut breaker = breaker(1, 10_000);
        let start = Instant::now();

        breaker.record_failure(start);

        assert!(breaker.is_open(start + Duration::from_millis(1)));
        assert_eq!(breaker.poll(start + Duration::from_millis(1)), None);
    }
}
