//! Retry budget, backoff, switch delay and attempt timeout math.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classification::{ErrorClassification, ErrorType};
use crate::error::CoreError;

/// Configuration for the intelligent retry system.
///
/// Durations are stored in milliseconds so the struct maps one-to-one onto
/// TOML and `DREAMGATE_RETRY_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    /// Relative jitter applied to each delay (`0.1` means +/- 10%).
    pub jitter_factor: f64,
    /// Longest upstream `Retry-After` waited out on the same provider. A
    /// longer hint moves the request to the next provider instead.
    pub max_retry_after_ms: u64,
    /// Attempts allowed across all providers for one request.
    pub max_retry_attempts: u32,
    /// Attempts allowed on a single provider before switching is considered.
    pub max_provider_retries: u32,
    pub max_provider_switches: u32,
    pub enable_provider_switching: bool,
    /// Switch after any failure instead of spending the provider budget.
    pub switch_on_first_failure: bool,
    pub preserve_context: bool,
    /// Caller context keys carried across provider switches.
    pub context_fields: Vec<String>,
    /// Recent failure rate above which a provider is abandoned early.
    pub failure_rate_switch_threshold: f64,
    pub switch_delay_base_ms: u64,
    pub switch_delay_max_ms: u64,
    pub switch_delay_factor: f64,
    pub attempt_timeout_base_ms: u64,
    pub attempt_timeout_max_ms: u64,
    /// Per-provider scaling of the attempt timeout (slow models get more).
    pub provider_timeout_multipliers: BTreeMap<String, f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.1,
            max_retry_after_ms: 120_000,
            max_retry_attempts: 6,
            max_provider_retries: 2,
            max_provider_switches: 3,
            enable_provider_switching: true,
            switch_on_first_failure: false,
            preserve_context: true,
            context_fields: [
                "userId",
                "sessionId",
                "style",
                "quality",
                "userType",
                "streaming",
                "options",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            failure_rate_switch_threshold: 0.6,
            switch_delay_base_ms: 500,
            switch_delay_max_ms: 5_000,
            switch_delay_factor: 1.5,
            attempt_timeout_base_ms: 30_000,
            attempt_timeout_max_ms: 120_000,
            provider_timeout_multipliers: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    /// Configuration with millisecond delays and no jitter, for tests and
    /// offline runs.
    pub fn fast() -> Self {
        Self {
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_enabled: false,
            max_retry_after_ms: 50,
            switch_delay_base_ms: 1,
            switch_delay_max_ms: 2,
            attempt_timeout_base_ms: 1_000,
            attempt_timeout_max_ms: 2_000,
            ..Self::default()
        }
    }

    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub const fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(CoreError::configuration(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(CoreError::configuration(
                "retry.backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CoreError::configuration(
                "retry.jitter_factor must be within [0, 1]",
            ));
        }
        if self.max_provider_retries == 0 || self.max_retry_attempts == 0 {
            return Err(CoreError::configuration(
                "retry.max_provider_retries and retry.max_retry_attempts must be at least 1",
            ));
        }
        if self.attempt_timeout_base_ms == 0
            || self.attempt_timeout_base_ms > self.attempt_timeout_max_ms
        {
            return Err(CoreError::configuration(
                "retry.attempt_timeout_base_ms must be within (0, attempt_timeout_max_ms]",
            ));
        }
        if let Some((name, _)) = self
            .provider_timeout_multipliers
            .iter()
            .find(|(_, multiplier)| **multiplier <= 0.0 || !multiplier.is_finite())
        {
            return Err(CoreError::configuration(format!(
                "retry.provider_timeout_multipliers.{name} must be a positive number"
            )));
        }
        Ok(())
    }

    /// Deterministic backoff before retry `attempt` (1-based), clamped to
    /// `[base_delay, max_delay]`.
    pub fn backoff_without_jitter(
        &self,
        attempt: u32,
        error_type: ErrorType,
        failure_rate: f64,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay_ms as f64
            * self.backoff_multiplier.powi(exponent)
            * error_type.backoff_multiplier()
            * failure_rate_multiplier(failure_rate);
        self.clamp_delay(millis)
    }

    /// Backoff with jitter applied, still clamped to `[base_delay, max_delay]`.
    pub fn backoff_delay(&self, attempt: u32, error_type: ErrorType, failure_rate: f64) -> Duration {
        let delay = self.backoff_without_jitter(attempt, error_type, failure_rate);
        if !self.jitter_enabled || self.jitter_factor <= 0.0 {
            return delay;
        }

        let offset = (fastrand::f64() * 2.0 - 1.0) * self.jitter_factor;
        self.clamp_delay(delay.as_millis() as f64 * (1.0 + offset))
    }

    /// Delay before retrying the same provider. An upstream `Retry-After`
    /// replaces the computed backoff, capped at `max_retry_after`.
    pub fn retry_delay(
        &self,
        attempt: u32,
        classification: &ErrorClassification,
        failure_rate: f64,
    ) -> Duration {
        match classification.retry_after {
            Some(hint) => hint.min(self.max_retry_after()),
            None => self.backoff_delay(attempt, classification.error_type, failure_rate),
        }
    }

    /// Whether the upstream asked for a longer pause than this config waits
    /// out on one provider.
    pub fn retry_after_exceeds_cap(&self, classification: &ErrorClassification) -> bool {
        classification
            .retry_after
            .is_some_and(|hint| hint > self.max_retry_after())
    }

    /// Pause before the `switch_count`-th provider switch (1-based).
    pub fn switch_delay(&self, switch_count: u32) -> Duration {
        let exponent = switch_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.switch_delay_base_ms as f64 * self.switch_delay_factor.powi(exponent);
        Duration::from_millis(millis.min(self.switch_delay_max_ms as f64).max(0.0) as u64)
    }

    /// Timeout for attempt `attempt` (1-based) on `provider`.
    pub fn attempt_timeout(&self, attempt: u32, provider: &str) -> Duration {
        let multiplier = self
            .provider_timeout_multipliers
            .get(provider)
            .copied()
            .unwrap_or(1.0);
        self.scaled_attempt_timeout(attempt, multiplier)
    }

    /// Timeout for attempt `attempt` with an explicit provider multiplier.
    pub fn scaled_attempt_timeout(&self, attempt: u32, multiplier: f64) -> Duration {
        let growth = 1.0 + 0.5 * f64::from(attempt.saturating_sub(1));
        let millis = self.attempt_timeout_base_ms as f64 * growth * multiplier;
        Duration::from_millis(millis.min(self.attempt_timeout_max_ms as f64).max(1.0) as u64)
    }

    fn clamp_delay(&self, millis: f64) -> Duration {
        let min = self.base_delay_ms as f64;
        let max = self.max_delay_ms.max(self.base_delay_ms) as f64;
        let millis = if millis.is_finite() { millis } else { max };
        Duration::from_millis(millis.clamp(min, max).round() as u64)
    }
}

/// Backoff scaling for providers that have been failing recently.
pub fn failure_rate_multiplier(failure_rate: f64) -> f64 {
    if failure_rate > 0.7 {
        2.0
    } else if failure_rate > 0.5 {
        1.5
    } else if failure_rate > 0.3 {
        1.2
    } else {
        1.0
    }
}
