//! Provider priority state: static base priority, a decaying performance
//! adjustment, and per-request contextual rules.
//!
//! ```text
//! priority(p)            = clamp(base(p) + adjustment(p), min, max)
//! contextual_priority(p) = clamp(priority(p) + sum(rule deltas for p), min, max)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classification::ErrorType;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::provider::QualityTier;

const SNAP_TO_ZERO: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceConfig {
    pub min_priority: f64,
    pub max_priority: f64,
    /// Base priority for providers registered without one.
    pub default_priority: f64,
    /// Fraction of the adjustment removed per decay tick.
    pub decay_rate: f64,
    pub decay_interval_ms: u64,
    /// Bound on the dynamic adjustment in either direction.
    pub max_adjustment: f64,
    pub fast_response_ms: u64,
    pub moderate_response_ms: u64,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            min_priority: 0.0,
            max_priority: 100.0,
            default_priority: 50.0,
            decay_rate: 0.1,
            decay_interval_ms: 3_600_000,
            max_adjustment: 50.0,
            fast_response_ms: 1_000,
            moderate_response_ms: 3_000,
        }
    }
}

impl PreferenceConfig {
    pub const fn decay_interval(&self) -> Duration {
        Duration::from_millis(self.decay_interval_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_priority > self.max_priority {
            return Err(CoreError::configuration(
                "preference.min_priority must not exceed preference.max_priority",
            ));
        }
        if !(0.0..=1.0).contains(&self.decay_rate) {
            return Err(CoreError::configuration(
                "preference.decay_rate must be within [0, 1]",
            ));
        }
        if self.decay_interval_ms == 0 {
            return Err(CoreError::configuration(
                "preference.decay_interval_ms must be greater than zero",
            ));
        }
        if self.max_adjustment < 0.0 {
            return Err(CoreError::configuration(
                "preference.max_adjustment must not be negative",
            ));
        }
        Ok(())
    }
}

/// Observed result of one attempt, fed back into the adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PerformanceSample {
    Success { latency: Duration },
    Failure { error_type: ErrorType },
}

/// Request attributes matched by contextual rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub quality: Option<QualityTier>,
    pub user_type: Option<String>,
    pub streaming: Option<bool>,
    /// Hour of day (UTC) used for time windows; the current hour when unset.
    pub hour: Option<u8>,
}

impl RequestContext {
    fn effective_hour(&self) -> u8 {
        self.hour
            .unwrap_or_else(|| OffsetDateTime::now_utc().hour())
    }
}

/// Hour window `[start, end)`; wraps past midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u8,
    pub end: u8,
}

impl HourWindow {
    pub const fn contains(self, hour: u8) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    pub quality: Option<QualityTier>,
    pub hours: Option<HourWindow>,
    pub user_type: Option<String>,
    pub streaming: Option<bool>,
}

impl RuleConditions {
    fn matches(&self, context: &RequestContext) -> bool {
        if let Some(quality) = self.quality {
            if context.quality != Some(quality) {
                return false;
            }
        }
        if let Some(user_type) = &self.user_type {
            if context.user_type.as_deref() != Some(user_type.as_str()) {
                return false;
            }
        }
        if let Some(streaming) = self.streaming {
            if context.streaming.unwrap_or(false) != streaming {
                return false;
            }
        }
        if let Some(window) = self.hours {
            if !window.contains(context.effective_hour()) {
                return false;
            }
        }
        true
    }
}

/// Per-request priority tweak. Never touches the decaying adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualRule {
    pub id: String,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub priority_deltas: BTreeMap<String, f64>,
    /// When non-empty, only these providers are eligible.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ContextualRule {
    pub fn new(id: impl Into<String>, conditions: RuleConditions) -> Self {
        Self {
            id: id.into(),
            conditions,
            priority_deltas: BTreeMap::new(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn with_delta(mut self, provider: impl Into<String>, delta: f64) -> Self {
        self.priority_deltas.insert(provider.into(), delta);
        self
    }

    pub fn including(mut self, provider: impl Into<String>) -> Self {
        self.include.push(provider.into());
        self
    }

    pub fn excluding(mut self, provider: impl Into<String>) -> Self {
        self.exclude.push(provider.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PreferenceSnapshot {
    pub base: f64,
    pub adjustment: f64,
    pub priority: f64,
}

/// Mutable provider preference state shared across requests.
#[derive(Debug)]
pub struct ProviderPreferenceManager {
    config: PreferenceConfig,
    base: DashMap<String, f64>,
    adjustments: DashMap<String, f64>,
    rules: DashMap<String, ContextualRule>,
    events: EventBus,
}

impl ProviderPreferenceManager {
    pub fn new(config: PreferenceConfig, events: EventBus) -> Self {
        Self {
            config,
            base: DashMap::new(),
            adjustments: DashMap::new(),
            rules: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &PreferenceConfig {
        &self.config
    }

    pub fn set_base_priority(&self, provider: &str, priority: f64) {
        let old = self.get_provider_priority(provider);
        let priority = priority.clamp(self.config.min_priority, self.config.max_priority);
        self.base.insert(provider.to_owned(), priority);
        self.publish_priority_change(provider, old);
    }

    pub fn remove_provider(&self, provider: &str) {
        self.base.remove(provider);
        self.adjustments.remove(provider);
    }

    pub fn get_provider_priority(&self, provider: &str) -> f64 {
        let base = self
            .base
            .get(provider)
            .map(|value| *value)
            .unwrap_or(self.config.default_priority);
        self.clamp_priority(base + self.adjustment(provider))
    }

    pub fn adjustment(&self, provider: &str) -> f64 {
        self.adjustments
            .get(provider)
            .map(|value| *value)
            .unwrap_or(0.0)
    }

    /// Priority for one request, or `None` when a matching rule excludes the
    /// provider.
    pub fn get_contextual_priority(&self, provider: &str, context: &RequestContext) -> Option<f64> {
        let mut priority = self.get_provider_priority(provider);
        for rule in self.matching_rules(context) {
            if rule.exclude.iter().any(|name| name == provider) {
                return None;
            }
            if !rule.include.is_empty() && !rule.include.iter().any(|name| name == provider) {
                return None;
            }
            priority += rule.priority_deltas.get(provider).copied().unwrap_or(0.0);
        }
        Some(self.clamp_priority(priority))
    }

    /// Feed an attempt outcome into the decaying adjustment. Samples for
    /// providers without a base priority are dropped.
    pub fn update_provider_performance(&self, provider: &str, sample: PerformanceSample) {
        if !self.base.contains_key(provider) {
            debug!(provider, "ignoring sample for unregistered provider");
            return;
        }
        let (delta, reason) = match sample {
            PerformanceSample::Success { latency } => {
                let millis = latency.as_millis();
                if millis < u128::from(self.config.fast_response_ms) {
                    (2.0, "fast_success")
                } else if millis < u128::from(self.config.moderate_response_ms) {
                    (1.0, "moderate_success")
                } else {
                    (0.0, "slow_success")
                }
            }
            PerformanceSample::Failure { error_type } => match error_type {
                ErrorType::Timeout => (-3.0, "timeout"),
                ErrorType::RateLimit => (-2.0, "rate_limit"),
                _ => (-1.0, "failure"),
            },
        };

        if delta == 0.0 {
            return;
        }

        let old = self.get_provider_priority(provider);
        let limit = self.config.max_adjustment;
        let adjustment = {
            let mut entry = self.adjustments.entry(provider.to_owned()).or_insert(0.0);
            *entry = (*entry + delta).clamp(-limit, limit);
            *entry
        };

        debug!(provider, delta, adjustment, reason, "applied dynamic adjustment");
        self.events.publish(CoreEvent::DynamicAdjustmentApplied {
            provider: provider.to_owned(),
            delta,
            adjustment,
            reason: reason.to_owned(),
        });
        self.publish_priority_change(provider, old);
    }

    /// One decay tick: shrink every adjustment by `decay_rate`, snapping
    /// near-zero values to zero.
    pub fn decay_adjustments(&self) {
        for mut entry in self.adjustments.iter_mut() {
            let value = *entry.value();
            let decayed = value - value * self.config.decay_rate;
            *entry.value_mut() = if decayed.abs() < SNAP_TO_ZERO { 0.0 } else { decayed };
        }
    }

    /// Run [`decay_adjustments`](Self::decay_adjustments) every decay
    /// interval until `shutdown` fires.
    pub fn spawn_decay_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.config.decay_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.decay_adjustments(),
                }
            }
            debug!("preference decay task stopped");
        })
    }

    pub fn add_contextual_rule(&self, rule: ContextualRule) {
        let rule_id = rule.id.clone();
        self.rules.insert(rule_id.clone(), rule);
        info!(rule_id = %rule_id, "contextual rule added");
        self.events.publish(CoreEvent::ContextualRuleAdded { rule_id });
    }

    pub fn remove_contextual_rule(&self, rule_id: &str) -> bool {
        let removed = self.rules.remove(rule_id).is_some();
        if removed {
            self.events.publish(CoreEvent::ContextualRuleRemoved {
                rule_id: rule_id.to_owned(),
            });
        }
        removed
    }

    pub fn contextual_rules(&self) -> Vec<ContextualRule> {
        let mut rules = self
            .rules
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        rules.sort_by(|left, right| left.id.cmp(&right.id));
        rules
    }

    /// Order `candidates` by priority descending, then by name. With a
    /// request context, contextual deltas apply and excluded providers drop.
    pub fn rank_providers(
        &self,
        candidates: &[String],
        context: Option<&RequestContext>,
    ) -> Vec<String> {
        let mut scored = candidates
            .iter()
            .filter_map(|name| {
                let priority = match context {
                    Some(context) => self.get_contextual_priority(name, context)?,
                    None => self.get_provider_priority(name),
                };
                Some((name.clone(), priority))
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| {
            right
                .1
                .total_cmp(&left.1)
                .then_with(|| left.0.cmp(&right.0))
        });
        scored.into_iter().map(|(name, _)| name).collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PreferenceSnapshot> {
        let mut names = self
            .base
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        names.extend(self.adjustments.iter().map(|entry| entry.key().clone()));

        names
            .into_iter()
            .map(|name| {
                let snapshot = PreferenceSnapshot {
                    base: self
                        .base
                        .get(&name)
                        .map(|value| *value)
                        .unwrap_or(self.config.default_priority),
                    adjustment: self.adjustment(&name),
                    priority: self.get_provider_priority(&name),
                };
                (name, snapshot)
            })
            .collect()
    }

    fn matching_rules(&self, context: &RequestContext) -> Vec<ContextualRule> {
        let mut rules = self
            .rules
            .iter()
            .filter(|entry| entry.value().conditions.matches(context))
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        rules.sort_by(|left, right| left.id.cmp(&right.id));
        rules
    }

    fn clamp_priority(&self, value: f64) -> f64 {
        value.clamp(self.config.min_priority, self.config.max_priority)
    }

    fn publish_priority_change(&self, provider: &str, old: f64) {
        let new = self.get_provider_priority(provider);
        if (new - old).abs() > f64::EPSILON {
            self.events.publish(CoreEvent::PriorityChanged {
                provider: provider.to_owned(),
                old_priority: old,
                new_priority: new,
            });
        }
    }
}
