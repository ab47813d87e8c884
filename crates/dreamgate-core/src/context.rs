//! Per-request retry context carried across provider switches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::classification::ErrorType;

/// One provider switch inside a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub from: String,
    pub to: String,
    pub reason: ErrorType,
    /// Total attempts spent when the switch happened.
    pub attempt: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// State for a single logical request, created once and dropped when the
/// request terminates.
#[derive(Debug, Clone)]
pub struct RetryContext {
    request_id: String,
    original_context: Map<String, Value>,
    preserve: bool,
    previous_provider: Option<String>,
    switch_reason: Option<ErrorType>,
    switch_history: Vec<SwitchRecord>,
    total_attempts: u32,
    provider_switches: u32,
}

impl RetryContext {
    /// Build the context. With `preserve` set only `fields` survive from the
    /// caller context; otherwise the caller context is forwarded untouched.
    pub fn new(
        request_id: impl Into<String>,
        caller_context: &Value,
        fields: &[String],
        preserve: bool,
    ) -> Self {
        let original_context = match caller_context {
            Value::Object(map) if preserve => map
                .iter()
                .filter(|(key, _)| fields.iter().any(|field| field == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        Self {
            request_id: request_id.into(),
            original_context,
            preserve,
            previous_provider: None,
            switch_reason: None,
            switch_history: Vec::new(),
            total_attempts: 0,
            provider_switches: 0,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub const fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub const fn provider_switches(&self) -> u32 {
        self.provider_switches
    }

    pub fn switch_history(&self) -> &[SwitchRecord] {
        &self.switch_history
    }

    pub fn previous_provider(&self) -> Option<&str> {
        self.previous_provider.as_deref()
    }

    pub fn original_context(&self) -> &Map<String, Value> {
        &self.original_context
    }

    /// Count one attempt and return the new total.
    pub fn begin_attempt(&mut self) -> u32 {
        self.total_attempts = self.total_attempts.saturating_add(1);
        self.total_attempts
    }

    pub fn record_switch(&mut self, from: &str, to: &str, reason: ErrorType) -> &SwitchRecord {
        self.provider_switches = self.provider_switches.saturating_add(1);
        self.previous_provider = Some(from.to_owned());
        self.switch_reason = Some(reason);
        self.switch_history.push(SwitchRecord {
            from: from.to_owned(),
            to: to.to_owned(),
            reason,
            attempt: self.total_attempts,
            at: OffsetDateTime::now_utc(),
        });
        self.switch_history
            .last()
            .expect("switch history was just appended")
    }

    /// Context handed to the provider for its `attempt`-th try.
    pub fn attempt_context(&self, provider_attempt: u32) -> Value {
        let mut context = self.original_context.clone();
        context.insert(
            String::from("requestId"),
            Value::String(self.request_id.clone()),
        );
        context.insert(String::from("attempt"), Value::from(provider_attempt));
        context.insert(
            String::from("totalAttempts"),
            Value::from(self.total_attempts),
        );

        if self.preserve && !self.switch_history.is_empty() {
            context.insert(
                String::from("previousProvider"),
                self.previous_provider
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            context.insert(
                String::from("switchReason"),
                self.switch_reason
                    .map(|reason| Value::String(reason.as_str().to_owned()))
                    .unwrap_or(Value::Null),
            );
            context.insert(
                String::from("switchHistory"),
                serde_json::to_value(&self.switch_history).unwrap_or(Value::Null),
            );
        }

        Value::Object(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Vec<String> {
        vec![String::from("userId"), String::from("style")]
    }

    #[test]
    fn preserving_context_keeps_only_whitelisted_fields() {
        let caller = json!({ "userId": "u-7", "style": "surreal", "apiKey": "sk" });
        let context = RetryContext::new("req-1", &caller, &fields(), true);

        let attempt = context.attempt_context(1);

        assert_eq!(attempt["userId"], "u-7");
        assert_eq!(attempt["style"], "surreal");
        assert!(attempt.get("apiKey").is_none());
        assert_eq!(attempt["requestId"], "req-1");
    }

    #[test]
    fn switch_metadata_is_merged_after_first_switch() {
        let caller = json!({ "userId": "u-7" });
        let mut context = RetryContext::new("req-2", &caller, &fields(), true);
        context.begin_attempt();
        context.begin_attempt();

        assert!(context.attempt_context(1).get("previousProvider").is_none());

        context.record_switch("alpha", "beta", ErrorType::NetworkError);
        let attempt = context.attempt_context(1);

        assert_eq!(attempt["previousProvider"], "alpha");
        assert_eq!(attempt["switchReason"], "network_error");
        assert_eq!(attempt["switchHistory"][0]["to"], "beta");
        assert_eq!(attempt["switchHistory"][0]["attempt"], 2);
        assert_eq!(context.provider_switches(), 1);
    }

    #[test]
    fn without_preservation_caller_context_is_forwarded_as_is() {
        let caller = json!({ "userId": "u-7", "extra": true });
        let mut context = RetryContext::new("req-3", &caller, &fields(), false);
        context.record_switch("alpha", "beta", ErrorType::Timeout);

        let attempt = context.attempt_context(1);

        assert_eq!(attempt["extra"], true);
        assert!(attempt.get("switchHistory").is_none());
    }
}
