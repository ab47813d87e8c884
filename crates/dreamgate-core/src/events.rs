//! In-process observer channel for retry, preference and health events.
//!
//! Publishing never waits on subscribers: the bus is a `tokio` broadcast
//! channel, so a slow subscriber loses the oldest events and is told how many
//! it missed.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::classification::ErrorType;
use crate::health::HealthState;

const DEFAULT_CAPACITY: usize = 1024;

/// Events emitted by the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    PriorityChanged {
        provider: String,
        old_priority: f64,
        new_priority: f64,
    },
    DynamicAdjustmentApplied {
        provider: String,
        delta: f64,
        adjustment: f64,
        reason: String,
    },
    ProviderSwitch {
        request_id: String,
        from: String,
        to: String,
        reason: ErrorType,
        attempt: u32,
    },
    OperationSuccess {
        request_id: String,
        provider: String,
        total_attempts: u32,
        provider_switches: u32,
        latency_ms: u64,
    },
    OperationFailure {
        request_id: String,
        provider: Option<String>,
        error_type: ErrorType,
        total_attempts: u32,
        provider_switches: u32,
        message: String,
    },
    ContextualRuleAdded {
        rule_id: String,
    },
    ContextualRuleRemoved {
        rule_id: String,
    },
    CircuitOpened {
        provider: String,
        failures: usize,
    },
    CircuitClosed {
        provider: String,
    },
    HealthChanged {
        provider: String,
        from: HealthState,
        to: HealthState,
    },
}

impl CoreEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PriorityChanged { .. } => "priority_changed",
            Self::DynamicAdjustmentApplied { .. } => "dynamic_adjustment_applied",
            Self::ProviderSwitch { .. } => "provider_switch",
            Self::OperationSuccess { .. } => "operation_success",
            Self::OperationFailure { .. } => "operation_failure",
            Self::ContextualRuleAdded { .. } => "contextual_rule_added",
            Self::ContextualRuleRemoved { .. } => "contextual_rule_removed",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Broadcast event bus shared by the manager and its components.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CoreEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event; returns the number of subscribers that received it.
    pub fn publish(&self, event: CoreEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event = name, subscribers = count, "published event");
                count
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving half of the bus.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<CoreEvent>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Collect every event already queued without waiting.
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged behind");
                }
                Err(_) => return events,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();

        let delivered = bus.publish(CoreEvent::ContextualRuleAdded {
            rule_id: String::from("night"),
        });

        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe();

        bus.publish(CoreEvent::CircuitClosed {
            provider: String::from("alpha"),
        });

        let event = subscription.recv().await.expect("event should arrive");
        assert_eq!(event.name(), "circuit_closed");
    }

    #[test]
    fn lagging_subscriber_keeps_newest_events() {
        let bus = EventBus::with_capacity(2);
        let mut subscription = bus.subscribe();

        for index in 0..5 {
            bus.publish(CoreEvent::ContextualRuleRemoved {
                rule_id: format!("rule-{index}"),
            });
        }

        let events = subscription.drain();
        assert_eq!(
            events,
            vec![
                CoreEvent::ContextualRuleRemoved {
                    rule_id: String::from("rule-3")
                },
                CoreEvent::ContextualRuleRemoved {
                    rule_id: String::from("rule-4")
                },
            ]
        );
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = CoreEvent::CircuitOpened {
            provider: String::from("alpha"),
            failures: 5,
        };

        let json = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(json["event"], "circuit_opened");
        assert_eq!(json["failures"], 5);
    }
}
