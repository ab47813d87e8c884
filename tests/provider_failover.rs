//! Behavior-driven tests for provider failover
//!
//! These tests verify HOW a request moves between providers when upstreams
//! fail, focusing on what the caller observes: which provider answered, how
//! many attempts were spent, and what context the next provider received.

use std::sync::Arc;
use std::time::Duration;

use dreamgate_core::{
    fallback_scene, CacheMode, CircuitBreakerConfig, CircuitState, CoreConfig, CoreError,
    CoreEvent, ErrorType, FallbackOptions, GenerationOptions, ProviderError, ProviderManager,
    ProviderSettings, RetryConfig, RetryOptions, ScriptedProvider,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn fast_config() -> CoreConfig {
    CoreConfig {
        retry: RetryConfig::fast(),
        ..CoreConfig::default()
    }
}

fn uncached(providers: &[&str]) -> FallbackOptions {
    FallbackOptions::default()
        .with_providers(providers.iter().copied())
        .with_cache_mode(CacheMode::Bypass)
}

fn refused() -> ProviderError {
    ProviderError::connection("ECONNREFUSED", "connect ECONNREFUSED 10.0.0.1:443")
}

// =============================================================================
// Failover: Retryable Failures
// =============================================================================

#[tokio::test]
async fn when_first_provider_keeps_refusing_connections_second_provider_answers() {
    // Given: Three providers where the first refuses every connection
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    let first = Arc::new(ScriptedProvider::failing(refused()));
    let second = Arc::new(ScriptedProvider::answering(fallback_scene("floating library")));
    let third = Arc::new(ScriptedProvider::new());
    manager.register_provider("first", first.clone()).expect("first registers");
    manager.register_provider("second", second.clone()).expect("second registers");
    manager.register_provider("third", third.clone()).expect("third registers");

    // When: A dream is requested across all three
    let response = manager
        .generate_dream(
            "floating library",
            GenerationOptions::default(),
            uncached(&["first", "second", "third"]),
        )
        .await
        .expect("second provider answers");

    // Then: The first provider used its retry budget and the second answered
    assert_eq!(response.provider, "second");
    assert_eq!(first.calls(), 2, "network errors are retried before switching");
    assert_eq!(response.total_attempts, 3);
    assert_eq!(response.provider_switches, 1);
    assert_eq!(response.switch_history[0].reason, ErrorType::NetworkError);
    assert_eq!(third.calls(), 0, "later providers are not contacted");
}

#[tokio::test]
async fn when_provider_recovers_on_retry_no_switch_happens() {
    // Given: A provider that times out once and then answers
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    let flaky = Arc::new(
        ScriptedProvider::new()
            .fail(ProviderError::timeout("request timed out"))
            .respond(fallback_scene("tidal clock")),
    );
    manager.register_provider("flaky", flaky.clone()).expect("registers");
    manager
        .register_provider("backup", Arc::new(ScriptedProvider::new()))
        .expect("registers");

    // When: A dream is requested
    let response = manager
        .generate_dream("tidal clock", GenerationOptions::default(), uncached(&["flaky", "backup"]))
        .await
        .expect("flaky provider answers on retry");

    // Then: The same provider answered on its second attempt
    assert_eq!(response.provider, "flaky");
    assert_eq!(response.total_attempts, 2);
    assert_eq!(response.provider_switches, 0);
    assert_eq!(flaky.calls(), 2);
}

#[tokio::test]
async fn when_provider_asks_for_a_long_pause_request_moves_on_without_waiting() {
    // Given: A provider whose Retry-After is far beyond the configured cap
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    let limited = Arc::new(ScriptedProvider::failing(ProviderError::rate_limited(3_600)));
    manager.register_provider("limited", limited.clone()).expect("registers");
    manager
        .register_provider("spare", Arc::new(ScriptedProvider::new()))
        .expect("registers");

    // When: A dream is requested
    let response = manager
        .generate_dream("quiet harbor", GenerationOptions::default(), uncached(&["limited", "spare"]))
        .await
        .expect("spare provider answers");

    // Then: The request switched after one attempt instead of sleeping an hour
    assert_eq!(response.provider, "spare");
    assert_eq!(limited.calls(), 1);
    assert_eq!(response.switch_history[0].reason, ErrorType::RateLimit);
}

// =============================================================================
// Failover: Non-Retryable Failures
// =============================================================================

#[tokio::test]
async fn when_every_provider_rejects_credentials_request_is_exhausted_without_retries() {
    // Given: Two providers that both reject the API key
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    let unauthorized = || ProviderError::http(401, "Unauthorized");
    manager
        .register_provider("first", Arc::new(ScriptedProvider::failing(unauthorized())))
        .expect("registers");
    manager
        .register_provider("second", Arc::new(ScriptedProvider::failing(unauthorized())))
        .expect("registers");

    // When: A dream is requested
    let error = manager
        .generate_dream("silent city", GenerationOptions::default(), uncached(&["first", "second"]))
        .await
        .expect_err("no provider can answer");

    // Then: Exactly one attempt per provider and one switch were spent
    let CoreError::Exhausted(exhausted) = error else {
        panic!("expected exhaustion, got {error:?}");
    };
    assert_eq!(exhausted.total_attempts, 2);
    assert_eq!(exhausted.provider_switches, 1);
    assert_eq!(exhausted.last_error_type, ErrorType::Authentication);
    assert_eq!(exhausted.last_provider.as_deref(), Some("second"));
    assert!(exhausted.to_string().contains("2 attempt"));
}

#[tokio::test]
async fn when_provider_is_switched_whitelisted_context_follows_the_request() {
    // Given: A caller context with whitelisted fields and a secret
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    let second = Arc::new(ScriptedProvider::new());
    manager
        .register_provider(
            "first",
            Arc::new(ScriptedProvider::failing(ProviderError::http(403, "Forbidden"))),
        )
        .expect("registers");
    manager.register_provider("second", second.clone()).expect("registers");
    let context = json!({ "userId": "u-42", "sessionId": "s-1", "apiToken": "do-not-forward" });

    // When: The first provider refuses and the request moves on
    manager
        .generate_dream(
            "glass orchard",
            GenerationOptions::default(),
            uncached(&["first", "second"])
                .with_retry(RetryOptions::default().with_context(context)),
        )
        .await
        .expect("second provider answers");

    // Then: The second provider sees the preserved fields and the switch
    let received = &second.contexts()[0];
    assert_eq!(received["userId"], "u-42");
    assert_eq!(received["sessionId"], "s-1");
    assert_eq!(received["previousProvider"], "first");
    assert_eq!(received["switchReason"], "authentication");
    assert!(received.get("apiToken").is_none(), "unlisted fields are dropped");
}

// =============================================================================
// Failover: Circuit Breaking and Priorities
// =============================================================================

#[tokio::test]
async fn when_circuit_is_open_provider_is_skipped_for_later_requests() {
    // Given: A circuit that opens after a single failure
    let config = CoreConfig {
        circuit_breaker: CircuitBreakerConfig {
            threshold: 1,
            timeout_ms: 60_000,
        },
        ..fast_config()
    };
    let manager = ProviderManager::new(config).expect("manager builds");
    let broken = Arc::new(ScriptedProvider::failing(ProviderError::http(401, "Unauthorized")));
    manager
        .register_provider_with(
            "broken",
            broken.clone(),
            ProviderSettings::default().with_priority(90.0),
        )
        .expect("registers");
    manager
        .register_provider_with(
            "steady",
            Arc::new(ScriptedProvider::new()),
            ProviderSettings::default().with_priority(40.0),
        )
        .expect("registers");
    let options = FallbackOptions::default().with_cache_mode(CacheMode::Bypass);

    // When: Two requests run back to back
    let first = manager
        .generate_dream("copper moon", GenerationOptions::default(), options.clone())
        .await
        .expect("steady answers the first request");
    let second = manager
        .generate_dream("copper moon", GenerationOptions::default(), options)
        .await
        .expect("steady answers the second request");

    // Then: The broken provider was tried once and then bypassed
    assert_eq!(first.provider_switches, 1);
    assert_eq!(second.provider, "steady");
    assert_eq!(second.provider_switches, 0);
    assert_eq!(broken.calls(), 1);
    let health = manager.get_health_status(Some("broken"));
    assert_eq!(health["broken"].circuit, CircuitState::Open);
}

#[tokio::test]
async fn when_requests_complete_priorities_follow_performance() {
    // Given: A preferred provider that fails and a fallback that answers fast
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    manager
        .register_provider_with(
            "preferred",
            Arc::new(ScriptedProvider::failing(ProviderError::http(401, "Unauthorized"))),
            ProviderSettings::default().with_priority(80.0),
        )
        .expect("registers");
    manager
        .register_provider_with(
            "fallback",
            Arc::new(ScriptedProvider::new()),
            ProviderSettings::default().with_priority(50.0),
        )
        .expect("registers");

    // When: One request runs
    manager
        .generate_dream("paper sky", GenerationOptions::default(), FallbackOptions::default())
        .await
        .expect("fallback answers");

    // Then: The failing provider lost priority and the fast one gained it
    let preferences = manager.preferences();
    assert!(preferences.get_provider_priority("preferred") < 80.0);
    assert!(preferences.get_provider_priority("fallback") > 50.0);
}

#[tokio::test]
async fn when_provider_switches_observers_are_notified() {
    // Given: A subscriber on the manager's event bus
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    manager
        .register_provider(
            "first",
            Arc::new(ScriptedProvider::failing(ProviderError::http(401, "Unauthorized"))),
        )
        .expect("registers");
    manager
        .register_provider("second", Arc::new(ScriptedProvider::new()))
        .expect("registers");
    let mut events = manager.subscribe();

    // When: A request fails over
    manager
        .generate_dream("ink river", GenerationOptions::default(), uncached(&["first", "second"]))
        .await
        .expect("second provider answers");

    // Then: A switch and a success event were published
    let events = events.drain();
    assert!(events.iter().any(|event| matches!(
        event,
        CoreEvent::ProviderSwitch { from, to, reason: ErrorType::Authentication, .. }
            if from == "first" && to == "second"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        CoreEvent::OperationSuccess { provider, provider_switches: 1, .. } if provider == "second"
    )));
}

// =============================================================================
// Failover: Caller Control
// =============================================================================

#[tokio::test]
async fn when_caller_cancels_during_backoff_no_further_attempts_are_made() {
    // Given: A failing provider and a long backoff
    let config = CoreConfig {
        retry: RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
            ..RetryConfig::fast()
        },
        ..CoreConfig::default()
    };
    let manager = ProviderManager::new(config).expect("manager builds");
    let busy = Arc::new(ScriptedProvider::failing(ProviderError::http(503, "busy")));
    manager.register_provider("busy", busy.clone()).expect("registers");
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    // When: The request is cancelled while waiting to retry
    let error = manager
        .generate_dream(
            "stalled tram",
            GenerationOptions::default(),
            uncached(&["busy"]).with_retry(RetryOptions::default().with_cancellation(token)),
        )
        .await
        .expect_err("request is cancelled");

    // Then: The single in-flight attempt was recorded and nothing else ran
    assert!(matches!(error, CoreError::Cancelled { total_attempts: 1, .. }));
    assert_eq!(busy.calls(), 1);
    let health = manager.get_health_status(Some("busy"));
    assert_eq!(health["busy"].failures, 1);
}

#[tokio::test]
async fn when_unknown_provider_is_requested_caller_gets_not_found() {
    // Given: A manager with one provider
    let manager = ProviderManager::new(fast_config()).expect("manager builds");
    manager
        .register_provider("known", Arc::new(ScriptedProvider::new()))
        .expect("registers");

    // When: The caller names a provider that was never registered
    let error = manager
        .generate_dream("lost map", GenerationOptions::default(), uncached(&["known", "ghost"]))
        .await
        .expect_err("unknown provider is rejected");

    // Then: The error names the missing provider
    assert!(matches!(error, CoreError::ProviderNotFound { ref name } if name == "ghost"));
}
