//! # Dreamgate Core
//!
//! Resilience layer between an application and several interchangeable AI
//! model providers.
//!
//! ## Overview
//!
//! A request enters through [`ProviderManager`] and may be served from the
//! response cache. Otherwise it is routed to the highest-priority healthy
//! provider, retried with backoff, moved to another provider when the
//! failure warrants it, and its raw payload is normalized, repaired and
//! sanitized before it is returned.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Provider implementations (HTTP chat endpoint, scripted) |
//! | [`cache`] | Response cache with quality-aware TTLs |
//! | [`circuit_breaker`] | Failure-count circuit breaker |
//! | [`classification`] | Error taxonomy and context sanitizing |
//! | [`config`] | Layered configuration (defaults, TOML, environment) |
//! | [`context`] | Per-request retry context and switch history |
//! | [`error`] | Core error types |
//! | [`events`] | Broadcast event bus |
//! | [`health`] | Per-provider health and failure history |
//! | [`http_client`] | HTTP client abstraction |
//! | [`intelligent_retry`] | Retry with provider failover |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`manager`] | Provider manager façade |
//! | [`pipeline`] | Staged response processing |
//! | [`preference`] | Dynamic provider priorities and contextual rules |
//! | [`provider`] | Provider contract and generation options |
//! | [`registry`] | Provider configuration and factory |
//! | [`retry`] | Backoff, switch delay and timeout policy |
//! | [`throttling`] | Per-provider rate and concurrency limits |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dreamgate_core::{
//!     CoreConfig, FallbackOptions, GenerationOptions, ProviderManager, ScriptedProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ProviderManager::new(CoreConfig::default())?;
//!     manager.register_provider("local", Arc::new(ScriptedProvider::new()))?;
//!
//!     let response = manager
//!         .generate_dream("a lighthouse in the clouds", GenerationOptions::default(), FallbackOptions::default())
//!         .await?;
//!     println!("{} answered after {} attempt(s)", response.provider, response.total_attempts);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  CLI / Caller   │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ ProviderManager │────▶│ Response Cache   │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Intelligent     │────▶│ Health / Circuit │
//! │ Retry           │────▶│ Preferences      │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Provider        │────▶│ HTTP Client      │
//! │ (Capability)    │     │ (reqwest)        │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Response        │
//! │ Pipeline        │
//! └─────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Provider calls fail with [`ProviderError`]; [`classify`] maps each one to
//! an [`ErrorType`] that drives retry and failover. Manager operations return
//! [`CoreError`]:
//!
//! ```rust
//! use dreamgate_core::CoreError;
//!
//! fn describe(error: &CoreError) -> String {
//!     match error {
//!         CoreError::Exhausted(exhausted) => {
//!             format!("all providers failed: {}", exhausted.last_error_type)
//!         }
//!         CoreError::Cancelled { .. } => String::from("cancelled"),
//!         other => other.to_string(),
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - API keys are read from environment variables only and never logged
//! - Failure contexts are stripped of credentials before they are stored
//! - Sanitized content has script markup removed

pub mod adapters;
pub mod cache;
pub mod circuit_breaker;
pub mod classification;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod http_client;
pub mod intelligent_retry;
pub mod logging;
pub mod manager;
pub mod pipeline;
pub mod preference;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod throttling;

// Provider implementations
pub use adapters::{fallback_scene, HttpLlmProvider, ScriptedProvider};

// Caching
pub use cache::{CacheConfig, CacheMode, CacheStats, CachedResponse, ResponseCache, TtlPolicy};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

// Error classification
pub use classification::{
    classify, sanitize_context, ErrorClassification, ErrorType, RecoveryStrategy, Severity,
};

// Configuration and logging
pub use config::{ConfigLoader, CoreConfig, HealthConfig, LoggingConfig};
pub use logging::init_logging;

// Errors
pub use context::SwitchRecord;
pub use error::{CoreError, ExhaustedError, ProviderError};

// Events
pub use events::{CoreEvent, EventBus, EventSubscription};

// Health
pub use health::{FailureHistoryEntry, HealthState, HealthTracker, ProviderHealth};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpFuture, HttpMethod, HttpRequest,
    HttpResponse, ReqwestHttpClient,
};

// Retry and failover
pub use intelligent_retry::{
    IntelligentRetrySystem, ProviderHandle, RetryOptions, RetryOutcome, RetryStats,
};
pub use retry::RetryConfig;

// Manager
pub use manager::{
    CacheRequest, FallbackOptions, FallbackResponse, ManagerMetrics, ProviderManager,
    ProviderMetrics, ProviderSettings,
};

// Response processing
pub use pipeline::{
    OperationType, PipelineConfig, PipelineMetadata, PipelineResult, ProcessedResponse,
    ResponseProcessingPipeline, Stage,
};

// Preferences
pub use preference::{
    ContextualRule, HourWindow, PreferenceConfig, ProviderPreferenceManager, RequestContext,
    RuleConditions,
};

// Provider contract
pub use provider::{GenerationOptions, ProviderCapability, ProviderFuture, ProviderLimits, QualityTier};

// Registry
pub use registry::{ProviderEntry, ProviderKind, ProviderRegistry};

// Throttling
pub use throttling::ThrottlingQueue;
