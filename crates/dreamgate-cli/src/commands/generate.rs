use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use dreamgate_core::{
    CacheMode, CoreConfig, CoreError, FallbackOptions, GenerationOptions, ProviderManager,
    ProviderRegistry, QualityTier, RetryOptions, ScriptedProvider,
};

use crate::cli::GenerateArgs;
use crate::error::CliError;
use crate::output::EnvelopeError;

use super::{to_operation, CommandResult};

pub const MOCK_PROVIDER: &str = "mock";

#[derive(Debug, Serialize)]
struct FailureData {
    total_attempts: u32,
    provider_switches: u32,
}

pub async fn run(
    args: &GenerateArgs,
    config: CoreConfig,
    registry: &ProviderRegistry,
) -> Result<CommandResult, CliError> {
    let options = generation_options(args)?;
    let manager = ProviderManager::from_registry(config, registry)?;
    if args.mock {
        manager.register_provider(MOCK_PROVIDER, Arc::new(ScriptedProvider::new()))?;
    }
    if manager.provider_names().is_empty() {
        return Err(CliError::Command(String::from(
            "no providers configured; add a registry file or pass --mock",
        )));
    }

    let mut retry = RetryOptions::default();
    if let Some(timeout_ms) = args.timeout_ms {
        retry = retry.with_timeout(Duration::from_millis(timeout_ms));
    }
    let mut fallback = FallbackOptions::default()
        .with_retry(retry)
        .with_operation(to_operation(args.operation));
    if !args.providers.is_empty() {
        fallback = fallback.with_providers(args.providers.iter().cloned());
    }
    if args.no_cache {
        fallback = fallback.with_cache_mode(CacheMode::Bypass);
    }

    let outcome = manager.generate_dream(&args.prompt, options, fallback).await;
    manager.shutdown().await;

    match outcome {
        Ok(response) => {
            info!(
                request_id = %response.request_id,
                provider = %response.provider,
                attempts = response.total_attempts,
                "generation finished"
            );
            let warnings = response
                .pipeline
                .as_ref()
                .map(|metadata| metadata.warnings.clone())
                .unwrap_or_default();
            let mut source_chain = response
                .switch_history
                .iter()
                .map(|switch| switch.from.clone())
                .collect::<Vec<_>>();
            source_chain.push(response.provider.clone());

            Ok(CommandResult::ok(serde_json::to_value(&response)?)
                .with_warnings(warnings)
                .with_request_id(response.request_id.clone())
                .with_latency(response.latency_ms)
                .with_cache_hit(response.from_cache)
                .with_source_chain(source_chain))
        }
        Err(error) => failure_result(error),
    }
}

/// Exhausted, cancelled and timed-out runs are reported in the envelope;
/// everything else is a command error.
fn failure_result(error: CoreError) -> Result<CommandResult, CliError> {
    let Some((total_attempts, provider_switches)) = error.attempt_summary() else {
        return Err(error.into());
    };

    let details = match &error {
        CoreError::Exhausted(exhausted) => {
            let mut chain = exhausted
                .switch_history
                .iter()
                .map(|switch| switch.from.clone())
                .collect::<Vec<_>>();
            if let Some(last) = &exhausted.last_provider {
                chain.push(last.clone());
            }
            Some((
                exhausted.last_error_type.as_str(),
                true,
                exhausted.request_id.clone(),
                chain,
            ))
        }
        CoreError::Cancelled { request_id, .. } => {
            Some(("cancelled", false, request_id.clone(), Vec::new()))
        }
        CoreError::DeadlineExceeded { request_id, .. } => {
            Some(("deadline_exceeded", true, request_id.clone(), Vec::new()))
        }
        _ => None,
    };
    let Some((code, retryable, request_id, source_chain)) = details else {
        return Err(error.into());
    };

    let data = serde_json::to_value(FailureData {
        total_attempts,
        provider_switches,
    })?;
    Ok(CommandResult::ok(data)
        .with_error(EnvelopeError::new(code, error.to_string()).with_retryable(retryable))
        .with_request_id(request_id)
        .with_source_chain(source_chain))
}

fn generation_options(args: &GenerateArgs) -> Result<GenerationOptions, CliError> {
    let mut options = GenerationOptions::default();
    if let Some(quality) = &args.quality {
        let quality = quality.parse::<QualityTier>().map_err(CliError::Command)?;
        options = options.with_quality(quality);
    }
    if let Some(style) = &args.style {
        options = options.with_style(style.clone());
    }
    Ok(options)
}
