use std::collections::BTreeMap;

use serde::Serialize;

use dreamgate_core::{
    CoreConfig, ProviderHealth, ProviderKind, ProviderManager, ProviderRegistry,
};

use crate::cli::ProvidersArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct ProviderStatus {
    name: String,
    kind: ProviderKind,
    enabled: bool,
    priority: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    api_key_var: String,
    api_key_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<ProviderHealth>,
}

#[derive(Debug, Serialize)]
struct ProvidersResponseData {
    available_kinds: Vec<&'static str>,
    providers: Vec<ProviderStatus>,
}

pub async fn run(
    args: &ProvidersArgs,
    config: CoreConfig,
    registry: &ProviderRegistry,
) -> Result<CommandResult, CliError> {
    let mut warnings = Vec::new();
    if registry.is_empty() {
        warnings.push(String::from("no providers configured"));
    }

    let health = if args.check {
        let manager = ProviderManager::from_registry(config, registry)?;
        let health = manager.check_all_providers().await;
        manager.shutdown().await;
        health
    } else {
        BTreeMap::new()
    };

    let providers = registry
        .entries()
        .map(|entry| {
            let api_key_var = entry.api_key_var();
            let api_key_present = std::env::var_os(&api_key_var).is_some_and(|key| !key.is_empty());
            if entry.kind == ProviderKind::Http && !api_key_present {
                warnings.push(format!("{} has no API key ({api_key_var})", entry.name));
            }
            ProviderStatus {
                name: entry.name.clone(),
                kind: entry.kind,
                enabled: entry.enabled,
                priority: entry.priority,
                endpoint: entry.endpoint.clone(),
                model: entry.model.clone(),
                api_key_var,
                api_key_present,
                health: health.get(&entry.name).cloned(),
            }
        })
        .collect::<Vec<_>>();

    let data = serde_json::to_value(ProvidersResponseData {
        available_kinds: ProviderRegistry::available_kinds()
            .iter()
            .map(|kind| kind.as_str())
            .collect(),
        providers,
    })?;

    Ok(CommandResult::ok(data)
        .with_warnings(warnings)
        .with_source_chain(registry.enabled().map(|entry| entry.name.clone()).collect()))
}
