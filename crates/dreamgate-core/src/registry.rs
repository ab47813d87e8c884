//! Static provider configuration and the factory that turns it into
//! provider instances.
//!
//! The registry document is TOML:
//!
//! ```toml
//! [[providers]]
//! name = "primary"
//! kind = "http"
//! endpoint = "https://llm.example.com/v1/generate"
//! priority = 80
//!
//! [providers.limits]
//! requests_per_minute = 120
//! max_concurrent = 4
//! ```
//!
//! API keys never live in the document. They are read from
//! `DREAMGATE_<NAME>_API_KEY` when a provider is instantiated.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapters::{HttpLlmProvider, ScriptedProvider};
use crate::error::CoreError;
use crate::provider::{ProviderCapability, ProviderLimits};

/// Provider implementations the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON completion endpoint over HTTP.
    Http,
    /// Offline provider answering with a deterministic scene.
    Scripted,
}

impl ProviderKind {
    pub const ALL: [Self; 2] = [Self::Http, Self::Scripted];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Scripted => "scripted",
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_priority() -> f64 {
    50.0
}

const fn default_enabled() -> bool {
    true
}

/// Static configuration for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub limits: ProviderLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Scales the retry system's per-attempt timeout for this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_multiplier: Option<f64>,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: default_priority(),
            enabled: true,
            limits: ProviderLimits::default(),
            endpoint: None,
            model: None,
            health_url: None,
            timeout_ms: None,
            timeout_multiplier: None,
        }
    }

    pub fn http(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::new(name, ProviderKind::Http)
        }
    }

    pub fn scripted(name: impl Into<String>) -> Self {
        Self::new(name, ProviderKind::Scripted)
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid_provider("provider name must not be empty"));
        }
        if !(0.0..=100.0).contains(&self.priority) {
            return Err(CoreError::invalid_provider(format!(
                "provider '{}' priority {} is outside 0..=100",
                self.name, self.priority
            )));
        }
        if self.kind == ProviderKind::Http
            && self.endpoint.as_deref().map_or(true, |endpoint| endpoint.trim().is_empty())
        {
            return Err(CoreError::invalid_provider(format!(
                "http provider '{}' needs an endpoint",
                self.name
            )));
        }
        if self
            .timeout_multiplier
            .is_some_and(|multiplier| !multiplier.is_finite() || multiplier <= 0.0)
        {
            return Err(CoreError::invalid_provider(format!(
                "provider '{}' timeout_multiplier must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Environment variable holding this provider's API key.
    pub fn api_key_var(&self) -> String {
        api_key_var(&self.name)
    }
}

/// `DREAMGATE_<NAME>_API_KEY`, with the name upper-cased and anything other
/// than ASCII letters and digits replaced by `_`.
pub fn api_key_var(name: &str) -> String {
    let normalized = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("DREAMGATE_{normalized}_API_KEY")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    providers: Vec<ProviderEntry>,
}

/// Provider configurations keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries, rejecting invalid or duplicate names.
    pub fn from_entries(entries: impl IntoIterator<Item = ProviderEntry>) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for entry in entries {
            entry.validate()?;
            if registry.entries.contains_key(&entry.name) {
                return Err(CoreError::invalid_provider(format!(
                    "provider '{}' is declared more than once",
                    entry.name
                )));
            }
            registry.entries.insert(entry.name.clone(), entry);
        }
        Ok(registry)
    }

    pub fn from_toml_str(document: &str) -> Result<Self, CoreError> {
        let document: RegistryDocument = toml::from_str(document)?;
        Self::from_entries(document.providers)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let registry = Self::from_toml_str(&fs::read_to_string(path)?)?;
        info!(path = %path.display(), providers = registry.len(), "loaded provider registry");
        Ok(registry)
    }

    pub fn to_toml_string(&self) -> Result<String, CoreError> {
        let document = RegistryDocument {
            providers: self.entries.values().cloned().collect(),
        };
        Ok(toml::to_string_pretty(&document)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        debug!(path = %path.display(), "saved provider registry");
        Ok(())
    }

    /// Insert or replace an entry.
    pub fn upsert(&mut self, entry: ProviderEntry) -> Result<(), CoreError> {
        entry.validate()?;
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<ProviderEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.entries.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.entries.values().filter(|entry| entry.enabled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Implementations the factory knows how to build.
    pub fn available_kinds() -> &'static [ProviderKind] {
        &ProviderKind::ALL
    }

    /// Build a provider, reading its API key from the environment.
    pub fn instantiate(entry: &ProviderEntry) -> Result<Arc<dyn ProviderCapability>, CoreError> {
        Self::instantiate_with(entry, |var| std::env::var(var).ok())
    }

    /// Build a provider with an explicit key lookup.
    pub fn instantiate_with(
        entry: &ProviderEntry,
        lookup_key: impl Fn(&str) -> Option<String>,
    ) -> Result<Arc<dyn ProviderCapability>, CoreError> {
        entry.validate()?;
        match entry.kind {
            ProviderKind::Scripted => Ok(Arc::new(ScriptedProvider::new())),
            ProviderKind::Http => {
                let endpoint = entry.endpoint.clone().unwrap_or_default();
                let mut provider = HttpLlmProvider::new(entry.name.clone(), endpoint);
                if let Some(key) = lookup_key(&entry.api_key_var()).filter(|key| !key.is_empty()) {
                    provider = provider.with_api_key(key);
                }
                if let Some(model) = &entry.model {
                    provider = provider.with_model(model.clone());
                }
                if let Some(url) = &entry.health_url {
                    provider = provider.with_health_url(url.clone());
                }
                if let Some(timeout_ms) = entry.timeout_ms {
                    provider = provider.with_timeout_ms(timeout_ms);
                }
                Ok(Arc::new(provider))
            }
        }
    }
}
