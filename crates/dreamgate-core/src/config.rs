//! Layered configuration: defaults, then a TOML file, then `DREAMGATE_`
//! environment variables.
//!
//! Nested keys use a double underscore in the environment, so
//! `DREAMGATE_RETRY__BASE_DELAY_MS=250` overrides `retry.base_delay_ms`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::CoreError;
use crate::pipeline::PipelineConfig;
use crate::preference::PreferenceConfig;
use crate::retry::RetryConfig;

pub const ENV_PREFIX: &str = "DREAMGATE_";
pub const DEFAULT_CONFIG_FILENAME: &str = "dreamgate.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `DREAMGATE_LOG` is unset.
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Failure history entries kept per provider.
    pub failure_history_size: usize,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_history_size: 100,
            probe_timeout_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Every tunable of the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
    pub preference: PreferenceConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.retry.validate()?;
        if self.circuit_breaker.threshold == 0 {
            return Err(CoreError::configuration(
                "circuit_breaker.threshold must be > 0",
            ));
        }
        if self.circuit_breaker.timeout_ms == 0 {
            return Err(CoreError::configuration(
                "circuit_breaker.timeout_ms must be > 0",
            ));
        }
        if self.health.failure_history_size == 0 {
            return Err(CoreError::configuration(
                "health.failure_history_size must be > 0",
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(CoreError::configuration(
                "health.probe_timeout_ms must be > 0",
            ));
        }
        self.pipeline.validate()?;
        self.cache.validate()?;
        self.preference.validate()?;
        Ok(())
    }
}

/// Builds a [`CoreConfig`] from layered sources.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: ENV_PREFIX.to_owned(),
        }
    }

    pub fn with_config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Merge sources in order (later wins): defaults, the TOML file if it
    /// exists, prefixed environment variables. The result is validated.
    pub fn load(&self) -> Result<CoreConfig, CoreError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CoreConfig::default()));

        let path = self
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
        if path.exists() {
            figment = figment.merge(Toml::file(&path));
            info!(path = %path.display(), "configuration file loaded");
        } else if self.config_path.is_some() {
            warn!(path = %path.display(), "configuration file not found; using defaults");
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix).split("__"));

        let config: CoreConfig = figment
            .extract()
            .map_err(|error| CoreError::configuration(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, config: &CoreConfig, path: impl AsRef<Path>) -> Result<(), CoreError> {
        std::fs::write(path.as_ref(), toml::to_string_pretty(config)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("dreamgate.toml");
        std::fs::write(
            &path,
            "[retry]\nbase_delay_ms = 250\nmax_provider_switches = 1\n\n[cache]\nmax_cache_size = 10\n",
        )
        .expect("config written");

        let config = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_prefix("DREAMGATE_TEST_FILE_")
            .load()
            .expect("config loads");

        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_provider_switches, 1);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.cache.max_cache_size, 10);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("dreamgate.toml");
        std::fs::write(&path, "[cache]\nmax_cache_size = 0\n").expect("config written");

        let result = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_prefix("DREAMGATE_TEST_INVALID_")
            .load();

        assert!(matches!(result, Err(CoreError::Configuration(_))));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("saved.toml");
        let loader = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_prefix("DREAMGATE_TEST_SAVED_");
        let mut config = CoreConfig::default();
        config.pipeline.max_content_length = 2_048;
        config
            .retry
            .provider_timeout_multipliers
            .insert(String::from("slow"), 2.0);

        loader.save_to_file(&config, &path).expect("config saves");

        assert_eq!(loader.load().expect("config loads"), config);
    }
}
