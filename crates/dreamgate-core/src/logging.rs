//! `tracing` subscriber setup.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub use crate::config::LoggingConfig;
use crate::error::CoreError;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "DREAMGATE_LOG";

/// Install the global subscriber. `DREAMGATE_LOG` wins over
/// `config.level`. Logs go to stderr so command output stays clean.
pub fn init_logging(config: &LoggingConfig) -> Result<(), CoreError> {
    let filter = match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|error| {
            CoreError::configuration(format!("invalid log filter '{}': {error}", config.level))
        })?,
    };

    let registry = Registry::default().with(filter);
    let installed = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()
    };
    installed.map_err(|error| {
        CoreError::configuration(format!("failed to install log subscriber: {error}"))
    })?;

    info!(json = config.json_format, "logging initialized");
    Ok(())
}
