mod classify;
mod generate;
mod process;
mod providers;

use std::path::Path;

use dreamgate_core::{CoreConfig, OperationType, ProviderRegistry};
use serde_json::Value;
use tracing::debug;

use crate::cli::{Cli, Command, OperationArg};
use crate::error::CliError;
use crate::output::{Envelope, EnvelopeError, EnvelopeMeta, SCHEMA_VERSION};

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<EnvelopeError>,
    pub request_id: Option<String>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub source_chain: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
            errors: Vec::new(),
            request_id: None,
            latency_ms: 0,
            cache_hit: false,
            source_chain: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_error(mut self, error: EnvelopeError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub fn with_source_chain(mut self, source_chain: Vec<String>) -> Self {
        self.source_chain = source_chain;
        self
    }
}

pub async fn run(cli: &Cli, config: CoreConfig) -> Result<Envelope, CliError> {
    let (command, result) = match &cli.command {
        Command::Providers(args) => (
            "providers",
            providers::run(args, config, &load_registry(&cli.registry)?).await?,
        ),
        Command::Classify(args) => ("classify", classify::run(args)?),
        Command::Process(args) => ("process", process::run(args, &config)?),
        Command::Generate(args) => {
            let registry = if args.mock {
                ProviderRegistry::new()
            } else {
                load_registry(&cli.registry)?
            };
            ("generate", generate::run(args, config, &registry).await?)
        }
    };

    let CommandResult {
        data,
        warnings,
        errors,
        request_id,
        latency_ms,
        cache_hit,
        source_chain,
    } = result;

    Ok(Envelope {
        meta: EnvelopeMeta {
            command,
            schema_version: SCHEMA_VERSION,
            request_id,
            source_chain,
            latency_ms,
            cache_hit,
            warnings,
        },
        data,
        errors,
    })
}

/// A missing registry file is an empty registry.
fn load_registry(path: &Path) -> Result<ProviderRegistry, CliError> {
    if !path.exists() {
        debug!(path = %path.display(), "no provider registry file");
        return Ok(ProviderRegistry::new());
    }
    Ok(ProviderRegistry::load(path)?)
}

const fn to_operation(operation: OperationArg) -> OperationType {
    match operation {
        OperationArg::Dream => OperationType::Dream,
        OperationArg::Json => OperationType::Json,
        OperationArg::Text => OperationType::Text,
    }
}
