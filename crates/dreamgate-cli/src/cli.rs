//! CLI argument definitions for dreamgate.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `providers` | List configured providers and their health |
//! | `classify` | Classify an upstream error |
//! | `process` | Run the response pipeline over a payload |
//! | `generate` | Generate a dream with provider failover |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--format` | `json` | Output format (json, table) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--strict` | `false` | Treat warnings as errors |
//! | `--config` | `dreamgate.toml` | Core configuration file |
//! | `--registry` | `providers.toml` | Provider registry file |
//!
//! # Examples
//!
//! ```bash
//! dreamgate providers --check
//! dreamgate classify "connect ECONNREFUSED 10.0.0.1:443" --code ECONNREFUSED
//! echo '{"choices":[{"message":{"content":"{\"title\":\"x\"}"}}]}' | dreamgate process --operation json
//! dreamgate generate "a library floating over the sea" --mock --pretty
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Resilient multi-provider dream generation.
#[derive(Debug, Parser)]
#[command(
    name = "dreamgate",
    author,
    version,
    about = "Resilient multi-provider dream generation",
    long_about = "dreamgate routes generation requests across several AI providers with \
retries, circuit breaking and provider failover, then repairs and sanitizes the responses.\n\
\n\
Use 'dreamgate <command> --help' for command-specific help."
)]
pub struct Cli {
    /// Output format for results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Treat warnings and errors as failures (exit code 5).
    #[arg(long, global = true, default_value_t = false)]
    pub strict: bool,

    /// Core configuration file. `DREAMGATE_*` variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Provider registry file.
    #[arg(long, global = true, default_value = "providers.toml")]
    pub registry: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    Table,
    /// Single JSON object.
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List configured providers.
    ///
    /// # Examples
    ///
    ///   dreamgate providers
    ///   dreamgate providers --check
    Providers(ProvidersArgs),

    /// Classify an upstream error description.
    ///
    /// # Examples
    ///
    ///   dreamgate classify "Too Many Requests" --status 429 --retry-after 30
    Classify(ClassifyArgs),

    /// Run the response pipeline over a payload read from a file or stdin.
    ///
    /// JSON input is processed as a document; anything else as a string.
    Process(ProcessArgs),

    /// Generate a dream with retry and provider failover.
    ///
    /// # Examples
    ///
    ///   dreamgate generate "a clockwork whale" --mock
    ///   dreamgate generate "a clockwork whale" --provider primary --provider backup
    Generate(GenerateArgs),
}

#[derive(Debug, Args)]
pub struct ProvidersArgs {
    /// Probe every provider before reporting.
    #[arg(long, default_value_t = false)]
    pub check: bool,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Error message as reported by the provider.
    pub message: String,

    /// HTTP status code.
    #[arg(long)]
    pub status: Option<u16>,

    /// Error code such as `ECONNREFUSED`.
    #[arg(long)]
    pub code: Option<String>,

    /// `Retry-After` header value in seconds.
    #[arg(long)]
    pub retry_after: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Payload file. Reads stdin when omitted.
    pub file: Option<PathBuf>,

    /// Expected content type.
    #[arg(long, value_enum, default_value_t = OperationArg::Dream)]
    pub operation: OperationArg,

    /// Provider name recorded in the metadata.
    #[arg(long, default_value = "cli")]
    pub provider: String,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Dream description.
    pub prompt: String,

    /// Provider to try, in order. Repeatable. Ranked registry providers when
    /// omitted.
    #[arg(long = "provider")]
    pub providers: Vec<String>,

    /// Quality tier (draft, standard, high, cinematic).
    #[arg(long)]
    pub quality: Option<String>,

    /// Dream style hint.
    #[arg(long)]
    pub style: Option<String>,

    #[arg(long, value_enum, default_value_t = OperationArg::Dream)]
    pub operation: OperationArg,

    /// Use an in-memory provider instead of the registry.
    #[arg(long, default_value_t = false)]
    pub mock: bool,

    /// Overall request deadline in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Skip the response cache.
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationArg {
    Dream,
    Json,
    Text,
}
