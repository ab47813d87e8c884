//! Staged response processing.
//!
//! Every provider payload goes through four stages in order:
//!
//! | Stage | Primary | Fallbacks |
//! |-------|---------|-----------|
//! | normalization | payload to one string | `stringify` |
//! | extraction | unwrap envelopes and fences | `deep_search` |
//! | validation | parse / check structure | `json_block_extraction`, `json_repair`, `dream_structure_repair`, `pass_through` |
//! | sanitization | strip script markup, truncate | `escape_markup` |
//!
//! A fallback chain runs only when the primary fails after its retries. The
//! pipeline itself holds no per-invocation state, so one instance can serve
//! concurrent requests.

pub mod repair;
pub mod stages;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;
use stages::{
    DeepSearchFallback, DreamRepairFallback, EscapeMarkupFallback, Extractor, FallbackStrategy,
    JsonBlockFallback, JsonRepairFallback, Normalizer, PassThroughFallback, Sanitizer,
    StageContext, StageData, StageProcessor, StringifyFallback, Validator,
};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalization,
    Extraction,
    Validation,
    Sanitization,
}

impl Stage {
    pub const ALL: [Self; 4] = [
        Self::Normalization,
        Self::Extraction,
        Self::Validation,
        Self::Sanitization,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normalization => "normalization",
            Self::Extraction => "extraction",
            Self::Validation => "validation",
            Self::Sanitization => "sanitization",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller expects the content to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Dream scene JSON with required fields.
    #[default]
    Dream,
    /// Any JSON object or array.
    Json,
    /// Free text.
    Text,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dream => "dream",
            Self::Json => "json",
            Self::Text => "text",
        }
    }

    pub const fn is_structured(self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dream" => Ok(Self::Dream),
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(CoreError::configuration(format!(
                "unknown operation type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Nesting depth searched for text.
    pub max_depth: usize,
    /// Characters kept after sanitization.
    pub max_content_length: usize,
    /// Bound on one whole invocation.
    pub processing_timeout_ms: u64,
    /// Extra attempts of a failing primary before its fallbacks run.
    pub stage_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_content_length: 100_000,
            processing_timeout_ms: 5_000,
            stage_retries: 1,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_depth == 0 {
            return Err(CoreError::configuration("pipeline.max_depth must be > 0"));
        }
        if self.max_content_length == 0 {
            return Err(CoreError::configuration(
                "pipeline.max_content_length must be > 0",
            ));
        }
        if self.processing_timeout_ms == 0 {
            return Err(CoreError::configuration(
                "pipeline.processing_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

/// Trace of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub processing_id: String,
    pub provider: String,
    pub operation: OperationType,
    pub stages_completed: Vec<Stage>,
    pub fallback_attempted: bool,
    /// `stage:strategy` for every fallback that produced the stage output.
    pub fallbacks_used: Vec<String>,
    pub failed_stage: Option<Stage>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl PipelineMetadata {
    fn new(provider: &str, operation: OperationType) -> Self {
        Self {
            processing_id: Uuid::new_v4().to_string(),
            provider: provider.to_owned(),
            operation,
            stages_completed: Vec::new(),
            fallback_attempted: false,
            fallbacks_used: Vec::new(),
            failed_stage: None,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Content was accepted with caveats.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub content: Option<String>,
    /// Parsed content for structured operations that validated.
    pub parsed: Option<Value>,
    pub error: Option<String>,
    pub metadata: PipelineMetadata,
}

/// Content of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedResponse {
    pub content: String,
    pub parsed: Option<Value>,
    pub metadata: PipelineMetadata,
}

impl PipelineResult {
    pub fn into_result(self) -> Result<ProcessedResponse, CoreError> {
        match (self.success, self.content) {
            (true, Some(content)) => Ok(ProcessedResponse {
                content,
                parsed: self.parsed,
                metadata: self.metadata,
            }),
            _ => Err(CoreError::Pipeline {
                stage: self.metadata.failed_stage.unwrap_or(Stage::Normalization),
                message: self
                    .error
                    .unwrap_or_else(|| String::from("response processing failed")),
                metadata: Box::new(self.metadata),
            }),
        }
    }
}

/// Normalize, extract, validate, and sanitize provider responses.
pub struct ResponseProcessingPipeline {
    config: PipelineConfig,
    processors: Vec<Box<dyn StageProcessor>>,
    fallbacks: BTreeMap<Stage, Vec<Box<dyn FallbackStrategy>>>,
}

impl Default for ResponseProcessingPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl std::fmt::Debug for ResponseProcessingPipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let fallbacks = self
            .fallbacks
            .iter()
            .map(|(stage, chain)| {
                (
                    stage.as_str(),
                    chain.iter().map(|fallback| fallback.name()).collect::<Vec<_>>(),
                )
            })
            .collect::<BTreeMap<_, _>>();
        f.debug_struct("ResponseProcessingPipeline")
            .field("config", &self.config)
            .field("fallbacks", &fallbacks)
            .finish()
    }
}

impl ResponseProcessingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let mut pipeline = Self {
            config,
            processors: vec![
                Box::new(Normalizer),
                Box::new(Extractor),
                Box::new(Validator),
                Box::new(Sanitizer),
            ],
            fallbacks: BTreeMap::new(),
        };
        pipeline.register_fallback(Box::new(StringifyFallback));
        pipeline.register_fallback(Box::new(DeepSearchFallback));
        pipeline.register_fallback(Box::new(JsonBlockFallback));
        pipeline.register_fallback(Box::new(JsonRepairFallback));
        pipeline.register_fallback(Box::new(DreamRepairFallback));
        pipeline.register_fallback(Box::new(PassThroughFallback));
        pipeline.register_fallback(Box::new(EscapeMarkupFallback));
        pipeline
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Append a fallback to its stage chain. `pass_through` always stays last.
    pub fn register_fallback(&mut self, fallback: Box<dyn FallbackStrategy>) {
        let chain = self.fallbacks.entry(fallback.stage()).or_default();
        let position = chain
            .iter()
            .position(|existing| existing.name() == PassThroughFallback.name())
            .unwrap_or(chain.len());
        chain.insert(position, fallback);
    }

    /// Fallback names registered for `stage`, in the order they run.
    pub fn fallback_names(&self, stage: Stage) -> Vec<&'static str> {
        self.fallbacks
            .get(&stage)
            .map(|chain| chain.iter().map(|fallback| fallback.name()).collect())
            .unwrap_or_default()
    }

    pub fn process_response(
        &self,
        raw: &Value,
        provider: &str,
        operation: OperationType,
    ) -> PipelineResult {
        let started = Instant::now();
        let deadline = started + self.config.processing_timeout();
        let context = StageContext {
            operation,
            provider,
            config: &self.config,
        };
        let mut metadata = PipelineMetadata::new(provider, operation);
        let mut data = StageData::new(raw.clone());

        for processor in &self.processors {
            let stage = processor.stage();
            let primary_error = match self.run_primary(processor.as_ref(), &data, &context, deadline) {
                Ok(output) => {
                    metadata.warnings.extend(output.warnings);
                    data = output.data;
                    metadata.stages_completed.push(stage);
                    debug!(
                        processing_id = %metadata.processing_id,
                        provider,
                        stage = stage.as_str(),
                        "pipeline stage completed"
                    );
                    continue;
                }
                Err(error) => error,
            };

            metadata.fallback_attempted = true;
            match self.run_fallbacks(stage, &data, &context, deadline) {
                Ok((name, output)) => {
                    warn!(
                        processing_id = %metadata.processing_id,
                        provider,
                        stage = stage.as_str(),
                        fallback = name,
                        error = %primary_error,
                        "pipeline stage recovered by fallback"
                    );
                    metadata.warnings.extend(output.warnings);
                    metadata.fallbacks_used.push(format!("{stage}:{name}"));
                    data = output.data;
                    metadata.stages_completed.push(stage);
                }
                Err(fallback_error) => {
                    metadata.failed_stage = Some(stage);
                    metadata.duration_ms = elapsed_ms(started);
                    let message = match fallback_error {
                        Some(fallback_error) => format!("{primary_error}; {fallback_error}"),
                        None => primary_error,
                    };
                    warn!(
                        processing_id = %metadata.processing_id,
                        provider,
                        stage = stage.as_str(),
                        error = %message,
                        "pipeline stage failed"
                    );
                    return PipelineResult {
                        success: false,
                        content: None,
                        parsed: None,
                        error: Some(message),
                        metadata,
                    };
                }
            }
        }

        metadata.duration_ms = elapsed_ms(started);
        PipelineResult {
            success: true,
            content: Some(data.content),
            parsed: data.parsed,
            error: None,
            metadata,
        }
    }

    fn run_primary(
        &self,
        processor: &dyn StageProcessor,
        data: &StageData,
        context: &StageContext<'_>,
        deadline: Instant,
    ) -> stages::StageResult {
        let mut last_error = String::new();
        for _ in 0..=self.config.stage_retries {
            let outcome = processor.process(data, context);
            if Instant::now() >= deadline {
                return Err(String::from("stage exceeded the processing timeout"));
            }
            match outcome {
                Ok(output) => return Ok(output),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    /// First fallback that succeeds, or the last fallback error. `Err(None)`
    /// when the stage has no fallbacks.
    fn run_fallbacks(
        &self,
        stage: Stage,
        data: &StageData,
        context: &StageContext<'_>,
        deadline: Instant,
    ) -> Result<(&'static str, stages::StageOutput), Option<String>> {
        let mut last_error = None;
        for fallback in self.fallbacks.get(&stage).into_iter().flatten() {
            if Instant::now() >= deadline {
                return Err(Some(String::from("processing timeout exceeded during fallback")));
            }
            match fallback.recover(data, context) {
                Ok(_) if Instant::now() >= deadline => {
                    return Err(Some(format!(
                        "fallback '{}' exceeded the processing timeout",
                        fallback.name()
                    )));
                }
                Ok(output) => return Ok((fallback.name(), output)),
                Err(error) => {
                    debug!(
                        stage = stage.as_str(),
                        fallback = fallback.name(),
                        error = %error,
                        "pipeline fallback declined"
                    );
                    last_error = Some(format!("{}: {error}", fallback.name()));
                }
            }
        }
        Err(last_error)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
