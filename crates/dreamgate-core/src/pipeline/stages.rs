//! Stage processors and their fallback strategies.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::repair::{
    dream_problems, extract_first_json_block, parse_lenient, parse_repaired, repair_dream,
    strip_code_fences, REPAIR_MARKER,
};
use super::{OperationType, PipelineConfig, Stage};

/// Value flowing between stages.
#[derive(Debug, Clone, PartialEq)]
pub struct StageData {
    /// Provider payload as received.
    pub raw: Value,
    /// Current textual content.
    pub content: String,
    /// Parsed form of `content` once validation succeeded.
    pub parsed: Option<Value>,
}

impl StageData {
    pub fn new(raw: Value) -> Self {
        Self {
            raw,
            content: String::new(),
            parsed: None,
        }
    }

    fn with_content(&self, content: String) -> Self {
        Self {
            raw: self.raw.clone(),
            content,
            parsed: self.parsed.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub data: StageData,
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn clean(data: StageData) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn warn(data: StageData, warning: impl Into<String>) -> Self {
        Self {
            data,
            warnings: vec![warning.into()],
        }
    }
}

/// Read-only inputs shared by every stage of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub operation: OperationType,
    pub provider: &'a str,
    pub config: &'a PipelineConfig,
}

pub type StageResult = Result<StageOutput, String>;

/// Primary transform for one stage.
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;
    fn process(&self, input: &StageData, context: &StageContext<'_>) -> StageResult;
}

/// Recovery attempted when a stage fails, in registration order.
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn stage(&self) -> Stage;
    fn recover(&self, input: &StageData, context: &StageContext<'_>) -> StageResult;
}

// ============================================================================
// Normalization
// ============================================================================

/// Collapse a provider payload into one string.
#[derive(Debug, Default)]
pub struct Normalizer;

impl StageProcessor for Normalizer {
    fn stage(&self) -> Stage {
        Stage::Normalization
    }

    fn process(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        match &input.raw {
            Value::String(text) if !text.trim().is_empty() => {
                Ok(StageOutput::clean(input.with_content(text.clone())))
            }
            Value::Object(_) | Value::Array(_) => {
                if let Some(text) = envelope_text(&input.raw) {
                    return Ok(StageOutput::clean(input.with_content(text)));
                }
                if !contains_text(&input.raw, context.config.max_depth) {
                    return Err(String::from("response contains no extractable text"));
                }
                serde_json::to_string(&input.raw)
                    .map(|text| StageOutput::clean(input.with_content(text)))
                    .map_err(|error| format!("failed to serialize response: {error}"))
            }
            Value::String(_) => Err(String::from("response is empty")),
            other => Err(format!("response of type {} has no text", json_type(other))),
        }
    }
}

/// Serialize non-empty scalars and containers the primary rejected.
#[derive(Debug, Default)]
pub struct StringifyFallback;

impl FallbackStrategy for StringifyFallback {
    fn name(&self) -> &'static str {
        "stringify"
    }

    fn stage(&self) -> Stage {
        Stage::Normalization
    }

    fn recover(&self, input: &StageData, _context: &StageContext<'_>) -> StageResult {
        let text = match &input.raw {
            Value::Null => return Err(String::from("response is null")),
            Value::String(text) if text.trim().is_empty() => {
                return Err(String::from("response is empty"))
            }
            Value::Object(map) if map.is_empty() => return Err(String::from("response is empty")),
            Value::Array(items) if items.is_empty() => {
                return Err(String::from("response is empty"))
            }
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Ok(StageOutput::warn(
            input.with_content(text),
            "normalized non-text response by stringifying it",
        ))
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Unwrap provider envelopes and code fences around the primary content.
#[derive(Debug, Default)]
pub struct Extractor;

impl StageProcessor for Extractor {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    fn process(&self, input: &StageData, _context: &StageContext<'_>) -> StageResult {
        let mut content = input.content.clone();

        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(content.trim()) {
            if is_envelope(&value) {
                content = envelope_text(&value)
                    .ok_or_else(|| String::from("provider envelope carries no content"))?;
            }
        }

        let stripped = strip_code_fences(&content);
        if stripped.len() != content.len() {
            content = stripped.to_owned();
        }

        if content.trim().is_empty() {
            return Err(String::from("extracted content is empty"));
        }
        Ok(StageOutput::clean(input.with_content(content)))
    }
}

/// Longest text field anywhere in the payload.
#[derive(Debug, Default)]
pub struct DeepSearchFallback;

impl FallbackStrategy for DeepSearchFallback {
    fn name(&self) -> &'static str {
        "deep_search"
    }

    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    fn recover(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        let source = serde_json::from_str::<Value>(input.content.trim())
            .ok()
            .filter(|value| value.is_object() || value.is_array())
            .unwrap_or_else(|| input.raw.clone());

        let text = longest_text(&source, context.config.max_depth)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| String::from("no plausible text field found"))?;

        Ok(StageOutput::warn(
            input.with_content(text.to_owned()),
            "partial-content",
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Parse JSON operations; dream operations must also be structurally valid.
#[derive(Debug, Default)]
pub struct Validator;

impl StageProcessor for Validator {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn process(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        if context.operation == OperationType::Text {
            let mut data = input.clone();
            data.parsed = None;
            return Ok(StageOutput::clean(data));
        }

        let parsed = serde_json::from_str::<Value>(&input.content)
            .map_err(|error| format!("invalid JSON: {error}"))?;
        check_structure(context.operation, &parsed)?;

        let mut data = input.clone();
        data.parsed = Some(parsed);
        Ok(StageOutput::clean(data))
    }
}

/// Parse the first `{...}` block embedded in surrounding prose.
#[derive(Debug, Default)]
pub struct JsonBlockFallback;

impl FallbackStrategy for JsonBlockFallback {
    fn name(&self) -> &'static str {
        "json_block_extraction"
    }

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn recover(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        let block = extract_first_json_block(&input.content)
            .ok_or_else(|| String::from("no JSON block found"))?;
        let parsed = serde_json::from_str::<Value>(block)
            .ok()
            .or_else(|| parse_repaired(block))
            .ok_or_else(|| String::from("embedded JSON block does not parse"))?;
        check_structure(context.operation, &parsed)?;

        structured_output(input, parsed, "extracted JSON block from surrounding text")
    }
}

/// Strip trailing commas and close unbalanced brackets, then re-parse.
#[derive(Debug, Default)]
pub struct JsonRepairFallback;

impl FallbackStrategy for JsonRepairFallback {
    fn name(&self) -> &'static str {
        "json_repair"
    }

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn recover(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        let start = input
            .content
            .find(['{', '['])
            .ok_or_else(|| String::from("content has no JSON structure to repair"))?;
        let parsed = parse_repaired(&input.content[start..])
            .ok_or_else(|| String::from("content is still invalid after repair"))?;
        check_structure(context.operation, &parsed)?;

        structured_output(input, parsed, "repaired malformed JSON")
    }
}

/// Fill missing dream fields. Dream operations only.
#[derive(Debug, Default)]
pub struct DreamRepairFallback;

impl FallbackStrategy for DreamRepairFallback {
    fn name(&self) -> &'static str {
        "dream_structure_repair"
    }

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn recover(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        if context.operation != OperationType::Dream {
            return Err(String::from("not a dream operation"));
        }
        let parsed = parse_lenient(&input.content)
            .ok_or_else(|| String::from("content does not contain a JSON object"))?;
        let repaired =
            repair_dream(&parsed).ok_or_else(|| String::from("dream must be a JSON object"))?;

        structured_output(input, repaired, REPAIR_MARKER)
    }
}

/// Accept the content unvalidated and flag it.
#[derive(Debug, Default)]
pub struct PassThroughFallback;

impl FallbackStrategy for PassThroughFallback {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn recover(&self, input: &StageData, _context: &StageContext<'_>) -> StageResult {
        let mut data = input.clone();
        data.parsed = None;
        Ok(StageOutput::warn(
            data,
            "validation failed; content passed through unvalidated",
        ))
    }
}

// ============================================================================
// Sanitization
// ============================================================================

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\s*(script|iframe|object|embed)\b[^>]*>.*?<\s*/\s*(script|iframe|object|embed)\s*>")
        .expect("static pattern is valid")
});

static SCRIPT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*/?\s*(script|iframe|object|embed)\b[^>]*>").expect("static pattern is valid")
});

static JS_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").expect("static pattern is valid"));

static EVENT_HANDLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("static pattern is valid")
});

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static pattern is valid"));

/// Strip script-injection markup, collapse blank runs, truncate.
#[derive(Debug, Default)]
pub struct Sanitizer;

impl StageProcessor for Sanitizer {
    fn stage(&self) -> Stage {
        Stage::Sanitization
    }

    fn process(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        let max = context.config.max_content_length;

        if let Some(parsed) = &input.parsed {
            // Sanitize leaves so the content stays valid JSON.
            let cleaned = map_strings(parsed, &|text| clean_text(text, max));
            let mut warnings = Vec::new();
            let mut data = if cleaned == *parsed {
                input.clone()
            } else {
                let content = serde_json::to_string(&cleaned)
                    .map_err(|error| format!("failed to serialize sanitized content: {error}"))?;
                warnings.push(String::from("sanitized markup inside structured content"));
                let mut data = input.with_content(content);
                data.parsed = Some(cleaned);
                data
            };
            // A cut document no longer parses, so the structured form goes.
            if data.content.chars().count() > max {
                data.content = truncate_chars(&data.content, max);
                data.parsed = None;
                warnings.push(format!(
                    "content truncated to {max} characters; structured form dropped"
                ));
            }
            return Ok(StageOutput { data, warnings });
        }

        let cleaned = clean_text(&input.content, max);
        if cleaned.trim().is_empty() {
            return Err(String::from("content is empty after sanitization"));
        }
        let mut warnings = Vec::new();
        if input.content.chars().count() > max {
            warnings.push(format!("content truncated to {max} characters"));
        }
        Ok(StageOutput {
            data: input.with_content(cleaned),
            warnings,
        })
    }
}

/// Escape markup instead of removing it, for content that is nothing but
/// markup.
#[derive(Debug, Default)]
pub struct EscapeMarkupFallback;

impl FallbackStrategy for EscapeMarkupFallback {
    fn name(&self) -> &'static str {
        "escape_markup"
    }

    fn stage(&self) -> Stage {
        Stage::Sanitization
    }

    fn recover(&self, input: &StageData, context: &StageContext<'_>) -> StageResult {
        let escaped = input
            .content
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        let escaped = JS_URL.replace_all(&escaped, "");
        let collapsed = EXCESS_NEWLINES.replace_all(&escaped, "\n\n");
        let content = truncate_chars(&collapsed, context.config.max_content_length);
        if content.trim().is_empty() {
            return Err(String::from("content is empty"));
        }
        Ok(StageOutput::warn(
            input.with_content(content),
            "escaped markup that could not be stripped",
        ))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Text inside well-known provider envelopes.
pub fn envelope_text(value: &Value) -> Option<String> {
    let object = value.as_object()?;

    if let Some(choice) = object
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        let candidates = [
            choice.pointer("/message/content"),
            choice.pointer("/delta/content"),
            choice.get("text"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(text) = non_empty_text(candidate) {
                return Some(text);
            }
        }
        if let Some(text) = choice.as_str().filter(|text| !text.trim().is_empty()) {
            return Some(text.to_owned());
        }
    }

    ["text", "output", "content"]
        .into_iter()
        .filter_map(|key| object.get(key))
        .find_map(non_empty_text)
}

fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).ok(),
        _ => None,
    }
}

/// An object that wraps content rather than being content.
fn is_envelope(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    if object.get("choices").is_some_and(Value::is_array) {
        return true;
    }
    let has_payload_key = ["text", "output", "content"]
        .iter()
        .any(|key| object.get(*key).is_some_and(Value::is_string));
    let looks_like_document = ["id", "title", "style", "structures"]
        .iter()
        .any(|key| object.contains_key(*key));
    has_payload_key && !looks_like_document
}

fn contains_text(value: &Value, depth: usize) -> bool {
    match value {
        Value::String(text) => !text.trim().is_empty(),
        _ if depth == 0 => false,
        Value::Object(map) => map.values().any(|nested| contains_text(nested, depth - 1)),
        Value::Array(items) => items.iter().any(|nested| contains_text(nested, depth - 1)),
        _ => false,
    }
}

fn longest_text(value: &Value, depth: usize) -> Option<&str> {
    match value {
        Value::String(text) => Some(text.as_str()),
        _ if depth == 0 => None,
        Value::Object(map) => map
            .values()
            .filter_map(|nested| longest_text(nested, depth - 1))
            .max_by_key(|text| text.len()),
        Value::Array(items) => items
            .iter()
            .filter_map(|nested| longest_text(nested, depth - 1))
            .max_by_key(|text| text.len()),
        _ => None,
    }
}

fn check_structure(operation: OperationType, parsed: &Value) -> Result<(), String> {
    match operation {
        OperationType::Dream => {
            let problems = dream_problems(parsed);
            if problems.is_empty() {
                Ok(())
            } else {
                Err(format!("invalid dream: {}", problems.join(", ")))
            }
        }
        OperationType::Json if parsed.is_object() || parsed.is_array() => Ok(()),
        OperationType::Json => Err(String::from("expected a JSON object or array")),
        OperationType::Text => Ok(()),
    }
}

fn structured_output(input: &StageData, parsed: Value, warning: &str) -> StageResult {
    let content = serde_json::to_string(&parsed)
        .map_err(|error| format!("failed to serialize repaired content: {error}"))?;
    let mut data = input.with_content(content);
    data.parsed = Some(parsed);
    Ok(StageOutput::warn(data, warning))
}

fn clean_text(text: &str, max: usize) -> String {
    let text = SCRIPT_BLOCK.replace_all(text, "");
    let text = SCRIPT_TAG.replace_all(&text, "");
    let text = JS_URL.replace_all(&text, "");
    let text = EVENT_HANDLER.replace_all(&text, "");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    truncate_chars(&text, max)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_owned(),
        None => text.to_owned(),
    }
}

fn map_strings(value: &Value, transform: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(text) => Value::String(transform(text)),
        Value::Array(items) => Value::Array(items.iter().map(|item| map_strings(item, transform)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, nested)| (key.clone(), map_strings(nested, transform)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(operation: OperationType, config: &PipelineConfig) -> StageContext<'_> {
        StageContext {
            operation,
            provider: "test",
            config,
        }
    }

    #[test]
    fn normalizer_reads_chat_and_stream_envelopes() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Text, &config);

        let chat = StageData::new(json!({ "choices": [{ "message": { "content": "hi" } }] }));
        let delta = StageData::new(json!({ "choices": [{ "delta": { "content": "yo" } }] }));
        let output = StageData::new(json!({ "output": "out" }));

        assert_eq!(Normalizer.process(&chat, &ctx).map(|o| o.data.content), Ok(String::from("hi")));
        assert_eq!(Normalizer.process(&delta, &ctx).map(|o| o.data.content), Ok(String::from("yo")));
        assert_eq!(Normalizer.process(&output, &ctx).map(|o| o.data.content), Ok(String::from("out")));
    }

    #[test]
    fn normalizer_rejects_payloads_without_text() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Text, &config);

        assert!(Normalizer.process(&StageData::new(json!({ "a": [1, 2] })), &ctx).is_err());
        assert!(Normalizer.process(&StageData::new(Value::Null), &ctx).is_err());
    }

    #[test]
    fn normalizer_respects_max_depth() {
        let config = PipelineConfig {
            max_depth: 2,
            ..PipelineConfig::default()
        };
        let ctx = context(OperationType::Text, &config);
        let deep = StageData::new(json!({ "a": { "b": { "c": "buried" } } }));

        assert!(Normalizer.process(&deep, &ctx).is_err());
    }

    #[test]
    fn extractor_unwraps_serialized_envelopes_and_fences() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Json, &config);
        let mut data = StageData::new(Value::Null);
        data.content = String::from(r#"{"text":"```json\n{\"a\":1}\n```"}"#);

        let output = Extractor.process(&data, &ctx).expect("extraction succeeds");

        assert_eq!(output.data.content, r#"{"a":1}"#);
    }

    #[test]
    fn extractor_leaves_documents_with_content_keys_alone() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Json, &config);
        let mut data = StageData::new(Value::Null);
        data.content = String::from(r#"{"id":"d","content":"body"}"#);

        let output = Extractor.process(&data, &ctx).expect("extraction succeeds");

        assert_eq!(output.data.content, data.content);
    }

    #[test]
    fn deep_search_picks_longest_text_with_warning() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Text, &config);
        let data = StageData::new(json!({ "meta": "short", "nested": { "body": "the longest field" } }));

        let output = DeepSearchFallback.recover(&data, &ctx).expect("text found");

        assert_eq!(output.data.content, "the longest field");
        assert_eq!(output.warnings, vec![String::from("partial-content")]);
    }

    #[test]
    fn sanitizer_strips_script_markup_and_blank_runs() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Text, &config);
        let mut data = StageData::new(Value::Null);
        data.content = String::from(
            "hello<script>alert(1)</script>\n\n\n\n<a href=\"javascript:evil()\" onclick=\"x()\">link</a>",
        );

        let output = Sanitizer.process(&data, &ctx).expect("sanitized");

        assert_eq!(output.data.content, "hello\n\n<a href=\"evil()\">link</a>");
    }

    #[test]
    fn sanitizer_truncates_to_max_length() {
        let config = PipelineConfig {
            max_content_length: 5,
            ..PipelineConfig::default()
        };
        let ctx = context(OperationType::Text, &config);
        let mut data = StageData::new(Value::Null);
        data.content = String::from("abcdefgh");

        let output = Sanitizer.process(&data, &ctx).expect("sanitized");

        assert_eq!(output.data.content, "abcde");
        assert_eq!(output.warnings.len(), 1);
    }

    #[test]
    fn oversized_structured_content_is_truncated_and_unparsed() {
        let config = PipelineConfig {
            max_content_length: 20,
            ..PipelineConfig::default()
        };
        let ctx = context(OperationType::Json, &config);
        let parsed = json!({ "title": "a very long title that keeps going", "n": 1 });
        let mut data = StageData::new(parsed.clone());
        data.content = serde_json::to_string(&parsed).expect("serializes");
        data.parsed = Some(parsed);

        let output = Sanitizer.process(&data, &ctx).expect("sanitized");

        assert_eq!(output.data.content.chars().count(), 20);
        assert!(output.data.parsed.is_none());
        assert_eq!(
            output.warnings,
            vec![String::from("content truncated to 20 characters; structured form dropped")]
        );
    }

    #[test]
    fn structured_content_within_limit_is_untouched() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Json, &config);
        let parsed = json!({ "title": "Moon" });
        let mut data = StageData::new(parsed.clone());
        data.content = String::from(r#"{"title":"Moon"}"#);
        data.parsed = Some(parsed);

        let output = Sanitizer.process(&data, &ctx).expect("sanitized");

        assert_eq!(output.data, data);
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn markup_only_content_is_escaped_by_fallback() {
        let config = PipelineConfig::default();
        let ctx = context(OperationType::Text, &config);
        let mut data = StageData::new(Value::Null);
        data.content = String::from("<script>steal()</script>");

        assert!(Sanitizer.process(&data, &ctx).is_err());
        let output = EscapeMarkupFallback.recover(&data, &ctx).expect("escaped");
        assert_eq!(output.data.content, "&lt;script&gt;steal()&lt;/script&gt;");
    }
}
