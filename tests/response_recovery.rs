//! Behavior-driven tests for response recovery
//!
//! These tests verify HOW malformed provider output is turned into usable
//! content: which stage recovered it, what warnings the caller sees, and
//! what happens when nothing can be salvaged.

use std::sync::Arc;

use dreamgate_core::pipeline::repair::REPAIR_MARKER;
use dreamgate_core::{
    CacheMode, CoreConfig, CoreError, FallbackOptions, GenerationOptions, OperationType,
    PipelineConfig, ProviderManager, ProviderSettings, ResponseProcessingPipeline, RetryConfig,
    ScriptedProvider, Stage,
};
use serde_json::{json, Value};

fn manager() -> ProviderManager {
    ProviderManager::new(CoreConfig {
        retry: RetryConfig::fast(),
        ..CoreConfig::default()
    })
    .expect("manager builds")
}

// =============================================================================
// Recovery: Structured Content
// =============================================================================

#[test]
fn when_dream_arrives_in_a_code_fence_inside_a_chat_envelope_it_is_unwrapped() {
    // Given: A chat completion whose content is a fenced dream
    let pipeline = ResponseProcessingPipeline::default();
    let raw = json!({
        "choices": [{
            "message": {
                "content": "```json\n{\"id\":\"d1\",\"title\":\"Moon\",\"style\":\"surreal\"}\n```"
            }
        }]
    });

    // When: The response is processed as a dream
    let result = pipeline.process_response(&raw, "alpha", OperationType::Dream);

    // Then: The bare dream comes out without any fallback
    assert!(result.success);
    assert_eq!(
        result.content.as_deref(),
        Some(r#"{"id":"d1","title":"Moon","style":"surreal"}"#)
    );
    assert_eq!(result.parsed.expect("dream is parsed")["title"], "Moon");
    assert!(!result.metadata.fallback_attempted);
    assert!(!result.metadata.has_warnings());
}

#[test]
fn when_json_is_cut_off_mid_array_open_brackets_are_closed() {
    // Given: A JSON response truncated before its closing brackets
    let pipeline = ResponseProcessingPipeline::default();

    // When: The response is processed as JSON
    let result = pipeline.process_response(&json!("{\"a\": [1, 2"), "alpha", OperationType::Json);

    // Then: The repair fallback closes the structure and says so
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some(r#"{"a":[1,2]}"#));
    assert_eq!(
        result.metadata.fallbacks_used,
        vec![String::from("validation:json_repair")]
    );
    assert!(result
        .metadata
        .warnings
        .contains(&String::from("repaired malformed JSON")));
}

#[test]
fn when_dream_is_missing_required_fields_they_are_filled_and_marked() {
    // Given: A dream object without an id and with a capitalized style
    let pipeline = ResponseProcessingPipeline::default();
    let raw = json!({ "title": "Clock forest", "style": "Fantasy" });

    // When: The response is processed as a dream
    let result = pipeline.process_response(&raw, "alpha", OperationType::Dream);

    // Then: The dream is repaired and the repair is recorded in the dream
    assert!(result.success);
    let parsed = result.parsed.expect("repaired dream is parsed");
    assert_eq!(parsed["title"], "Clock forest");
    assert_eq!(parsed["style"], "fantasy");
    assert!(parsed["id"].is_string());
    assert_eq!(parsed["assumptions"], json!([REPAIR_MARKER]));
    assert_eq!(
        result.metadata.fallbacks_used,
        vec![String::from("validation:dream_structure_repair")]
    );
}

// =============================================================================
// Recovery: Text Content
// =============================================================================

#[test]
fn when_text_carries_script_markup_it_is_stripped_and_blank_runs_collapse() {
    // Given: A story with an injected script and a run of blank lines
    let pipeline = ResponseProcessingPipeline::default();
    let raw = json!("Once upon a time<script>alert('x')</script>\n\n\n\nthe end");

    // When: The response is processed as text
    let result = pipeline.process_response(&raw, "alpha", OperationType::Text);

    // Then: Only the story remains
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("Once upon a time\n\nthe end"));
    assert!(result.parsed.is_none());
    assert_eq!(result.metadata.stages_completed, Stage::ALL.to_vec());
}

#[test]
fn when_text_exceeds_the_length_limit_it_is_truncated_with_a_warning() {
    // Given: A pipeline that keeps at most ten characters
    let pipeline = ResponseProcessingPipeline::new(PipelineConfig {
        max_content_length: 10,
        ..PipelineConfig::default()
    });

    // When: A longer text is processed
    let result = pipeline.process_response(&json!("abcdefghijklmnop"), "alpha", OperationType::Text);

    // Then: The content is cut and the caller is told
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("abcdefghij"));
    assert_eq!(
        result.metadata.warnings,
        vec![String::from("content truncated to 10 characters")]
    );
}

#[test]
fn when_structured_content_exceeds_the_length_limit_it_is_cut_and_unparsed() {
    // Given: A pipeline that keeps at most twenty characters
    let pipeline = ResponseProcessingPipeline::new(PipelineConfig {
        max_content_length: 20,
        ..PipelineConfig::default()
    });
    let raw = json!({ "title": "a lantern drifting over a sea of glass", "n": 1 });

    // When: A JSON object longer than the limit is processed
    let result = pipeline.process_response(&raw, "alpha", OperationType::Json);

    // Then: The content honors the limit and no stale parsed form is returned
    assert!(result.success);
    let content = result.content.expect("truncated content is returned");
    assert_eq!(content.chars().count(), 20);
    assert!(result.parsed.is_none());
    assert!(result
        .metadata
        .warnings
        .contains(&String::from("content truncated to 20 characters; structured form dropped")));
}

#[test]
fn when_nothing_can_be_salvaged_the_failing_stage_is_reported() {
    // Given: A provider that returned null
    let pipeline = ResponseProcessingPipeline::default();

    // When: The response is processed
    let result = pipeline.process_response(&Value::Null, "alpha", OperationType::Dream);

    // Then: Processing stops at normalization and converts into a pipeline error
    assert!(!result.success);
    assert!(result.metadata.fallback_attempted);
    assert_eq!(result.metadata.failed_stage, Some(Stage::Normalization));
    let error = result.into_result().expect_err("null cannot be processed");
    let CoreError::Pipeline { stage, metadata, .. } = error else {
        panic!("expected a pipeline error, got {error:?}");
    };
    assert_eq!(stage, Stage::Normalization);
    assert_eq!(metadata.provider, "alpha");
}

// =============================================================================
// Recovery: Through the Manager
// =============================================================================

#[tokio::test]
async fn when_response_needs_repair_the_repaired_dream_is_what_gets_cached() {
    // Given: A provider whose dreams always lack an id
    let manager = manager();
    let provider = Arc::new(ScriptedProvider::answering(
        json!({ "title": "Salt cathedral", "style": "surreal" }),
    ));
    manager.register_provider("sketchy", provider.clone()).expect("registers");

    // When: The same prompt is requested twice
    let first = manager
        .generate_dream("salt cathedral", GenerationOptions::default(), FallbackOptions::default())
        .await
        .expect("first request succeeds");
    let second = manager
        .generate_dream("salt cathedral", GenerationOptions::default(), FallbackOptions::default())
        .await
        .expect("second request succeeds");

    // Then: The repair is visible on the first call and served from cache after
    let metadata = first.pipeline.expect("fresh responses carry pipeline metadata");
    assert!(metadata
        .fallbacks_used
        .contains(&String::from("validation:dream_structure_repair")));
    assert!(second.from_cache);
    assert_eq!(second.content, first.content);
    assert_eq!(
        second.parsed.expect("cached dream is parsed")["assumptions"],
        json!([REPAIR_MARKER])
    );
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn when_content_passes_through_unvalidated_it_is_not_cached() {
    // Given: A provider that answers a JSON request with prose
    let manager = manager();
    let provider = Arc::new(ScriptedProvider::answering(json!("sorry, I cannot produce JSON")));
    manager.register_provider("chatty", provider.clone()).expect("registers");
    let options = || FallbackOptions::default().with_operation(OperationType::Json);

    // When: The same prompt is requested twice
    let first = manager
        .generate_dream("copper bells", GenerationOptions::default(), options())
        .await
        .expect("prose is passed through");
    let second = manager
        .generate_dream("copper bells", GenerationOptions::default(), options())
        .await
        .expect("prose is passed through again");

    // Then: The unvalidated answer is returned but never stored or served from cache
    assert!(first.parsed.is_none());
    assert!(first
        .pipeline
        .expect("fresh responses carry pipeline metadata")
        .fallbacks_used
        .contains(&String::from("validation:pass_through")));
    assert_eq!(first.cache_key, None);
    assert!(!second.from_cache);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn when_pipeline_fails_no_other_provider_is_tried() {
    // Given: A preferred provider answering null and a healthy backup
    let manager = manager();
    let broken = Arc::new(ScriptedProvider::answering(Value::Null));
    let backup = Arc::new(ScriptedProvider::new());
    manager
        .register_provider_with("broken", broken.clone(), ProviderSettings::default().with_priority(90.0))
        .expect("registers");
    manager
        .register_provider_with("backup", backup.clone(), ProviderSettings::default().with_priority(10.0))
        .expect("registers");

    // When: A dream is requested
    let error = manager
        .generate_dream(
            "hollow bell",
            GenerationOptions::default(),
            FallbackOptions::default().with_cache_mode(CacheMode::Bypass),
        )
        .await
        .expect_err("payload cannot be processed");

    // Then: The failure is a pipeline error and the backup stayed idle
    assert!(matches!(error, CoreError::Pipeline { stage: Stage::Normalization, .. }));
    assert_eq!(broken.calls(), 1);
    assert_eq!(backup.calls(), 0);
    let health = manager.get_health_status(Some("broken"));
    assert_eq!(health["broken"].failures, 0, "transport succeeded");
}
