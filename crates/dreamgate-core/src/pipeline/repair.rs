//! Text-level JSON recovery and dream structure repair.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

/// Styles a dream may declare.
pub const DREAM_STYLES: [&str; 5] = ["ethereal", "cyberpunk", "surreal", "fantasy", "nightmare"];

pub const REQUIRED_DREAM_FIELDS: [&str; 3] = ["id", "title", "style"];

/// Marker appended to `assumptions` when fields were filled in.
pub const REPAIR_MARKER: &str = "auto_repaired_missing_fields";

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("static pattern is valid"));

static GREEDY_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\{[\s\S]*\})").expect("static pattern is valid"));

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n(.*?)\n?\s*```\s*$").expect("static pattern is valid")
});

/// First balanced `{...}` block in `text`, ignoring braces inside strings.
/// Falls back to the span from the first `{` to the last `}`.
pub fn extract_first_json_block(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' if start.is_some() => in_string = true,
            '{' => {
                if start.is_none() {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let begin = start?;
                    return Some(&text[begin..=index]);
                }
            }
            _ => {}
        }
    }

    GREEDY_OBJECT
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Remove commas directly before a closing bracket.
pub fn strip_trailing_commas(text: &str) -> Cow<'_, str> {
    TRAILING_COMMA.replace_all(text, "$1")
}

/// Close an unterminated string and any brackets left open at the end of
/// `text`, dropping a dangling `,` or `:` first.
pub fn close_unbalanced(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = text.trim_end().to_owned();
    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    }
    while repaired.ends_with(',') || repaired.ends_with(':') {
        repaired.pop();
        repaired.truncate(repaired.trim_end().len());
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    repaired
}

/// Strip a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    CODE_FENCE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
}

/// Parse after stripping trailing commas and closing open brackets.
pub fn parse_repaired(text: &str) -> Option<Value> {
    let tidy = strip_trailing_commas(text);
    if let Ok(value) = serde_json::from_str(&tidy) {
        return Some(value);
    }
    let closed = close_unbalanced(&tidy);
    let closed = strip_trailing_commas(&closed);
    serde_json::from_str(&closed).ok()
}

/// Best-effort parse: as-is, then the first JSON block, then repairs.
pub fn parse_lenient(text: &str) -> Option<Value> {
    let text = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    if let Some(block) = extract_first_json_block(text) {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(value);
        }
        if let Some(value) = parse_repaired(block) {
            return Some(value);
        }
    }
    let start = text.find(['{', '['])?;
    parse_repaired(&text[start..])
}

/// Problems that keep `value` from being a valid dream.
pub fn dream_problems(value: &Value) -> Vec<String> {
    let Some(dream) = value.as_object() else {
        return vec![String::from("dream must be an object")];
    };

    let mut problems = REQUIRED_DREAM_FIELDS
        .iter()
        .filter(|field| !dream.contains_key(**field))
        .map(|field| format!("missing_required:{field}"))
        .collect::<Vec<_>>();

    if let Some(style) = dream.get("style") {
        if !style.as_str().is_some_and(|style| DREAM_STYLES.contains(&style)) {
            problems.push(format!("invalid_style:{style}"));
        }
    }

    if let Some(cinematography) = dream.get("cinematography") {
        match cinematography.as_object() {
            None => problems.push(String::from("cinematography_not_object")),
            Some(c) if !c.contains_key("durationSec") || !c.contains_key("shots") => {
                problems.push(String::from("cinematography_missing_duration_or_shots"));
            }
            Some(c) => {
                if !c["shots"].as_array().is_some_and(|shots| !shots.is_empty()) {
                    problems.push(String::from("cinematography_shots_invalid"));
                }
            }
        }
    }

    problems
}

/// Fill required dream fields and default cinematography. Returns `None`
/// when `value` is not an object.
pub fn repair_dream(value: &Value) -> Option<Value> {
    let mut dream = value.as_object()?.clone();

    dream
        .entry("id")
        .or_insert_with(|| json!(format!("repaired_{}", OffsetDateTime::now_utc().unix_timestamp())));
    dream
        .entry("title")
        .or_insert_with(|| json!("Repaired Dream"));

    let style = dream
        .get("style")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .filter(|style| DREAM_STYLES.contains(&style.as_str()))
        .unwrap_or_else(|| String::from("ethereal"));
    dream.insert(String::from("style"), Value::String(style));

    for key in ["structures", "entities"] {
        if !dream.get(key).is_some_and(Value::is_array) {
            dream.insert(key.to_owned(), Value::Array(Vec::new()));
        }
    }

    let target = dream
        .get("structures")
        .and_then(Value::as_array)
        .and_then(|structures| structures.first())
        .and_then(|first| first.get("id"))
        .cloned()
        .unwrap_or_else(|| json!("s1"));

    match dream.get_mut("cinematography").and_then(Value::as_object_mut) {
        Some(cinematography) => fill_cinematography(cinematography, target),
        None => {
            dream.insert(
                String::from("cinematography"),
                json!({
                    "durationSec": 30,
                    "shots": [{ "type": "establish", "target": target, "duration": 30 }]
                }),
            );
        }
    }

    let assumptions = dream
        .entry("assumptions")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !assumptions.is_array() {
        *assumptions = Value::Array(Vec::new());
    }
    if let Some(list) = assumptions.as_array_mut() {
        list.push(Value::String(REPAIR_MARKER.to_owned()));
    }

    Some(Value::Object(dream))
}

fn fill_cinematography(cinematography: &mut Map<String, Value>, target: Value) {
    if !cinematography.contains_key("durationSec") {
        let total = cinematography
            .get("shots")
            .and_then(Value::as_array)
            .map(|shots| {
                shots
                    .iter()
                    .filter_map(|shot| shot.get("duration").and_then(Value::as_f64))
                    .sum::<f64>()
            })
            .unwrap_or(0.0);
        let duration = if total > 0.0 { json!(total) } else { json!(30) };
        cinematography.insert(String::from("durationSec"), duration);
    }

    let shots_valid = cinematography
        .get("shots")
        .and_then(Value::as_array)
        .is_some_and(|shots| !shots.is_empty());
    if !shots_valid {
        let duration = cinematography
            .get("durationSec")
            .cloned()
            .unwrap_or_else(|| json!(30));
        cinematography.insert(
            String::from("shots"),
            json!([{ "type": "establish", "target": target, "duration": duration }]),
        );
    }
}
