use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::ProviderError;
use crate::provider::{GenerationOptions, ProviderCapability, ProviderFuture};

#[derive(Debug, Clone)]
struct Step {
    delay: Option<Duration>,
    outcome: Result<Value, ProviderError>,
}

/// In-memory provider that replays a queued script.
///
/// Each call pops the next step. Once the script runs dry the provider either
/// repeats its `always` outcome or answers with [`fallback_scene`], so it
/// doubles as an offline provider.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    always: Option<Step>,
    probe_error: Option<ProviderError>,
    calls: AtomicU32,
    contexts: Mutex<Vec<Value>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that fails every call with `error`.
    pub fn failing(error: ProviderError) -> Self {
        Self {
            always: Some(Step {
                delay: None,
                outcome: Err(error),
            }),
            ..Self::default()
        }
    }

    /// Provider that answers every call with `value`.
    pub fn answering(value: Value) -> Self {
        Self {
            always: Some(Step {
                delay: None,
                outcome: Ok(value),
            }),
            ..Self::default()
        }
    }

    pub fn respond(self, value: Value) -> Self {
        self.push(None, Ok(value))
    }

    pub fn respond_after(self, delay: Duration, value: Value) -> Self {
        self.push(Some(delay), Ok(value))
    }

    pub fn fail(self, error: ProviderError) -> Self {
        self.push(None, Err(error))
    }

    pub fn fail_after(self, delay: Duration, error: ProviderError) -> Self {
        self.push(Some(delay), Err(error))
    }

    pub fn with_probe_error(mut self, error: ProviderError) -> Self {
        self.probe_error = Some(error);
        self
    }

    /// Number of `generate_dream` calls received.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts received, in call order.
    pub fn contexts(&self) -> Vec<Value> {
        self.contexts
            .lock()
            .expect("scripted provider context log should not be poisoned")
            .clone()
    }

    fn push(self, delay: Option<Duration>, outcome: Result<Value, ProviderError>) -> Self {
        self.script
            .lock()
            .expect("scripted provider script should not be poisoned")
            .push_back(Step { delay, outcome });
        self
    }

    fn next_step(&self) -> Option<Step> {
        let queued = self
            .script
            .lock()
            .expect("scripted provider script should not be poisoned")
            .pop_front();
        queued.or_else(|| self.always.clone())
    }
}

impl ProviderCapability for ScriptedProvider {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn generate_dream<'a>(
        &'a self,
        prompt: &'a str,
        _options: &'a GenerationOptions,
        context: Option<&'a Value>,
    ) -> ProviderFuture<'a, Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .expect("scripted provider context log should not be poisoned")
            .push(context.cloned().unwrap_or(Value::Null));
        let step = self.next_step();

        Box::pin(async move {
            let Some(step) = step else {
                return Ok(fallback_scene(prompt));
            };
            if let Some(delay) = step.delay {
                tokio::time::sleep(delay).await;
            }
            step.outcome
        })
    }

    fn test_connection<'a>(&'a self) -> ProviderFuture<'a, ()> {
        let result = match &self.probe_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }
}

/// Small deterministic dream scene derived from the prompt.
pub fn fallback_scene(prompt: &str) -> Value {
    let text = prompt
        .rsplit_once("User dream:")
        .map(|(_, dream)| dream)
        .unwrap_or(prompt)
        .trim();

    let digest = Sha256::digest(text.as_bytes());
    let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let title = if text.chars().count() > 50 {
        format!("{}...", text.chars().take(48).collect::<String>())
    } else {
        text.to_owned()
    };

    json!({
        "id": format!("local_{}", seed % 100_000),
        "title": title,
        "style": "ethereal",
        "seed": 12345,
        "environment": {
            "preset": "dusk",
            "fog": 0.3,
            "skyColor": "#a6d8ff",
            "ambientLight": 0.8
        },
        "structures": [
            { "id": "s1", "template": "floating_library", "pos": [0, 20, 0], "scale": 1 }
        ],
        "entities": [
            {
                "id": "e1",
                "type": "book_swarm",
                "count": 20,
                "params": { "speed": 1.0, "glow": 0.7, "color": "#ffffff" }
            }
        ],
        "cinematography": {
            "durationSec": 30,
            "shots": [{ "type": "establish", "target": "s1", "duration": 30 }]
        },
        "render": { "res": [1280, 720], "fps": 30, "quality": "draft" }
    })
}
