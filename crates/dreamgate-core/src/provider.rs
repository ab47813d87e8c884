//! Provider contract and request option types.
//!
//! All upstream model providers implement [`ProviderCapability`]. The trait
//! returns boxed futures so providers can be stored as `Arc<dyn ...>` and
//! chosen at runtime by name.
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`generate_dream`](ProviderCapability::generate_dream) | Run one generation, returning the raw provider payload |
//! | [`test_connection`](ProviderCapability::test_connection) | Cheap reachability probe used by health checks |
//! | [`kind`](ProviderCapability::kind) | Implementation label shown in registry output |

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

/// Boxed future returned by provider calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Output quality requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    High,
    Cinematic,
}

impl QualityTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Standard => "standard",
            Self::High => "high",
            Self::Cinematic => "cinematic",
        }
    }
}

impl Display for QualityTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            "cinematic" => Ok(Self::Cinematic),
            other => Err(format!(
                "unknown quality '{other}'; expected draft, standard, high, or cinematic"
            )),
        }
    }
}

/// Generation parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Provider-specific extras, kept sorted for stable cache fingerprints.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GenerationOptions {
    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }
}

/// Static rate and concurrency limits for one provider. Zero disables a
/// limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    pub requests_per_minute: u32,
    /// Informational; upstream token accounting is not enforced locally.
    pub tokens_per_minute: u32,
    pub max_concurrent: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 0,
            max_concurrent: 5,
        }
    }
}

impl ProviderLimits {
    pub const fn unlimited() -> Self {
        Self {
            requests_per_minute: 0,
            tokens_per_minute: 0,
            max_concurrent: 0,
        }
    }
}

/// Upstream model provider contract.
///
/// Implementations must be `Send + Sync`; one instance serves every
/// concurrent request routed to it.
pub trait ProviderCapability: Send + Sync {
    /// Implementation label such as `http` or `scripted`.
    fn kind(&self) -> &'static str;

    /// Generate a response for `prompt`.
    ///
    /// The returned value is the provider's raw payload: a JSON string, an
    /// OpenAI-style envelope, or any other JSON document. The response
    /// pipeline turns it into validated content.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] carrying whatever the classifier needs:
    /// HTTP status, connection error code, and `Retry-After` headers.
    fn generate_dream<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
        context: Option<&'a Value>,
    ) -> ProviderFuture<'a, Value>;

    /// Probe provider reachability without generating content.
    fn test_connection<'a>(&'a self) -> ProviderFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_parses_case_insensitively() {
        assert_eq!("Cinematic".parse::<QualityTier>(), Ok(QualityTier::Cinematic));
        assert!("ultra".parse::<QualityTier>().is_err());
    }

    #[test]
    fn options_flatten_extras_in_key_order() {
        let mut options = GenerationOptions::default().with_quality(QualityTier::High);
        options.extra.insert(String::from("zeta"), Value::from(1));
        options.extra.insert(String::from("alpha"), Value::from(2));

        let json = serde_json::to_string(&options).expect("options serialize");

        assert_eq!(json, r#"{"quality":"high","alpha":2,"zeta":1}"#);
    }
}
