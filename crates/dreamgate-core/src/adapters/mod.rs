//! Concrete provider implementations.

pub mod http;
pub mod scripted;

pub use http::HttpLlmProvider;
pub use scripted::{fallback_scene, ScriptedProvider};
