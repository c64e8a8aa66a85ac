//! Model routing types: logical model specs, adapter requests and errors.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ModelSpec
// ---------------------------------------------------------------------------

/// A logical model and its ordered candidate adapters.
///
/// Immutable once loaded. The router tries `adapters` in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Logical name steps and sweeps refer to (e.g. "fast", "judge").
    pub name: String,
    pub adapters: Vec<AdapterBinding>,
}

/// One candidate backend for a logical model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterBinding {
    /// Name of a configured adapter (e.g. "ollama", "anthropic").
    pub adapter: String,
    /// Backend-specific model identifier (e.g. "llama3.2").
    pub model: String,
    #[serde(default)]
    pub cost: CostClass,
    #[serde(default)]
    pub latency: LatencyClass,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Free,
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Fast,
    #[default]
    Medium,
    Slow,
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Resolved prompt payload sent to an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Ask the backend for a JSON reply where it supports that.
    #[serde(default)]
    pub json: bool,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: None,
            temperature: None,
            json: false,
        }
    }
}

/// Raw backend reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    /// Backend model that produced the reply.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a single adapter invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter misconfigured: {0}")]
    Configuration(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("backend overloaded: {0}")]
    Overloaded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl AdapterError {
    /// Errors worth retrying on the same adapter after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout(_)
                | AdapterError::RateLimited { .. }
                | AdapterError::Overloaded(_)
                | AdapterError::Transport(_)
        )
    }

    /// Errors that no retry on this adapter can fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AdapterError::Configuration(_) | AdapterError::MissingCredentials(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_spec_defaults() {
        let spec: ModelSpec = serde_json::from_str(
            r#"{"name":"fast","adapters":[{"adapter":"ollama","model":"llama3.2"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.adapters[0].cost, CostClass::Medium);
        assert_eq!(spec.adapters[0].latency, LatencyClass::Medium);
    }

    #[test]
    fn test_adapter_error_classification() {
        assert!(AdapterError::Timeout(100).is_transient());
        assert!(AdapterError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(AdapterError::Overloaded("busy".into()).is_transient());
        assert!(!AdapterError::MissingCredentials("KEY".into()).is_transient());
        assert!(AdapterError::MissingCredentials("KEY".into()).is_configuration());
        assert!(!AdapterError::Rejected("bad".into()).is_transient());
        assert!(!AdapterError::Rejected("bad".into()).is_configuration());
    }

    #[test]
    fn test_adapter_error_display() {
        assert_eq!(
            AdapterError::Timeout(1500).to_string(),
            "request timed out after 1500ms"
        );
        assert_eq!(
            AdapterError::RateLimited {
                retry_after_ms: Some(30)
            }
            .to_string(),
            "rate limited (retry after Some(30)ms)"
        );
    }
}
