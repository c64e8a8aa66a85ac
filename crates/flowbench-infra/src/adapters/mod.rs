//! HTTP model adapters.
//!
//! Concrete [`ModelAdapter`] implementations for the OpenAI chat-completions
//! protocol (OpenAI itself, Ollama, vLLM, LM Studio) and the Anthropic
//! Messages API, plus the factory that builds an [`AdapterRegistry`] from
//! configuration.
//!
//! [`ModelAdapter`]: flowbench_core::router::adapter::ModelAdapter

pub mod anthropic;
pub mod openai_compat;

use std::time::Duration;

use reqwest::StatusCode;
use secrecy::SecretString;

use flowbench_core::router::box_adapter::BoxModelAdapter;
use flowbench_core::router::registry::AdapterRegistry;
use flowbench_types::config::{AdapterConfig, AdapterKind};
use flowbench_types::model::AdapterError;

use self::anthropic::AnthropicAdapter;
use self::openai_compat::OpenAiCompatibleAdapter;

/// Create a [`BoxModelAdapter`] from an [`AdapterConfig`].
///
/// API keys are read from the environment variable named by `api_key_env`.
/// A missing key is not an error here; the adapter reports
/// `MissingCredentials` when it is first invoked, so a sweep over other
/// adapters still runs.
pub fn create_adapter(config: &AdapterConfig) -> Result<BoxModelAdapter, AdapterError> {
    let client = http_client()?;
    let adapter = match config.kind {
        AdapterKind::OpenaiCompatible => {
            let key = ApiKey::from_env(config.api_key_env.as_deref());
            let mut adapter = OpenAiCompatibleAdapter::new(client, config.name.clone(), key);
            if let Some(base_url) = &config.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            BoxModelAdapter::new(adapter)
        }
        AdapterKind::Anthropic => {
            let env = config
                .api_key_env
                .as_deref()
                .unwrap_or(AnthropicAdapter::DEFAULT_KEY_ENV);
            let key = ApiKey::from_env(Some(env));
            let mut adapter = AnthropicAdapter::new(client, config.name.clone(), key);
            if let Some(base_url) = &config.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            BoxModelAdapter::new(adapter)
        }
    };
    tracing::debug!(
        adapter = %config.name,
        kind = %config.kind,
        locality = ?config.locality,
        "Created model adapter"
    );
    Ok(adapter)
}

/// Build a registry holding one adapter per configured entry.
pub fn build_registry(configs: &[AdapterConfig]) -> Result<AdapterRegistry, AdapterError> {
    let mut registry = AdapterRegistry::new();
    for config in configs {
        registry.register(create_adapter(config)?);
    }
    Ok(registry)
}

fn http_client() -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AdapterError::Configuration(format!("failed to create HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// API key resolution result, kept until the adapter is invoked.
pub enum ApiKey {
    /// No key configured; requests go out unauthenticated.
    None,
    Present(SecretString),
    /// A key was configured but the variable is unset or empty.
    Missing { env: String },
}

impl ApiKey {
    pub fn from_env(env: Option<&str>) -> Self {
        let Some(env) = env else {
            return ApiKey::None;
        };
        match std::env::var(env) {
            Ok(value) if !value.trim().is_empty() => ApiKey::Present(SecretString::from(value)),
            _ => ApiKey::Missing { env: env.to_string() },
        }
    }

    /// The key to send, `None` for unauthenticated backends.
    pub fn require(&self) -> Result<Option<&SecretString>, AdapterError> {
        match self {
            ApiKey::None => Ok(None),
            ApiKey::Present(key) => Ok(Some(key)),
            ApiKey::Missing { env } => Err(AdapterError::MissingCredentials(format!(
                "environment variable {env} is not set"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status to an [`AdapterError`].
pub(crate) fn map_status(status: StatusCode, body: &str, retry_after: Option<&str>) -> AdapterError {
    match status.as_u16() {
        401 | 403 => AdapterError::Configuration(format!("authentication failed (HTTP {status})")),
        429 => AdapterError::RateLimited {
            retry_after_ms: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000),
        },
        503 | 529 => AdapterError::Overloaded(truncate(body)),
        500..=599 => AdapterError::Transport(format!("HTTP {status}: {}", truncate(body))),
        _ => AdapterError::Rejected(format!("HTTP {status}: {}", truncate(body))),
    }
}

/// Map a `reqwest` send error.
pub(crate) fn map_send_error(err: reqwest::Error, timeout: Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout.as_millis() as u64)
    } else {
        AdapterError::Transport(format!("HTTP request failed: {err}"))
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
