//! Adapter for the Anthropic Messages API (`/v1/messages`).
//!
//! The API key is held as a [`secrecy::SecretString`] and only exposed when
//! building the request headers.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use flowbench_core::router::adapter::ModelAdapter;
use flowbench_types::model::{AdapterError, ModelRequest, ModelResponse, Usage};

use super::{map_send_error, map_status, ApiKey};

/// Appended to the system prompt for JSON replies; the Messages API has no
/// JSON response mode.
const JSON_INSTRUCTION: &str = "Respond with a single JSON object and nothing else.";

/// Anthropic Messages API adapter.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    name: String,
    api_key: ApiKey,
    base_url: String,
}

impl AnthropicAdapter {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    pub const DEFAULT_KEY_ENV: &'static str = "ANTHROPIC_API_KEY";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MAX_TOKENS: u32 = 1024;

    pub fn new(client: reqwest::Client, name: String, api_key: ApiKey) -> Self {
        Self {
            client,
            name,
            api_key,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn to_messages_request(&self, model: &str, request: &ModelRequest) -> MessagesRequest {
        let system = match (&request.system, request.json) {
            (Some(system), true) => Some(format!("{system}\n\n{JSON_INSTRUCTION}")),
            (None, true) => Some(JSON_INSTRUCTION.to_string()),
            (system, false) => system.clone(),
        };
        MessagesRequest {
            model: model.to_string(),
            max_tokens: request.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            system,
            temperature: request.temperature,
            stream: false,
        }
    }
}

impl ModelAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        model: &str,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelResponse, AdapterError> {
        let key = self.api_key.require()?.ok_or_else(|| {
            AdapterError::MissingCredentials(format!(
                "adapter '{}' has no API key configured",
                self.name
            ))
        })?;
        let body = self.to_messages_request(model, request);

        let response = self
            .client
            .post(self.url())
            .timeout(timeout)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let error_body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &error_body, retry_after.as_deref()));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidResponse(format!("failed to parse response: {e}")))?;
        Ok(parsed.into_model_response())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    usage: MessagesUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl MessagesResponse {
    fn into_model_response(self) -> ModelResponse {
        let content = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");
        ModelResponse {
            content,
            model: self.model,
            usage: Some(Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
            }),
        }
    }
}
