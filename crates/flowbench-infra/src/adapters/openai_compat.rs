//! Adapter for backends speaking the OpenAI chat-completions protocol.
//!
//! Covers OpenAI itself and the common local servers (Ollama, vLLM,
//! LM Studio, llama.cpp server), which differ only in base URL and whether
//! they want a bearer token.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use flowbench_core::router::adapter::ModelAdapter;
use flowbench_types::model::{AdapterError, ModelRequest, ModelResponse, Usage};

use super::{map_send_error, map_status, ApiKey};

/// OpenAI-compatible chat-completions adapter.
pub struct OpenAiCompatibleAdapter {
    client: reqwest::Client,
    name: String,
    api_key: ApiKey,
    base_url: String,
}

impl OpenAiCompatibleAdapter {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

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
        format!("{}/chat/completions", self.base_url)
    }

    fn to_chat_request(&self, model: &str, request: &ModelRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.json.then(|| ResponseFormat {
                kind: "json_object".to_string(),
            }),
            stream: false,
        }
    }
}

impl ModelAdapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        model: &str,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelResponse, AdapterError> {
        let key = self.api_key.require()?;
        let body = self.to_chat_request(model, request);

        let mut builder = self.client.post(self.url()).timeout(timeout).json(&body);
        if let Some(key) = key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
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

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidResponse(format!("failed to parse response: {e}")))?;
        chat.into_model_response(model)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl ChatResponse {
    fn into_model_response(self, requested_model: &str) -> Result<ModelResponse, AdapterError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::InvalidResponse("response has no choices".to_string()))?;
        Ok(ModelResponse {
            content: choice.message.content,
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            usage: self.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use serde_json::json;

    fn adapter(key: ApiKey) -> OpenAiCompatibleAdapter {
        OpenAiCompatibleAdapter::new(reqwest::Client::new(), "ollama".into(), key)
    }

    #[test]
    fn test_url_uses_base_url_without_trailing_slash() {
        let adapter = adapter(ApiKey::None).with_base_url("http://localhost:11434/v1/".into());
        assert_eq!(adapter.url(), "http://localhost:11434/v1/chat/completions");
        assert_eq!(
            OpenAiCompatibleAdapter::new(reqwest::Client::new(), "openai".into(), ApiKey::None).url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_chat_request_body() {
        let mut request = ModelRequest::new("Summarize this");
        request.system = Some("Be brief".into());
        request.max_tokens = Some(256);
        request.json = true;

        let body = serde_json::to_value(adapter(ApiKey::None).to_chat_request("llama3.2", &request)).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "llama3.2",
                "messages": [
                    { "role": "system", "content": "Be brief" },
                    { "role": "user", "content": "Summarize this" }
                ],
                "max_tokens": 256,
                "response_format": { "type": "json_object" },
                "stream": false
            })
        );
    }

    #[test]
    fn test_chat_request_omits_unset_fields() {
        let body = serde_json::to_value(
            adapter(ApiKey::None).to_chat_request("gpt-4o-mini", &ModelRequest::new("hi")),
        )
        .unwrap();
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body.get("response_format").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_chat_response() {
        let raw = json!({
            "id": "chatcmpl-1",
            "model": "llama3.2:latest",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Hello" } }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6 }
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        let response = parsed.into_model_response("llama3.2").unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.model, "llama3.2:latest");
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 5,
                output_tokens: 1
            })
        );
    }

    #[test]
    fn test_empty_choices_is_invalid_response() {
        let parsed: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        let err = parsed.into_model_response("m").unwrap_err();
        assert!(matches!(err, AdapterError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_any_request() {
        let adapter = adapter(ApiKey::Missing {
            env: "OPENAI_API_KEY".into(),
        })
        // Unroutable address; never contacted.
        .with_base_url("http://127.0.0.1:9".into());
        let err = adapter
            .invoke("gpt-4o", &ModelRequest::new("hi"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingCredentials(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_present_key_is_not_debug_printed() {
        let key = ApiKey::Present(SecretString::from("sk-secret"));
        let resolved = key.require().unwrap().unwrap();
        assert!(!format!("{resolved:?}").contains("sk-secret"));
    }
}
