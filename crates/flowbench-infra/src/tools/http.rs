//! `http_request` tool.
//!
//! Input:
//! ```json
//! { "url": "...", "method": "GET", "headers": { "k": "v" }, "body": ..., "timeout_secs": 30 }
//! ```
//! Output: `{ "status": 200, "body": <json or text> }`. A JSON response body
//! is returned parsed, anything else as a string.

use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Map, Value};

use flowbench_core::workflow::tools::{Tool, ToolError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTool {
    client: reqwest::Client,
}

/// A validated request, built from the step inputs.
#[derive(Debug)]
struct HttpCall {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    timeout: Duration,
}

impl HttpTool {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
        })
    }
}

impl Tool for HttpTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Send an HTTP request and return its status and body"
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let call = parse_call(&input)?;
        tracing::debug!(method = %call.method, url = %call.url, "http_request");

        let mut builder = self
            .client
            .request(call.method, &call.url)
            .timeout(call.timeout);
        for (name, value) in &call.headers {
            builder = builder.header(name, value);
        }
        builder = match call.body {
            None => builder,
            Some(Value::String(text)) => builder.body(text),
            Some(value) => builder.json(&value),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ToolError::Transient(format!("request to {} failed: {e}", call.url))
            } else {
                ToolError::Failed(format!("request to {} failed: {e}", call.url))
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Transient(format!("failed to read response body: {e}")))?;
        classify_status(status, &text)?;

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status, "body": body }))
    }
}

fn parse_call(input: &Value) -> Result<HttpCall, ToolError> {
    let url = input
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput("'url' must be a string".to_string()))?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ToolError::InvalidInput(format!("unsupported url '{url}'")));
    }

    let method = match input.get("method") {
        None | Some(Value::Null) => Method::GET,
        Some(Value::String(m)) => Method::from_bytes(m.to_uppercase().as_bytes())
            .map_err(|_| ToolError::InvalidInput(format!("invalid method '{m}'")))?,
        Some(_) => return Err(ToolError::InvalidInput("'method' must be a string".to_string())),
    };

    let empty = Map::new();
    let headers = match input.get("headers") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ToolError::InvalidInput("'headers' must be an object".to_string())),
    };
    let headers = headers
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k.clone(), s.clone()),
            other => (k.clone(), other.to_string()),
        })
        .collect();

    let timeout = match input.get("timeout_secs") {
        None | Some(Value::Null) => DEFAULT_TIMEOUT,
        Some(v) => v
            .as_u64()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| ToolError::InvalidInput("'timeout_secs' must be a positive integer".to_string()))?,
    };

    Ok(HttpCall {
        method,
        url: url.to_string(),
        headers,
        body: input.get("body").filter(|b| !b.is_null()).cloned(),
        timeout,
    })
}

/// 5xx and 429 are worth retrying; other non-2xx statuses are not.
fn classify_status(status: u16, body: &str) -> Result<(), ToolError> {
    let snippet: String = body.chars().take(200).collect();
    match status {
        200..=299 => Ok(()),
        429 | 500..=599 => Err(ToolError::Transient(format!("HTTP {status}: {snippet}"))),
        _ => Err(ToolError::Failed(format!("HTTP {status}: {snippet}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_defaults() {
        let call = parse_call(&json!({ "url": "https://example.com/api" })).unwrap();
        assert_eq!(call.method, Method::GET);
        assert!(call.headers.is_empty());
        assert!(call.body.is_none());
        assert_eq!(call.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_parse_call_full() {
        let call = parse_call(&json!({
            "url": "http://localhost:8080/items",
            "method": "post",
            "headers": { "x-trace": "abc", "x-count": 3 },
            "body": { "name": "widget" },
            "timeout_secs": 5
        }))
        .unwrap();
        assert_eq!(call.method, Method::POST);
        assert!(call.headers.contains(&("x-count".to_string(), "3".to_string())));
        assert_eq!(call.body, Some(json!({ "name": "widget" })));
        assert_eq!(call.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_call_rejects_bad_input() {
        assert!(matches!(
            parse_call(&json!({})),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_call(&json!({ "url": "file:///etc/passwd" })),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_call(&json!({ "url": "https://x", "timeout_secs": 0 })),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_call(&json!({ "url": "https://x", "headers": [1] })),
            Err(ToolError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(204, "").is_ok());
        assert!(classify_status(503, "down").unwrap_err().is_transient());
        assert!(classify_status(429, "").unwrap_err().is_transient());
        let err = classify_status(404, "missing").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_default_tools_include_http_request() {
        let registry = super::super::default_tools().unwrap();
        assert_eq!(registry.list_names(), vec!["echo", "http_request", "template"]);
    }
}
