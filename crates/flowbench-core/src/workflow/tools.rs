//! Tools callable from `tool_call` steps.
//!
//! `Tool` is a native async trait; `BoxTool` erases it for the registry the
//! same way `BoxModelAdapter` does for adapters. The `echo` and `template`
//! builtins live here; network tools are provided by flowbench-infra.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Value};

use super::expression::value_to_string;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid tool input: {0}")]
    InvalidInput(String),

    #[error("tool failed: {0}")]
    Failed(String),

    /// A failure worth retrying (network blip, 5xx).
    #[error("transient tool failure: {0}")]
    Transient(String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Trait and boxed form
// ---------------------------------------------------------------------------

/// A named operation over the resolved step inputs.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Run the tool. `input` is the resolved input object of the step.
    fn call(&self, input: Value) -> impl Future<Output = Result<Value, ToolError>> + Send;
}

/// Object-safe version of [`Tool`].
pub trait ToolDyn: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn call_boxed(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>>;
}

impl<T: Tool> ToolDyn for T {
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn description(&self) -> &str {
        Tool::description(self)
    }

    fn call_boxed(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>> {
        Box::pin(self.call(input))
    }
}

/// Type-erased tool.
pub struct BoxTool {
    inner: Box<dyn ToolDyn + Send + Sync>,
}

impl BoxTool {
    pub fn new<T: Tool + 'static>(tool: T) -> Self {
        Self {
            inner: Box::new(tool),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn description(&self) -> &str {
        self.inner.description()
    }

    pub async fn call(&self, input: Value) -> Result<Value, ToolError> {
        self.inner.call_boxed(input).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Tools available to `tool_call` steps, indexed by name.
pub struct ToolRegistry {
    tools: HashMap<String, BoxTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// A registry holding the `echo` and `template` builtins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(BoxTool::new(EchoTool));
        registry.register(BoxTool::new(TemplateTool));
        registry
    }

    /// Register a tool under its own name, replacing any previous one.
    pub fn register(&mut self, tool: BoxTool) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&BoxTool> {
        self.tools.get(name)
    }

    /// Look up and run a tool.
    pub async fn call(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.call(input).await
    }

    /// Registered tool names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

/// Returns its input unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the step inputs unchanged"
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        Ok(input)
    }
}

/// Fills `{name}` placeholders in `template` from the `values` object.
///
/// Output: `{ "text": <rendered> }`. `{{` and `}}` render literal braces.
pub struct TemplateTool;

impl Tool for TemplateTool {
    fn name(&self) -> &str {
        "template"
    }

    fn description(&self) -> &str {
        "Render a {placeholder} template from an object of values"
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let template = input
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("'template' must be a string".to_string()))?;
        let empty = serde_json::Map::new();
        let values = match input.get("values") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ToolError::InvalidInput("'values' must be an object".to_string()));
            }
        };
        render_template(template, values).map(|text| json!({ "text": text }))
    }
}

fn render_template(template: &str, values: &serde_json::Map<String, Value>) -> Result<String, ToolError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(ToolError::InvalidInput(format!(
                                "unterminated placeholder '{{{name}'"
                            )));
                        }
                    }
                }
                let name = name.trim();
                let value = values.get(name).ok_or_else(|| {
                    ToolError::InvalidInput(format!("no value for placeholder '{name}'"))
                })?;
                out.push_str(&value_to_string(value));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
