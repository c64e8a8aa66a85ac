//! Tools that need network access.

pub mod http;

use flowbench_core::workflow::tools::{BoxTool, ToolRegistry};

use self::http::HttpTool;

/// The builtin tools plus `http_request`.
pub fn default_tools() -> Result<ToolRegistry, reqwest::Error> {
    let mut registry = ToolRegistry::with_builtins();
    registry.register(BoxTool::new(HttpTool::new()?));
    Ok(registry)
}
