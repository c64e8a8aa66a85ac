//! Per-kind step execution.
//!
//! Each `StepKind` has a `StepRunner`: model calls go through the
//! `ModelRouter`, tool calls through the `ToolRegistry`, and aggregations run
//! in-process. `StepDispatcher` picks the runner for a request. Runners only
//! produce an output or a classified `StepFailure`; state transitions and
//! contract checks belong to the executor.

use std::sync::Arc;
use std::time::Duration;

use flowbench_types::model::ModelRequest;
use flowbench_types::run::{StepErrorKind, StepFailure};
use flowbench_types::workflow::{AggregationStrategy, ResponseFormat, StepDefinition, StepKind, ValueType};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::expression::value_to_string;
use super::jexl::JexlEvaluator;
use super::tools::{ToolError, ToolRegistry};
use crate::router::fallback::{ModelRouter, RouterError};

/// Everything a runner needs for one attempt. Owned so it can move into a
/// spawned task.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub step: StepDefinition,
    /// Resolved input object.
    pub inputs: Value,
    /// Logical model for model calls (step model, else the run's model).
    pub model: Option<String>,
    pub attempt: u32,
}

impl StepRequest {
    pub fn step_id(&self) -> &str {
        &self.step.id
    }
}

/// Output of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub output: Value,
    /// Adapter that served a model call.
    pub adapter: Option<String>,
}

impl StepOutcome {
    fn local(output: Value) -> Self {
        Self {
            output,
            adapter: None,
        }
    }
}

/// Executes one attempt of a step of a particular kind.
pub trait StepRunner: Send + Sync {
    fn run(
        &self,
        request: &StepRequest,
    ) -> impl std::future::Future<Output = Result<StepOutcome, StepFailure>> + Send;
}

// ---------------------------------------------------------------------------
// Model calls
// ---------------------------------------------------------------------------

pub struct ModelCallRunner {
    router: ModelRouter,
    adapter_timeout: Duration,
}

impl ModelCallRunner {
    pub fn new(router: ModelRouter, adapter_timeout: Duration) -> Self {
        Self {
            router,
            adapter_timeout,
        }
    }
}

impl StepRunner for ModelCallRunner {
    async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepFailure> {
        let StepKind::ModelCall {
            max_tokens,
            temperature,
            response_format,
            ..
        } = &request.step.kind
        else {
            return Err(StepFailure::new(
                StepErrorKind::AdapterError,
                format!("step '{}' is not a model call", request.step_id()),
                false,
            ));
        };
        let Some(model) = request.model.as_deref() else {
            return Err(StepFailure::new(
                StepErrorKind::AdapterError,
                "no model configured for this step or run",
                false,
            ));
        };

        let prompt = match request.inputs.get("prompt") {
            None | Some(Value::Null) => {
                return Err(StepFailure::new(
                    StepErrorKind::ContractViolation,
                    "required field is missing",
                    false,
                )
                .with_path("inputs.prompt"));
            }
            Some(v) => value_to_string(v),
        };
        let system = request
            .inputs
            .get("system")
            .filter(|v| !v.is_null())
            .map(value_to_string);

        let json_mode = *response_format == ResponseFormat::Json;
        let model_request = ModelRequest {
            prompt,
            system,
            max_tokens: *max_tokens,
            temperature: *temperature,
            json: json_mode,
        };
        let policy = request.step.retry_policy();

        tracing::debug!(
            run_id = %request.run_id,
            step_id = %request.step.id,
            model,
            attempt = request.attempt,
            "Routing model call"
        );

        let routed = self
            .router
            .route(model, &model_request, &policy, self.adapter_timeout)
            .await
            .map_err(router_failure)?;

        let output = if json_mode {
            parse_json_reply(&routed.response.content).map_err(|message| {
                StepFailure::new(StepErrorKind::AdapterError, message, true)
            })?
        } else {
            json!({
                "text": routed.response.content,
                "model": routed.response.model,
                "adapter": routed.adapter,
            })
        };

        Ok(StepOutcome {
            output,
            adapter: Some(routed.adapter),
        })
    }
}

fn router_failure(err: RouterError) -> StepFailure {
    match &err {
        RouterError::UnknownModel(_) => {
            StepFailure::new(StepErrorKind::AdapterError, err.to_string(), false)
        }
        RouterError::AllAdaptersExhausted { .. } => StepFailure::new(
            StepErrorKind::AllAdaptersExhausted,
            err.to_string(),
            err.is_transient(),
        ),
    }
}

/// Parse a model reply as JSON, tolerating a surrounding ```json fence.
pub fn parse_json_reply(content: &str) -> Result<Value, String> {
    let trimmed = content.trim();
    let body = strip_code_fence(trimmed).unwrap_or(trimmed);
    serde_json::from_str(body).map_err(|e| format!("model reply is not valid JSON: {e}"))
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    // Drop the info string (e.g. "json") up to the first newline.
    let (_, rest) = rest.split_once('\n')?;
    let body = rest.trim_end().strip_suffix("```")?;
    Some(body.trim())
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

pub struct ToolCallRunner {
    tools: Arc<ToolRegistry>,
}

impl ToolCallRunner {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

impl StepRunner for ToolCallRunner {
    async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepFailure> {
        let StepKind::ToolCall { tool } = &request.step.kind else {
            return Err(StepFailure::new(
                StepErrorKind::ToolError,
                format!("step '{}' is not a tool call", request.step_id()),
                false,
            ));
        };
        self.tools
            .call(tool, request.inputs.clone())
            .await
            .map(StepOutcome::local)
            .map_err(|err: ToolError| {
                StepFailure::new(StepErrorKind::ToolError, err.to_string(), err.is_transient())
            })
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Combines the resolved inputs without any I/O.
///
/// - `merge`: object inputs merged key by key, later inputs win
/// - `concat`: `{ "text": ... }`, inputs joined with `separator` (default `\n`)
/// - `collect`: `{ "items": [...] }` in input-name order
/// - `expression`: `{ "value": ... }` from a JEXL expression over the inputs
pub struct AggregationRunner;

impl StepRunner for AggregationRunner {
    async fn run(&self, request: &StepRequest) -> Result<StepOutcome, StepFailure> {
        aggregate(&request.step.kind, &request.inputs).map(StepOutcome::local)
    }
}

fn aggregation_error(message: impl Into<String>) -> StepFailure {
    StepFailure::new(StepErrorKind::AggregationError, message, false)
}

/// Synchronous so the non-`Send` JEXL evaluator never lives in a future.
fn aggregate(kind: &StepKind, inputs: &Value) -> Result<Value, StepFailure> {
    let StepKind::Aggregation {
        strategy,
        separator,
        expr,
    } = kind
    else {
        return Err(aggregation_error("step is not an aggregation"));
    };
    let empty = Map::new();
    let inputs_map = inputs.as_object().unwrap_or(&empty);

    match strategy {
        AggregationStrategy::Merge => {
            let mut merged = Map::new();
            for (name, value) in inputs_map {
                match value {
                    Value::Object(fields) => {
                        merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    Value::Null => {}
                    other => {
                        return Err(aggregation_error(format!(
                            "merge input '{name}' is not an object (got {})",
                            ValueType::of(other)
                        )));
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        AggregationStrategy::Concat => {
            let separator = separator.as_deref().unwrap_or("\n");
            let text = inputs_map
                .values()
                .filter(|v| !v.is_null())
                .map(value_to_string)
                .collect::<Vec<_>>()
                .join(separator);
            Ok(json!({ "text": text }))
        }
        AggregationStrategy::Collect => {
            let items: Vec<Value> = inputs_map.values().cloned().collect();
            Ok(json!({ "items": items }))
        }
        AggregationStrategy::Expression => {
            let expr = expr
                .as_deref()
                .ok_or_else(|| aggregation_error("expression aggregation needs 'expr'"))?;
            let value = JexlEvaluator::new()
                .evaluate_value(expr, inputs)
                .map_err(|e| aggregation_error(e.to_string()))?;
            Ok(json!({ "value": value }))
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes a request to the runner for its step kind.
pub struct StepDispatcher {
    model: Option<ModelCallRunner>,
    tool: ToolCallRunner,
    aggregation: AggregationRunner,
}

impl StepDispatcher {
    /// A dispatcher able to run model calls through `router`.
    pub fn new(router: ModelRouter, tools: Arc<ToolRegistry>, adapter_timeout: Duration) -> Self {
        Self {
            model: Some(ModelCallRunner::new(router, adapter_timeout)),
            tool: ToolCallRunner::new(tools),
            aggregation: AggregationRunner,
        }
    }

    /// A dispatcher without model access; model-call steps fail.
    pub fn without_models(tools: Arc<ToolRegistry>) -> Self {
        Self {
            model: None,
            tool: ToolCallRunner::new(tools),
            aggregation: AggregationRunner,
        }
    }

    pub async fn dispatch(&self, request: &StepRequest) -> Result<StepOutcome, StepFailure> {
        match &request.step.kind {
            StepKind::ModelCall { .. } => match &self.model {
                Some(runner) => runner.run(request).await,
                None => Err(StepFailure::new(
                    StepErrorKind::AdapterError,
                    "no model router configured",
                    false,
                )),
            },
            StepKind::ToolCall { .. } => self.tool.run(request).await,
            StepKind::Aggregation { .. } => self.aggregation.run(request).await,
        }
    }
}
