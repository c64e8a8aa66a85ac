//! Workflow definition types.
//!
//! `WorkflowDefinition` is the parsed form of a workflow document: declared
//! variables plus a set of steps whose input bindings reference variables
//! and upstream step outputs. Loading, reference resolution and DAG
//! validation live in `flowbench-core`; this module only models the shape.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow: declared variables plus a DAG of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (e.g. "summarize-article").
    pub id: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Variable declarations, in declaration order.
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    /// Step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a step by identifier.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Look up a variable declaration by name.
    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// A workflow-level variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    /// Value used when the caller supplies none. A variable without a
    /// default is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// JSON value types used by variable declarations and schemas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ValueType {
    /// Whether `value` is an instance of this type.
    ///
    /// `Number` accepts integers; `Integer` rejects floats with a fraction.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
            ValueType::Any => true,
        }
    }

    /// The type of a concrete JSON value (never `Any`).
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueType::String,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueType::Integer,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Boolean,
            Value::Object(_) => ValueType::Object,
            Value::Array(_) => ValueType::Array,
            // Null has no dedicated type; report it as Any.
            Value::Null => ValueType::Any,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Any => "any",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step identifier, unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// What the step does.
    pub kind: StepKind,
    /// Named input bindings. Strings may embed `{{ ... }}` references to
    /// variables or upstream outputs; objects and arrays are resolved
    /// recursively; anything else is a literal.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Ordering-only dependencies in addition to those implied by `inputs`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declared shape of the resolved inputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_schema: Schema,
    /// Declared shape of the step output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: Schema,
    /// Retry policy. Absent means a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// When true, dependents proceed if this step fails, seeing its output
    /// as absent.
    #[serde(default)]
    pub optional: bool,
}

impl StepDefinition {
    /// The effective retry policy (a single attempt when none is declared).
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(RetryPolicy::single_attempt)
    }
}

/// The closed set of step kinds.
///
/// Internally tagged by `type`:
/// ```yaml
/// kind:
///   type: model_call
///   response_format: json
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Send the `prompt` (and optional `system`) input to a model.
    ModelCall {
        /// Logical model name; falls back to the run's model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
        #[serde(default)]
        response_format: ResponseFormat,
    },
    /// Invoke a registered tool with the resolved inputs.
    ToolCall { tool: String },
    /// Combine the resolved inputs in-process.
    Aggregation {
        strategy: AggregationStrategy,
        /// Separator for `concat` (default newline).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        separator: Option<String>,
        /// JEXL expression for `expression`, evaluated with the inputs as context.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },
}

impl StepKind {
    /// Short label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::ModelCall { .. } => "model_call",
            StepKind::ToolCall { .. } => "tool_call",
            StepKind::Aggregation { .. } => "aggregation",
        }
    }
}

/// How a model-call step interprets the model reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Output is `{text, model, adapter}`.
    #[default]
    Text,
    /// The reply is parsed as JSON and becomes the output.
    Json,
}

/// Aggregation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Merge object inputs key by key (later inputs win).
    Merge,
    /// Join inputs as strings.
    Concat,
    /// Collect inputs into an array, in input-name order.
    Collect,
    /// Evaluate a JEXL expression over the inputs.
    Expression,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry policy shared by step execution and the model router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3, minimum 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay shape between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Exactly one attempt, no backoff.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }
}

/// Backoff shape between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Constant delay.
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`.
    Exponential {
        #[serde(default = "default_initial_ms")]
        initial_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

fn default_initial_ms() -> u64 {
    250
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    10_000
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

impl Backoff {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let ms = (*initial_ms as f64) * multiplier.max(1.0).powi(exponent);
                Duration::from_millis(ms.min(*max_ms as f64) as u64)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Declared shape of a step's inputs or outputs: field name to spec.
pub type Schema = BTreeMap<String, FieldSpec>;

/// Shape of a single field.
///
/// Accepts either a bare type name or a full spec:
/// ```yaml
/// outputs:
///   text: string
///   items:
///     type: array
///     items: { type: object, fields: { score: number } }
///   note: { type: string, required: false }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FieldSpecRepr")]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: ValueType,
    pub required: bool,
    /// Nested fields when `field_type` is `object`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: Schema,
    /// Element shape when `field_type` is `array`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSpec>>,
}

impl FieldSpec {
    /// A required field of the given type with no nested shape.
    pub fn of(field_type: ValueType) -> Self {
        Self {
            field_type,
            required: true,
            fields: Schema::new(),
            items: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldSpecRepr {
    Short(ValueType),
    Full {
        #[serde(rename = "type", default)]
        field_type: ValueType,
        #[serde(default = "default_required")]
        required: bool,
        #[serde(default)]
        fields: Schema,
        #[serde(default)]
        items: Option<Box<FieldSpec>>,
    },
}

fn default_required() -> bool {
    true
}

impl From<FieldSpecRepr> for FieldSpec {
    fn from(repr: FieldSpecRepr) -> Self {
        match repr {
            FieldSpecRepr::Short(field_type) => FieldSpec::of(field_type),
            FieldSpecRepr::Full {
                field_type,
                required,
                fields,
                items,
            } => FieldSpec {
                field_type,
                required,
                fields,
                items,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
id: summarize
description: Draft then review
variables:
  - name: topic
    type: string
    default: rust
  - name: rounds
    type: integer
steps:
  - id: draft
    kind:
      type: model_call
      max_tokens: 512
    inputs:
      prompt: "Write about {{ variables.topic }}"
    outputs:
      text: string
  - id: review
    kind: { type: model_call, model: judge, response_format: json }
    inputs:
      prompt: "Score: {{ steps.draft.output.text }}"
    outputs:
      score: number
      notes: { type: string, required: false }
    retry:
      max_attempts: 4
      backoff: { type: fixed, delay_ms: 10 }
    timeout_secs: 30
  - id: bundle
    kind: { type: aggregation, strategy: concat, separator: " | " }
    inputs:
      a: "{{ steps.draft.output.text }}"
    optional: true
"#;

    #[test]
    fn test_parse_realistic_yaml_workflow() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert_eq!(def.id, "summarize");
        assert_eq!(def.variables.len(), 2);
        assert_eq!(def.variables[1].value_type, ValueType::Integer);
        assert!(def.variables[1].default.is_none());
        assert_eq!(def.steps.len(), 3);

        let review = def.step("review").unwrap();
        assert_eq!(
            review.kind,
            StepKind::ModelCall {
                model: Some("judge".to_string()),
                max_tokens: None,
                temperature: None,
                response_format: ResponseFormat::Json,
            }
        );
        assert_eq!(review.retry_policy().max_attempts, 4);
        assert_eq!(review.timeout_secs, Some(30));
        assert!(!review.outputs["notes"].required);
        assert!(review.outputs["score"].required);

        let bundle = def.step("bundle").unwrap();
        assert!(bundle.optional);
        assert_eq!(bundle.kind.label(), "aggregation");
    }

    #[test]
    fn test_field_spec_short_and_full_forms() {
        let schema: Schema = serde_yaml_ng::from_str(
            r#"
text: string
items:
  type: array
  items: { type: object, fields: { score: number } }
"#,
        )
        .unwrap();
        assert_eq!(schema["text"], FieldSpec::of(ValueType::String));
        let items = schema["items"].items.as_ref().unwrap();
        assert_eq!(items.field_type, ValueType::Object);
        assert_eq!(items.fields["score"].field_type, ValueType::Number);
    }

    #[test]
    fn test_missing_retry_means_single_attempt() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "a",
            "kind": { "type": "tool_call", "tool": "echo" }
        }))
        .unwrap();
        let policy = step.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 500,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_and_none_backoff() {
        assert_eq!(Backoff::None.delay_for(3), Duration::ZERO);
        assert_eq!(
            Backoff::Fixed { delay_ms: 75 }.delay_for(9),
            Duration::from_millis(75)
        );
    }

    #[test]
    fn test_value_type_matches() {
        assert!(ValueType::Number.matches(&json!(1)));
        assert!(ValueType::Number.matches(&json!(1.5)));
        assert!(ValueType::Integer.matches(&json!(7)));
        assert!(!ValueType::Integer.matches(&json!(7.5)));
        assert!(!ValueType::String.matches(&json!(null)));
        assert!(ValueType::Any.matches(&json!(null)));
        assert_eq!(ValueType::of(&json!([1])), ValueType::Array);
        assert_eq!(ValueType::of(&json!(2.5)), ValueType::Number);
    }

    #[test]
    fn test_unknown_step_kind_rejected() {
        let result: Result<StepKind, _> =
            serde_json::from_value(json!({ "type": "teleport" }));
        assert!(result.is_err());
    }
}
