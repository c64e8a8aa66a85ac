//! JEXL evaluator for aggregation expressions and rubric scorers.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered transforms. Values are
//! always passed in as context objects, never spliced into expression text.
//!
//! The underlying evaluator is not `Send`; build one where it is used and
//! drop it before any `.await`.

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JexlError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not evaluate to a number: got {result}")]
    NotNumeric { result: Value },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// Used for:
/// - `expression` aggregation steps (e.g. `a.items|length + b.items|length`)
/// - rubric `expression` scorers (e.g. `steps.review.output.score / 10`)
/// - resolving rubric `value` paths (e.g. `steps.draft.output.text`)
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl JexlEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("join", |args: &[Value]| {
                let separator = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let joined = args
                    .first()
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .map(super::expression::value_to_string)
                            .collect::<Vec<_>>()
                            .join(separator)
                    })
                    .unwrap_or_default();
                Ok(json!(joined))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Works on strings (chars), arrays, and objects
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("number", |args: &[Value]| {
                let n = match args.first() {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                    Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
                    _ => None,
                };
                Ok(n.map(|n| json!(n)).unwrap_or(Value::Null))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = args
                    .first()
                    .and_then(|v| v.as_object())
                    .map(|o| o.keys().collect())
                    .unwrap_or_default();
                Ok(json!(keys))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// The `context` must be a JSON object.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, JexlError> {
        if !context.is_object() {
            return Err(JexlError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| JexlError::EvalFailed(e.to_string()))
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, JexlError> {
        self.evaluate_value(expression, context)
            .map(|v| value_to_bool(&v))
    }

    /// Evaluate to a number; booleans count as 0/1.
    pub fn evaluate_number(&self, expression: &str, context: &Value) -> Result<f64, JexlError> {
        let result = self.evaluate_value(expression, context)?;
        match &result {
            Value::Number(n) => n.as_f64().ok_or(JexlError::NotNumeric { result: result.clone() }),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            _ => Err(JexlError::NotNumeric { result }),
        }
    }
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
