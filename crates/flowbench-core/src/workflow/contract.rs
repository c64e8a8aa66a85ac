//! Structural contract checks for step inputs and outputs.
//!
//! A `Schema` lists the fields a value must (or may) carry and their types.
//! Validation walks nested objects and array items and reports the first
//! offending field path. An empty schema accepts any value.

use flowbench_types::workflow::{FieldSpec, Schema, ValueType};
use serde_json::Value;

/// A value that does not match its declared schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("contract violation at {path}: {message}")]
pub struct ContractViolation {
    /// Offending field path, e.g. `output.items[2].score`.
    pub path: String,
    pub message: String,
}

impl ContractViolation {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Check `value` against `schema`. `root` prefixes reported paths
/// (e.g. "output" or "inputs").
pub fn validate(schema: &Schema, value: &Value, root: &str) -> Result<(), ContractViolation> {
    if schema.is_empty() {
        return Ok(());
    }
    let Some(object) = value.as_object() else {
        return Err(ContractViolation::new(
            root,
            format!("expected object, got {}", describe(value)),
        ));
    };
    validate_fields(schema, object, root)
}

fn validate_fields(
    schema: &Schema,
    object: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<(), ContractViolation> {
    for (name, spec) in schema {
        let field_path = format!("{path}.{name}");
        match object.get(name) {
            None | Some(Value::Null) if spec.required => {
                return Err(ContractViolation::new(&field_path, "required field is missing"));
            }
            None | Some(Value::Null) => {}
            Some(v) => validate_field(spec, v, &field_path)?,
        }
    }
    Ok(())
}

fn validate_field(spec: &FieldSpec, value: &Value, path: &str) -> Result<(), ContractViolation> {
    if !spec.field_type.matches(value) {
        return Err(ContractViolation::new(
            path,
            format!("expected {}, got {}", spec.field_type, describe(value)),
        ));
    }

    if !spec.fields.is_empty() {
        match value.as_object() {
            Some(object) => validate_fields(&spec.fields, object, path)?,
            None => {
                return Err(ContractViolation::new(
                    path,
                    format!("expected object with fields, got {}", describe(value)),
                ));
            }
        }
    }

    if let (Some(item_spec), Some(items)) = (&spec.items, value.as_array()) {
        for (i, item) in items.iter().enumerate() {
            validate_field(item_spec, item, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        other => ValueType::of(other).to_string(),
    }
}
