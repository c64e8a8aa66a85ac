//! Input binding evaluator.
//!
//! Step inputs are JSON values whose strings may embed `{{ ... }}`
//! references:
//!
//! - `{{ variables.topic }}` (alias `vars.topic`) reads a workflow variable;
//! - `{{ steps.draft.output.text }}` reads a field of an upstream output,
//!   with `[0]` and `["key"]` indexing;
//! - `{{ steps.review.output.score | default(0) }}` substitutes a JSON
//!   literal when the upstream is absent or the field is missing.
//!
//! A string that is exactly one reference keeps the referenced value's type.
//! Any other string with references is templated into a string. Bindings
//! are parsed once when the workflow loads; resolution is a pure function of
//! the run snapshot.

use std::collections::BTreeMap;

use flowbench_types::run::{StepRun, StepState};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or resolving bindings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("invalid reference '{reference}': {message}")]
    Syntax { reference: String, message: String },

    #[error("unresolved input '{reference}': {reason}")]
    UnresolvedInput { reference: String, reason: String },
}

// ---------------------------------------------------------------------------
// Parsed forms
// ---------------------------------------------------------------------------

/// Where a reference points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefSource {
    Variable(String),
    Step(String),
}

/// One step of a path into a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A parsed `{{ ... }}` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub source: RefSource,
    pub path: Vec<PathSegment>,
    pub default: Option<Value>,
    raw: String,
}

impl Reference {
    /// The reference text as written, without braces.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// A piece of a templated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// A parsed input binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Literal(Value),
    /// The whole string is one reference; the value keeps its type.
    Reference(Reference),
    /// Text with embedded references; always yields a string.
    Template(Vec<Segment>),
    Object(Vec<(String, Binding)>),
    Array(Vec<Binding>),
}

impl Binding {
    /// Parse a raw input value.
    pub fn parse(raw: &Value) -> Result<Self, ExpressionError> {
        match raw {
            Value::String(s) => parse_string(s),
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, value) in map {
                    fields.push((key.clone(), Binding::parse(value)?));
                }
                Ok(Binding::Object(fields))
            }
            Value::Array(items) => items
                .iter()
                .map(Binding::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(Binding::Array),
            other => Ok(Binding::Literal(other.clone())),
        }
    }

    /// Every reference in this binding, in document order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Binding::Literal(_) => {}
            Binding::Reference(r) => out.push(r),
            Binding::Template(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        out.push(r);
                    }
                }
            }
            Binding::Object(fields) => {
                for (_, b) in fields {
                    b.collect_references(out);
                }
            }
            Binding::Array(items) => {
                for b in items {
                    b.collect_references(out);
                }
            }
        }
    }

    /// Resolve against a run snapshot.
    pub fn resolve(&self, snapshot: &RunSnapshot<'_>) -> Result<Value, ExpressionError> {
        match self {
            Binding::Literal(v) => Ok(v.clone()),
            Binding::Reference(r) => snapshot.lookup(r),
            Binding::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(r) => out.push_str(&value_to_string(&snapshot.lookup(r)?)),
                    }
                }
                Ok(Value::String(out))
            }
            Binding::Object(fields) => {
                let mut map = Map::new();
                for (key, b) in fields {
                    map.insert(key.clone(), b.resolve(snapshot)?);
                }
                Ok(Value::Object(map))
            }
            Binding::Array(items) => items
                .iter()
                .map(|b| b.resolve(snapshot))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

/// Parsed bindings of one step, keyed by input name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepBindings {
    pub inputs: BTreeMap<String, Binding>,
}

impl StepBindings {
    pub fn parse(inputs: &BTreeMap<String, Value>) -> Result<Self, ExpressionError> {
        let mut parsed = BTreeMap::new();
        for (name, raw) in inputs {
            parsed.insert(name.clone(), Binding::parse(raw)?);
        }
        Ok(Self { inputs: parsed })
    }

    pub fn references(&self) -> Vec<&Reference> {
        self.inputs.values().flat_map(Binding::references).collect()
    }

    /// Resolve every input into one object.
    pub fn resolve(&self, snapshot: &RunSnapshot<'_>) -> Result<Value, ExpressionError> {
        let mut map = Map::new();
        for (name, binding) in &self.inputs {
            map.insert(name.clone(), binding.resolve(snapshot)?);
        }
        Ok(Value::Object(map))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

static NULL: Value = Value::Null;

/// Read-only view of a run used for resolution.
pub struct RunSnapshot<'a> {
    variables: &'a Map<String, Value>,
    steps: &'a BTreeMap<String, StepRun>,
}

impl<'a> RunSnapshot<'a> {
    pub fn new(variables: &'a Map<String, Value>, steps: &'a BTreeMap<String, StepRun>) -> Self {
        Self { variables, steps }
    }

    fn lookup(&self, reference: &Reference) -> Result<Value, ExpressionError> {
        let unresolved = |reason: String| ExpressionError::UnresolvedInput {
            reference: reference.raw.clone(),
            reason,
        };

        let root = match &reference.source {
            RefSource::Variable(name) => match self.variables.get(name) {
                Some(v) => v,
                None => {
                    return reference
                        .default
                        .clone()
                        .ok_or_else(|| unresolved(format!("variable '{name}' has no value")));
                }
            },
            RefSource::Step(id) => {
                let step = self
                    .steps
                    .get(id)
                    .ok_or_else(|| unresolved(format!("step '{id}' does not exist")))?;
                match (step.state, step.output.as_ref()) {
                    (StepState::Succeeded, Some(output)) => output,
                    (StepState::Succeeded, None) => &NULL,
                    _ if step.optional && step.is_terminal() => {
                        return reference.default.clone().ok_or_else(|| {
                            unresolved(format!(
                                "optional step '{id}' ended {} without output",
                                step.state
                            ))
                        });
                    }
                    _ => {
                        return Err(unresolved(format!(
                            "step '{id}' has not succeeded (state: {})",
                            step.state
                        )));
                    }
                }
            }
        };

        match walk(root, &reference.path) {
            Ok(v) => Ok(v.clone()),
            Err(missing) => reference
                .default
                .clone()
                .ok_or_else(|| unresolved(format!("no value at {missing}"))),
        }
    }
}

/// Follow `path` into `value`; on failure return the path prefix that
/// could not be read.
fn walk<'v>(value: &'v Value, path: &[PathSegment]) -> Result<&'v Value, String> {
    let mut current = value;
    let mut walked = String::new();
    for segment in path {
        let next = match segment {
            PathSegment::Field(name) => {
                walked.push('.');
                walked.push_str(name);
                current.get(name.as_str())
            }
            PathSegment::Index(i) => {
                walked.push_str(&format!("[{i}]"));
                current.get(*i)
            }
        };
        current = next.ok_or_else(|| walked.trim_start_matches('.').to_string())?;
    }
    Ok(current)
}

/// Render a value for string templating.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_string(s: &str) -> Result<Binding, ExpressionError> {
    if !s.contains("{{") {
        return Ok(Binding::Literal(Value::String(s.to_string())));
    }

    let mut segments = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| ExpressionError::Syntax {
            reference: s.to_string(),
            message: "unclosed '{{'".to_string(),
        })?;
        segments.push(Segment::Ref(parse_reference(after[..end].trim())?));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }

    match segments.as_slice() {
        [Segment::Ref(r)] => Ok(Binding::Reference(r.clone())),
        _ => Ok(Binding::Template(segments)),
    }
}

/// Parse the inside of `{{ ... }}`.
pub fn parse_reference(text: &str) -> Result<Reference, ExpressionError> {
    let syntax = |message: &str| ExpressionError::Syntax {
        reference: text.to_string(),
        message: message.to_string(),
    };

    let (path_text, default) = match split_filter(text) {
        Some((path, filter)) => (path, Some(parse_default(filter).map_err(|m| syntax(&m))?)),
        None => (text, None),
    };

    let mut segments = parse_path(path_text.trim()).map_err(|m| syntax(&m))?.into_iter();
    let source = match segments.next() {
        Some(PathSegment::Field(root)) if root == "variables" || root == "vars" => {
            match segments.next() {
                Some(PathSegment::Field(name)) => RefSource::Variable(name),
                _ => return Err(syntax("expected a variable name after 'variables.'")),
            }
        }
        Some(PathSegment::Field(root)) if root == "steps" => {
            let id = match segments.next() {
                Some(PathSegment::Field(id)) => id,
                _ => return Err(syntax("expected a step id after 'steps.'")),
            };
            match segments.next() {
                Some(PathSegment::Field(f)) if f == "output" => RefSource::Step(id),
                _ => return Err(syntax("step references must read '.output'")),
            }
        }
        _ => return Err(syntax("references must start with 'variables.' or 'steps.'")),
    };

    Ok(Reference {
        source,
        path: segments.collect(),
        default,
        raw: text.to_string(),
    })
}

/// Split `path | filter` at the first `|` outside brackets and quotes.
fn split_filter(text: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '|') if depth == 0 => return Some((&text[..i], &text[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_default(filter: &str) -> Result<Value, String> {
    let filter = filter.trim();
    let arg = filter
        .strip_prefix("default")
        .map(str::trim_start)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| format!("unsupported filter '{filter}' (expected default(<json>))"))?;
    let arg = arg.trim();
    // Single-quoted strings are accepted as a convenience inside YAML.
    if let Some(inner) = arg.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(Value::String(inner.to_string()));
    }
    serde_json::from_str(arg).map_err(|e| format!("invalid default value '{arg}': {e}"))
}

fn parse_path(text: &str) -> Result<Vec<PathSegment>, String> {
    let mut segments = Vec::new();
    let mut chars = text.chars();
    let mut ident = String::new();
    let mut after_bracket = false;

    let flush = |ident: &mut String, segments: &mut Vec<PathSegment>| {
        if !ident.is_empty() {
            segments.push(PathSegment::Field(std::mem::take(ident)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if ident.is_empty() && !after_bracket {
                    return Err("empty path segment".to_string());
                }
                flush(&mut ident, &mut segments);
                after_bracket = false;
            }
            '[' => {
                flush(&mut ident, &mut segments);
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err("unclosed '['".to_string());
                }
                let inner = inner.trim();
                let quoted = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
                match quoted {
                    Some(key) => segments.push(PathSegment::Field(key.to_string())),
                    None => {
                        let index = inner
                            .parse::<usize>()
                            .map_err(|_| format!("invalid index '{inner}'"))?;
                        segments.push(PathSegment::Index(index));
                    }
                }
                after_bracket = true;
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => {
                if after_bracket {
                    return Err("expected '.' or '[' after ']'".to_string());
                }
                ident.push(c);
            }
            c => return Err(format!("unexpected character '{c}'")),
        }
    }
    if text.ends_with('.') {
        return Err("empty path segment".to_string());
    }
    flush(&mut ident, &mut segments);

    if segments.is_empty() {
        return Err("empty reference".to_string());
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowbench_types::run::{StepFailure, StepErrorKind};
    use serde_json::json;

    fn succeeded(id: &str, output: Value) -> (String, StepRun) {
        let mut step = StepRun::new(id, 1, false);
        step.state = StepState::Succeeded;
        step.output = Some(output);
        (id.to_string(), step)
    }

    fn failed(id: &str, optional: bool) -> (String, StepRun) {
        let mut step = StepRun::new(id, 1, optional);
        step.state = StepState::Failed;
        step.attempt = 1;
        step.error = Some(StepFailure::new(StepErrorKind::AdapterError, "down", true));
        (id.to_string(), step)
    }

    fn vars() -> Map<String, Value> {
        json!({ "topic": "rust", "limits": { "max": 3 } })
            .as_object()
            .cloned()
            .unwrap()
    }

    fn resolve(raw: Value, steps: &BTreeMap<String, StepRun>) -> Result<Value, ExpressionError> {
        let variables = vars();
        let binding = Binding::parse(&raw).unwrap();
        binding.resolve(&RunSnapshot::new(&variables, steps))
    }

    #[test]
    fn test_literal_pass_through() {
        let steps = BTreeMap::new();
        assert_eq!(resolve(json!(42), &steps).unwrap(), json!(42));
        assert_eq!(resolve(json!("plain"), &steps).unwrap(), json!("plain"));
        assert_eq!(resolve(json!(null), &steps).unwrap(), json!(null));
    }

    #[test]
    fn test_variable_lookup_keeps_type() {
        let steps = BTreeMap::new();
        assert_eq!(
            resolve(json!("{{ variables.limits }}"), &steps).unwrap(),
            json!({ "max": 3 })
        );
        assert_eq!(
            resolve(json!("{{vars.limits.max}}"), &steps).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn test_dotted_field_access_into_step_output() {
        let steps = BTreeMap::from([succeeded(
            "a",
            json!({ "text": "hello", "items": [{ "score": 0.5 }, { "score": 0.9 }] }),
        )]);
        assert_eq!(
            resolve(json!("{{ steps.a.output.text }}"), &steps).unwrap(),
            json!("hello")
        );
        assert_eq!(
            resolve(json!("{{ steps.a.output.items[1].score }}"), &steps).unwrap(),
            json!(0.9)
        );
        assert_eq!(
            resolve(json!("{{ steps.a.output[\"text\"] }}"), &steps).unwrap(),
            json!("hello")
        );
    }

    #[test]
    fn test_string_templating() {
        let steps = BTreeMap::from([succeeded("a", json!({ "n": 2, "tags": ["x"] }))]);
        assert_eq!(
            resolve(
                json!("About {{ variables.topic }}: n={{ steps.a.output.n }} {{ steps.a.output.tags }}"),
                &steps
            )
            .unwrap(),
            json!("About rust: n=2 [\"x\"]")
        );
    }

    #[test]
    fn test_nested_object_and_array_bindings() {
        let steps = BTreeMap::from([succeeded("a", json!({ "text": "t" }))]);
        let out = resolve(
            json!({ "list": ["{{ steps.a.output.text }}", 1], "fixed": true }),
            &steps,
        )
        .unwrap();
        assert_eq!(out, json!({ "list": ["t", 1], "fixed": true }));
    }

    #[test]
    fn test_unfinished_step_is_unresolved() {
        let steps = BTreeMap::from([("a".to_string(), StepRun::new("a", 1, false))]);
        let err = resolve(json!("{{ steps.a.output.text }}"), &steps).unwrap_err();
        match err {
            ExpressionError::UnresolvedInput { reason, .. } => {
                assert!(reason.contains("has not succeeded"));
            }
            other => panic!("expected UnresolvedInput, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_mandatory_step_ignores_default() {
        let steps = BTreeMap::from([failed("a", false)]);
        let err = resolve(json!("{{ steps.a.output.text | default(\"x\") }}"), &steps);
        assert!(matches!(err, Err(ExpressionError::UnresolvedInput { .. })));
    }

    #[test]
    fn test_absent_optional_step_uses_default() {
        let steps = BTreeMap::from([failed("a", true)]);
        assert_eq!(
            resolve(json!("{{ steps.a.output.score | default(0) }}"), &steps).unwrap(),
            json!(0)
        );
        assert_eq!(
            resolve(json!("score={{ steps.a.output.score | default('n/a') }}"), &steps).unwrap(),
            json!("score=n/a")
        );
        assert!(resolve(json!("{{ steps.a.output.score }}"), &steps).is_err());
    }

    #[test]
    fn test_missing_field_and_out_of_range_index() {
        let steps = BTreeMap::from([succeeded("a", json!({ "items": [1] }))]);
        let err = resolve(json!("{{ steps.a.output.items[3] }}"), &steps).unwrap_err();
        match err {
            ExpressionError::UnresolvedInput { reason, .. } => {
                assert!(reason.contains("items[3]"), "reason: {reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            resolve(json!("{{ steps.a.output.missing | default(null) }}"), &steps).unwrap(),
            json!(null)
        );
    }

    #[test]
    fn test_references_are_collected() {
        let binding = Binding::parse(&json!({
            "a": "{{ steps.x.output }} and {{ variables.topic }}",
            "b": ["{{ steps.y.output.z }}"]
        }))
        .unwrap();
        let sources: Vec<_> = binding.references().into_iter().map(|r| r.source.clone()).collect();
        assert_eq!(
            sources,
            vec![
                RefSource::Step("x".into()),
                RefSource::Variable("topic".into()),
                RefSource::Step("y".into()),
            ]
        );
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "{{ steps.a.output",
            "{{ steps.a }}",
            "{{ trigger.x }}",
            "{{ steps.a.output..x }}",
            "{{ steps.a.output[x] }}",
            "{{ variables.a | upper }}",
            "{{ variables.a | default(nope) }}",
        ] {
            assert!(
                matches!(Binding::parse(&json!(bad)), Err(ExpressionError::Syntax { .. })),
                "expected syntax error for {bad}"
            );
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let steps = BTreeMap::from([succeeded("a", json!({ "text": "t" }))]);
        let raw = json!({ "p": "{{ steps.a.output.text }}-{{ variables.topic }}" });
        let first = resolve(raw.clone(), &steps).unwrap();
        let second = resolve(raw, &steps).unwrap();
        assert_eq!(first, second);
    }
}
