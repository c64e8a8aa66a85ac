//! Workflow loading: parse, validate, resolve references, order the DAG.
//!
//! Turns workflow source into a `LoadedWorkflow`, the validated form the
//! executor consumes. Loading is a pure transformation; the file helpers
//! only add reading from disk.
//!
//! Validation order:
//! 1. Parse YAML and check structure (ids, types, retry/timeout bounds,
//!    binding syntax) -> `MalformedWorkflow`.
//! 2. Resolve every variable/step reference and `depends_on` entry
//!    -> `UnresolvedReference`.
//! 3. Topologically sort -> `CyclicDependency` naming the cycle.
//! 4. Reject if the sort does not cover every step.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use flowbench_types::workflow::{AggregationStrategy, StepDefinition, StepKind, WorkflowDefinition};
use thiserror::Error;

use super::dag::{execution_waves, DependencyMap, StepGraph};
use super::expression::{RefSource, StepBindings};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that abort loading a single workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Syntax or structural problem in the document.
    #[error("malformed workflow: {0}")]
    MalformedWorkflow(String),

    /// A reference points at a step or variable that does not exist.
    #[error("unresolved reference in step '{step}': {reference}")]
    UnresolvedReference { step: String, reference: String },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", format_cycle(.steps))]
    CyclicDependency { steps: Vec<String> },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_cycle(steps: &[String]) -> String {
    match steps.first() {
        Some(first) => format!("{} -> {first}", steps.join(" -> ")),
        None => "<unknown>".to_string(),
    }
}

// ---------------------------------------------------------------------------
// LoadedWorkflow
// ---------------------------------------------------------------------------

/// A validated workflow with parsed bindings and a topological order.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub definition: WorkflowDefinition,
    /// Parsed input bindings per step.
    pub bindings: BTreeMap<String, StepBindings>,
    /// Step id to the steps it depends on (explicit and implied by bindings).
    pub dependencies: DependencyMap,
    /// Topological order of step ids.
    pub order: Vec<String>,
}

impl LoadedWorkflow {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.definition.step(id)
    }

    /// Steps grouped into waves of mutually independent steps.
    pub fn waves(&self) -> Vec<Vec<String>> {
        execution_waves(&self.order, &self.dependencies)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML workflow document.
pub fn parse_workflow_yaml(yaml: &str) -> Result<LoadedWorkflow, WorkflowError> {
    let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml)
        .map_err(|e| WorkflowError::MalformedWorkflow(e.to_string()))?;
    load_definition(def)
}

/// Validate an already-parsed definition.
pub fn load_definition(def: WorkflowDefinition) -> Result<LoadedWorkflow, WorkflowError> {
    validate_structure(&def)?;

    let mut bindings = BTreeMap::new();
    for step in &def.steps {
        let parsed = StepBindings::parse(&step.inputs).map_err(|e| {
            WorkflowError::MalformedWorkflow(format!("step '{}': {e}", step.id))
        })?;
        bindings.insert(step.id.clone(), parsed);
    }

    let dependencies = resolve_references(&def, &bindings)?;

    let ids: Vec<String> = def.steps.iter().map(|s| s.id.clone()).collect();
    let graph = StepGraph::build(&ids, &dependencies);
    let order = graph
        .topological_order()
        .map_err(|steps| WorkflowError::CyclicDependency { steps })?;
    if order.len() != graph.node_count() {
        return Err(WorkflowError::MalformedWorkflow(format!(
            "topological order covers {} of {} steps",
            order.len(),
            graph.node_count()
        )));
    }

    Ok(LoadedWorkflow {
        definition: def,
        bindings,
        dependencies,
        order,
    })
}

/// Load a workflow from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<LoadedWorkflow, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Structural checks that need no reference resolution.
fn validate_structure(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let malformed = |msg: String| Err(WorkflowError::MalformedWorkflow(msg));

    if !valid_identifier(&def.id) {
        return malformed(format!(
            "workflow id '{}' must be non-empty and use only letters, digits, '-' or '_'",
            def.id
        ));
    }

    if def.steps.is_empty() {
        return malformed("workflow must have at least one step".to_string());
    }

    let mut seen_vars = HashSet::new();
    for var in &def.variables {
        if !valid_identifier(&var.name) {
            return malformed(format!("invalid variable name '{}'", var.name));
        }
        if !seen_vars.insert(var.name.as_str()) {
            return malformed(format!("duplicate variable: '{}'", var.name));
        }
        if let Some(default) = &var.default {
            if !var.value_type.matches(default) {
                return malformed(format!(
                    "default for variable '{}' is not of type {}",
                    var.name, var.value_type
                ));
            }
        }
    }

    let mut seen_steps = HashSet::new();
    for step in &def.steps {
        if !valid_identifier(&step.id) {
            return malformed(format!(
                "step id '{}' must be non-empty and use only letters, digits, '-' or '_'",
                step.id
            ));
        }
        if !seen_steps.insert(step.id.as_str()) {
            return malformed(format!("duplicate step ID: '{}'", step.id));
        }
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return malformed(format!("step '{}': retry.max_attempts must be >= 1", step.id));
            }
        }
        if step.timeout_secs == Some(0) {
            return malformed(format!("step '{}': timeout_secs must be > 0", step.id));
        }
        validate_kind(step)?;
    }

    Ok(())
}

fn validate_kind(step: &StepDefinition) -> Result<(), WorkflowError> {
    let malformed = |msg: &str| Err(WorkflowError::MalformedWorkflow(format!("step '{}': {msg}", step.id)));
    match &step.kind {
        StepKind::ModelCall { .. } => {
            if !step.inputs.contains_key("prompt") {
                return malformed("model_call steps need a 'prompt' input");
            }
        }
        StepKind::ToolCall { tool } => {
            if tool.trim().is_empty() {
                return malformed("tool_call steps need a tool name");
            }
        }
        StepKind::Aggregation { strategy, expr, .. } => {
            if *strategy == AggregationStrategy::Expression
                && expr.as_deref().is_none_or(|e| e.trim().is_empty())
            {
                return malformed("expression aggregation needs 'expr'");
            }
        }
    }
    Ok(())
}

/// Check every reference and build the dependency map.
fn resolve_references(
    def: &WorkflowDefinition,
    bindings: &BTreeMap<String, StepBindings>,
) -> Result<DependencyMap, WorkflowError> {
    let step_ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    let var_names: HashSet<&str> = def.variables.iter().map(|v| v.name.as_str()).collect();

    let mut dependencies = DependencyMap::new();
    for step in &def.steps {
        let mut deps = BTreeSet::new();

        for dep in &step.depends_on {
            if !step_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnresolvedReference {
                    step: step.id.clone(),
                    reference: format!("depends_on names unknown step '{dep}'"),
                });
            }
            deps.insert(dep.clone());
        }

        let step_bindings = bindings.get(&step.id).map(|b| b.references()).unwrap_or_default();
        for reference in step_bindings {
            match &reference.source {
                RefSource::Step(id) => {
                    if !step_ids.contains(id.as_str()) {
                        return Err(WorkflowError::UnresolvedReference {
                            step: step.id.clone(),
                            reference: format!("'{}' names unknown step '{id}'", reference.raw()),
                        });
                    }
                    deps.insert(id.clone());
                }
                RefSource::Variable(name) => {
                    if !var_names.contains(name.as_str()) {
                        return Err(WorkflowError::UnresolvedReference {
                            step: step.id.clone(),
                            reference: format!(
                                "'{}' names undeclared variable '{name}'",
                                reference.raw()
                            ),
                        });
                    }
                }
            }
        }

        dependencies.insert(step.id.clone(), deps);
    }
    Ok(dependencies)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Recursively load every `.yaml`/`.yml` workflow under `base_dir`.
///
/// Files that fail to load are skipped with a warning.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, LoadedWorkflow)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, LoadedWorkflow)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(workflow) => results.push((path, workflow)),
                Err(error) => {
                    tracing::warn!(?path, %error, "skipping invalid workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
