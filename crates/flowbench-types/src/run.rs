//! Execution records: `WorkflowRun` and its `StepRun`s.
//!
//! A `WorkflowRun` exclusively owns one `StepRun` per step. Step lifecycle
//! rules are enforced by the state machine in `flowbench-core`; these types
//! only record the outcome.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

/// Lifecycle state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Ready => "ready",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Retrying => "retrying",
            StepState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    pub from: StepState,
    pub to: StepState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step errors
// ---------------------------------------------------------------------------

/// Terminal error kinds recorded on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// A binding referenced a step or field that is not available.
    UnresolvedInput,
    /// Inputs or output did not match the declared schema.
    ContractViolation,
    /// A model adapter failed.
    AdapterError,
    /// Every adapter of the model was tried and failed.
    AllAdaptersExhausted,
    /// The attempt exceeded the step timeout.
    Timeout,
    /// A tool invocation failed.
    ToolError,
    /// An aggregation could not combine its inputs.
    AggregationError,
    /// The step was cancelled (upstream failure or external signal).
    Cancelled,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepErrorKind::UnresolvedInput => "UnresolvedInput",
            StepErrorKind::ContractViolation => "ContractViolation",
            StepErrorKind::AdapterError => "AdapterError",
            StepErrorKind::AllAdaptersExhausted => "AllAdaptersExhausted",
            StepErrorKind::Timeout => "Timeout",
            StepErrorKind::ToolError => "ToolError",
            StepErrorKind::AggregationError => "AggregationError",
            StepErrorKind::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// Error recorded on a `StepRun`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: StepErrorKind,
    pub message: String,
    /// Whether another attempt could succeed.
    pub retryable: bool,
    /// Offending field path, for contract violations and missing inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl StepFailure {
    pub fn new(kind: StepErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} at {}: {}", self.kind, path, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRun
// ---------------------------------------------------------------------------

/// A step instance within one `WorkflowRun`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step_id: String,
    pub state: StepState,
    /// Current attempt number (0 before the first attempt starts).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Whether dependents tolerate this step failing.
    #[serde(default)]
    pub optional: bool,
    /// Inputs as resolved for the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    /// Raw output of the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Adapter that served the final model call, for model-call steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<StepTransition>,
}

impl StepRun {
    pub fn new(step_id: impl Into<String>, max_attempts: u32, optional: bool) -> Self {
        Self {
            step_id: step_id.into(),
            state: StepState::Pending,
            attempt: 0,
            max_attempts,
            optional,
            inputs: None,
            output: None,
            error: None,
            adapter: None,
            started_at: None,
            ended_at: None,
            transitions: Vec::new(),
        }
    }

    /// Whether the step has reached a state it can never leave.
    ///
    /// `Failed` counts as terminal once no retry remains or the failure is
    /// not retryable.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            StepState::Succeeded | StepState::Cancelled => true,
            StepState::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// Whether a `Failed` step may move to `Retrying`.
    pub fn can_retry(&self) -> bool {
        self.state == StepState::Failed
            && self.attempt < self.max_attempts
            && self.error.as_ref().is_some_and(|e| e.retryable)
    }

    /// Wall-clock duration between first start and end, if both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }

    /// Number of `Failed -> Retrying` transitions taken.
    pub fn retries(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.from == StepState::Failed && t.to == StepState::Retrying)
            .count()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7, time-sortable.
    pub id: Uuid,
    pub workflow_id: String,
    /// Logical model the run was executed with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Resolved variable values.
    pub variables: serde_json::Map<String, Value>,
    pub steps: BTreeMap<String, StepRun>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: impl Into<String>,
        model: Option<String>,
        variables: serde_json::Map<String, Value>,
        steps: BTreeMap<String, StepRun>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            model,
            variables,
            steps,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Whether every step has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.steps.values().all(StepRun::is_terminal)
    }

    /// Status implied by the step states: `Succeeded` iff every
    /// non-optional step succeeded.
    pub fn derive_status(&self) -> RunStatus {
        let all_required_succeeded = self
            .steps
            .values()
            .filter(|s| !s.optional)
            .all(|s| s.state == StepState::Succeeded);
        if all_required_succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    /// Steps that ended `Failed`, in step-id order.
    pub fn failing_steps(&self) -> Vec<&StepRun> {
        self.steps
            .values()
            .filter(|s| s.state == StepState::Failed)
            .collect()
    }

    /// Output of a step, if it succeeded.
    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.steps
            .get(step_id)
            .filter(|s| s.state == StepState::Succeeded)
            .and_then(|s| s.output.as_ref())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.created_at).num_milliseconds().max(0) as u64)
    }

    /// Human-facing summary naming every failing step and its error kind.
    pub fn report(&self) -> RunReport {
        let failing = self
            .failing_steps()
            .into_iter()
            .map(|s| FailingStep {
                step_id: s.step_id.clone(),
                kind: s.error.as_ref().map(|e| e.kind),
                message: s
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
                attempts: s.attempt,
                optional: s.optional,
            })
            .collect();
        let cancelled = self
            .steps
            .values()
            .filter(|s| s.state == StepState::Cancelled)
            .map(|s| s.step_id.clone())
            .collect();
        RunReport {
            run_id: self.id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            failing,
            cancelled,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    pub failing: Vec<FailingStep>,
    pub cancelled: Vec<String>,
}

/// A failed step as shown in a `RunReport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingStep {
    pub step_id: String,
    pub kind: Option<StepErrorKind>,
    pub message: String,
    pub attempts: u32,
    pub optional: bool,
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "run {} of '{}': {}",
            self.run_id, self.workflow_id, self.status
        )?;
        for step in &self.failing {
            let kind = step
                .kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let optional = if step.optional { " (optional)" } else { "" };
            writeln!(
                f,
                "  step '{}'{optional} failed after {} attempt(s): {kind}: {}",
                step.step_id, step.attempts, step.message
            )?;
        }
        if !self.cancelled.is_empty() {
            writeln!(f, "  cancelled: {}", self.cancelled.join(", "))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
