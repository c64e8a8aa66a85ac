//! Concurrent DAG executor.
//!
//! The executor owns the run's `StepRun` map and drives it with a frontier
//! loop:
//!
//! 1. promote `Pending` steps whose dependencies are terminal: resolve their
//!    inputs and move them to `Ready`, or cancel them when a required
//!    dependency did not succeed;
//! 2. dispatch `Ready` steps in topological order onto a `JoinSet`, up to the
//!    concurrency limit;
//! 3. wait for the next task completion (an attempt result or an elapsed
//!    retry backoff) or for cancellation, apply it, and loop.
//!
//! Step I/O only ever happens inside spawned tasks. The loop itself never
//! awaits a single step.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use flowbench_types::config::EngineSettings;
use flowbench_types::event::EngineEvent;
use flowbench_types::run::{RunStatus, StepErrorKind, StepFailure, StepRun, StepState, StepTransition, WorkflowRun};
use flowbench_types::workflow::{StepKind, ValueType, WorkflowDefinition};

use super::contract;
use super::expression::RunSnapshot;
use super::loader::LoadedWorkflow;
use super::state::{self, StateError};
use super::step_runner::{StepDispatcher, StepOutcome, StepRequest};
use crate::event::bus::EventBus;

// ---------------------------------------------------------------------------
// Options and errors
// ---------------------------------------------------------------------------

/// Per-run execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Maximum steps running at once (at least 1).
    pub concurrency: usize,
    /// Timeout for steps without `timeout_secs`.
    pub default_step_timeout: Duration,
    /// Model for model-call steps that do not name one.
    pub default_model: Option<String>,
    /// Model forced onto every model-call step (benchmark sweeps).
    pub model_override: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl RunOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            concurrency: settings.max_concurrency,
            default_step_timeout: Duration::from_secs(settings.default_step_timeout_secs),
            default_model: settings.default_model.clone(),
            model_override: None,
        }
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Model a step runs against: override, then the step's own, then the
    /// default.
    fn model_for(&self, kind: &StepKind) -> Option<String> {
        let StepKind::ModelCall { model, .. } = kind else {
            return None;
        };
        self.model_override
            .clone()
            .or_else(|| model.clone())
            .or_else(|| self.default_model.clone())
    }

    /// The model recorded on the run.
    fn run_model(&self) -> Option<String> {
        self.model_override
            .clone()
            .or_else(|| self.default_model.clone())
    }
}

/// Errors that prevent a run from starting.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid variables: {}", .0.join("; "))]
    InvalidVariables(Vec<String>),

    #[error("step '{step}' is a model call but no model is configured (use --model or set a default)")]
    MissingModel { step: String },

    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// Task plumbing
// ---------------------------------------------------------------------------

/// What a spawned task reports back to the loop.
enum TaskEvent {
    Attempt {
        step_id: String,
        result: Result<StepOutcome, StepFailure>,
    },
    BackoffElapsed {
        step_id: String,
    },
}

/// What to do with a `Pending` step this round.
enum Promotion {
    Wait,
    Ready(Value),
    Fail(StepFailure),
    Cancel(StepFailure),
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Executes loaded workflows. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct DagExecutor {
    dispatcher: Arc<StepDispatcher>,
    events: EventBus,
}

impl DagExecutor {
    pub fn new(dispatcher: Arc<StepDispatcher>) -> Self {
        Self {
            dispatcher,
            events: EventBus::default(),
        }
    }

    /// Publish lifecycle events on `events` instead of a private bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Execute `workflow` to completion or cancellation.
    ///
    /// Step failures never surface as `Err`; they are recorded on the
    /// returned run. `Err` means the run could not start.
    pub async fn execute(
        &self,
        workflow: &LoadedWorkflow,
        variables: Map<String, Value>,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun, ExecutorError> {
        let definition = &workflow.definition;
        let variables = bind_variables(definition, variables)?;

        let mut models: BTreeMap<String, Option<String>> = BTreeMap::new();
        for step in &definition.steps {
            let model = options.model_for(&step.kind);
            if matches!(step.kind, StepKind::ModelCall { .. }) && model.is_none() {
                return Err(ExecutorError::MissingModel {
                    step: step.id.clone(),
                });
            }
            models.insert(step.id.clone(), model);
        }

        let steps = definition
            .steps
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    StepRun::new(s.id.clone(), s.retry_policy().max_attempts, s.optional),
                )
            })
            .collect();
        let mut run = WorkflowRun::new(definition.id.clone(), options.run_model(), variables, steps);
        run.status = RunStatus::Running;

        tracing::info!(
            run_id = %run.id,
            workflow_id = %run.workflow_id,
            model = ?run.model,
            steps = run.steps.len(),
            "Workflow run started"
        );
        self.events.publish(EngineEvent::RunStarted {
            run_id: run.id,
            workflow_id: run.workflow_id.clone(),
            model: run.model.clone(),
            step_count: run.steps.len(),
        });

        let concurrency = options.concurrency.max(1);
        let token = cancel.child_token();
        let mut tasks: JoinSet<TaskEvent> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut cancelled = false;

        loop {
            self.promote_pending(workflow, &mut run)?;

            for id in &workflow.order {
                if in_flight >= concurrency {
                    break;
                }
                let Some(step_def) = definition.step(id) else {
                    continue;
                };
                let Some(step) = run.steps.get_mut(id).filter(|s| s.state == StepState::Ready) else {
                    continue;
                };
                let record = state::start(step)?;
                let request = StepRequest {
                    run_id: run.id,
                    step: step_def.clone(),
                    inputs: step.inputs.clone().unwrap_or_else(|| Value::Object(Map::new())),
                    model: models.get(id).cloned().flatten(),
                    attempt: step.attempt,
                };
                self.publish_transition(run.id, id, &record);
                tracing::debug!(run_id = %run.id, step_id = %id, attempt = request.attempt, "Dispatching step");

                let timeout = step_def
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(options.default_step_timeout);
                tasks.spawn(run_attempt(
                    self.dispatcher.clone(),
                    request,
                    timeout,
                    token.clone(),
                ));
                in_flight += 1;
            }

            if run.is_complete() {
                break;
            }
            if tasks.is_empty() {
                // Nothing can make progress; close out whatever is left.
                tracing::warn!(run_id = %run.id, "No runnable steps remain");
                self.cancel_remaining(&mut run, "no runnable path to this step")?;
                break;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tasks.abort_all();
                    cancelled = true;
                    tracing::warn!(run_id = %run.id, "Workflow run cancelled");
                    self.cancel_remaining(&mut run, "run cancelled")?;
                    break;
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(TaskEvent::Attempt { step_id, result })) => {
                            in_flight = in_flight.saturating_sub(1);
                            self.finish_attempt(workflow, &mut run, &step_id, result, &mut tasks)?;
                        }
                        Some(Ok(TaskEvent::BackoffElapsed { step_id })) => {
                            let Some(step) = run.steps.get_mut(&step_id) else {
                                continue;
                            };
                            let inputs = step.inputs.clone().unwrap_or_else(|| Value::Object(Map::new()));
                            let record = state::mark_ready(step, inputs)?;
                            self.publish_transition(run.id, &step_id, &record);
                        }
                        Some(Err(join_err)) => {
                            tracing::error!(run_id = %run.id, error = %join_err, "Step task ended abnormally");
                        }
                        None => {}
                    }
                }
            }
        }

        run.status = if cancelled {
            RunStatus::Cancelled
        } else {
            run.derive_status()
        };
        run.ended_at = Some(Utc::now());

        let duration_ms = run.duration_ms().unwrap_or(0);
        tracing::info!(
            run_id = %run.id,
            workflow_id = %run.workflow_id,
            status = %run.status,
            duration_ms,
            "Workflow run finished"
        );
        self.events.publish(EngineEvent::RunCompleted {
            run_id: run.id,
            workflow_id: run.workflow_id.clone(),
            status: run.status,
            duration_ms,
        });

        Ok(run)
    }

    /// Move `Pending` steps forward, in topological order so cancellations
    /// cascade through the whole downstream subgraph in one pass.
    fn promote_pending(&self, workflow: &LoadedWorkflow, run: &mut WorkflowRun) -> Result<(), ExecutorError> {
        for id in &workflow.order {
            if run.steps.get(id).is_none_or(|s| s.state != StepState::Pending) {
                continue;
            }
            let promotion = {
                let mut promotion = None;
                for dep in workflow.dependencies.get(id).into_iter().flatten() {
                    let Some(upstream) = run.steps.get(dep) else {
                        continue;
                    };
                    if !upstream.is_terminal() {
                        promotion = Some(Promotion::Wait);
                        break;
                    }
                    if upstream.state != StepState::Succeeded && !upstream.optional {
                        promotion = Some(Promotion::Cancel(StepFailure::new(
                            StepErrorKind::Cancelled,
                            format!("dependency '{dep}' {}", upstream.state),
                            false,
                        )));
                        break;
                    }
                }
                match promotion {
                    Some(p) => p,
                    None => {
                        let snapshot = RunSnapshot::new(&run.variables, &run.steps);
                        let bindings = workflow.bindings.get(id);
                        match bindings.map(|b| b.resolve(&snapshot)) {
                            Some(Ok(inputs)) => Promotion::Ready(inputs),
                            None => Promotion::Ready(Value::Object(Map::new())),
                            Some(Err(err)) => Promotion::Fail(StepFailure::new(
                                StepErrorKind::UnresolvedInput,
                                err.to_string(),
                                false,
                            )),
                        }
                    }
                }
            };

            let run_id = run.id;
            let Some(step) = run.steps.get_mut(id) else {
                continue;
            };
            let record = match promotion {
                Promotion::Wait => continue,
                Promotion::Ready(inputs) => state::mark_ready(step, inputs)?,
                Promotion::Fail(failure) => {
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %id,
                        error = %failure,
                        "Step inputs could not be resolved"
                    );
                    state::reject(step, failure)?
                }
                Promotion::Cancel(reason) => {
                    tracing::info!(
                        run_id = %run_id,
                        step_id = %id,
                        reason = %reason,
                        "Step cancelled before running"
                    );
                    state::cancel(step, Some(reason))?
                }
            };
            self.publish_transition(run_id, id, &record);
        }
        Ok(())
    }

    /// Apply an attempt result: success, retry with backoff, or terminal
    /// failure.
    fn finish_attempt(
        &self,
        workflow: &LoadedWorkflow,
        run: &mut WorkflowRun,
        step_id: &str,
        result: Result<StepOutcome, StepFailure>,
        tasks: &mut JoinSet<TaskEvent>,
    ) -> Result<(), ExecutorError> {
        let run_id = run.id;
        let Some(step) = run.steps.get_mut(step_id) else {
            return Ok(());
        };
        match result {
            Ok(outcome) => {
                step.adapter = outcome.adapter;
                let record = state::succeed(step, outcome.output)?;
                tracing::info!(
                    run_id = %run_id,
                    step_id,
                    attempt = step.attempt,
                    adapter = ?step.adapter,
                    "Step succeeded"
                );
                self.publish_transition(run_id, step_id, &record);
            }
            Err(failure) => {
                let record = state::fail(step, failure)?;
                self.publish_transition(run_id, step_id, &record);

                if step.can_retry() {
                    let delay = workflow
                        .step(step_id)
                        .map(|d| d.retry_policy().delay_for(step.attempt))
                        .unwrap_or_default();
                    tracing::warn!(
                        run_id = %run_id,
                        step_id,
                        attempt = step.attempt,
                        max_attempts = step.max_attempts,
                        error = ?step.error.as_ref().map(ToString::to_string),
                        delay_ms = delay.as_millis() as u64,
                        "Step failed, retrying"
                    );
                    let record = state::retry(step)?;
                    self.publish_transition(run_id, step_id, &record);

                    let step_id = step_id.to_string();
                    tasks.spawn(async move {
                        tokio::time::sleep(delay).await;
                        TaskEvent::BackoffElapsed { step_id }
                    });
                } else {
                    tracing::warn!(
                        run_id = %run_id,
                        step_id,
                        attempts = step.attempt,
                        optional = step.optional,
                        error = ?step.error.as_ref().map(ToString::to_string),
                        "Step failed"
                    );
                }
            }
        }
        Ok(())
    }

    fn cancel_remaining(&self, run: &mut WorkflowRun, reason: &str) -> Result<(), ExecutorError> {
        let run_id = run.id;
        for step in run.steps.values_mut() {
            if step.is_terminal() {
                continue;
            }
            let failure = StepFailure::new(StepErrorKind::Cancelled, reason, false);
            let record = state::cancel(step, Some(failure))?;
            self.publish_transition(run_id, &step.step_id, &record);
        }
        Ok(())
    }

    fn publish_transition(&self, run_id: uuid::Uuid, step_id: &str, record: &StepTransition) {
        self.events.publish(EngineEvent::StepStateChanged {
            run_id,
            step_id: step_id.to_string(),
            from: record.from,
            to: record.to,
            attempt: record.attempt,
        });
    }
}

/// One attempt: input contract, dispatch under timeout and cancellation,
/// output contract.
async fn run_attempt(
    dispatcher: Arc<StepDispatcher>,
    request: StepRequest,
    timeout: Duration,
    cancel: CancellationToken,
) -> TaskEvent {
    let step_id = request.step.id.clone();
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(StepFailure::new(StepErrorKind::Cancelled, "run cancelled", false)),
        result = AssertUnwindSafe(attempt_once(&dispatcher, &request, timeout)).catch_unwind() => match result {
            Ok(result) => result,
            Err(_) => Err(StepFailure::new(panic_kind(&request.step.kind), "step panicked", false)),
        },
    };

    TaskEvent::Attempt { step_id, result }
}

async fn attempt_once(
    dispatcher: &StepDispatcher,
    request: &StepRequest,
    timeout: Duration,
) -> Result<StepOutcome, StepFailure> {
    contract::validate(&request.step.input_schema, &request.inputs, "inputs")
        .map_err(contract_failure)?;

    let outcome = match tokio::time::timeout(timeout, dispatcher.dispatch(request)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(StepFailure::new(
                StepErrorKind::Timeout,
                format!("step timed out after {}s", timeout.as_secs_f64()),
                true,
            ));
        }
    };

    contract::validate(&request.step.outputs, &outcome.output, "output")
        .map_err(contract_failure)?;
    Ok(outcome)
}

fn contract_failure(violation: contract::ContractViolation) -> StepFailure {
    StepFailure::new(StepErrorKind::ContractViolation, violation.message, false).with_path(violation.path)
}

fn panic_kind(kind: &StepKind) -> StepErrorKind {
    match kind {
        StepKind::ModelCall { .. } => StepErrorKind::AdapterError,
        StepKind::ToolCall { .. } => StepErrorKind::ToolError,
        StepKind::Aggregation { .. } => StepErrorKind::AggregationError,
    }
}

/// Type-check provided variables against the declarations and apply
/// defaults. Undeclared variables are dropped with a warning.
pub fn bind_variables(
    definition: &WorkflowDefinition,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, ExecutorError> {
    let mut bound = Map::new();
    let mut problems = Vec::new();

    for decl in &definition.variables {
        match provided.remove(&decl.name) {
            Some(value) if decl.value_type.matches(&value) => {
                bound.insert(decl.name.clone(), value);
            }
            Some(value) => problems.push(format!(
                "variable '{}' expects {}, got {}",
                decl.name,
                decl.value_type,
                if value.is_null() {
                    "null".to_string()
                } else {
                    ValueType::of(&value).to_string()
                }
            )),
            None => match &decl.default {
                Some(default) => {
                    bound.insert(decl.name.clone(), default.clone());
                }
                None => problems.push(format!("missing required variable '{}'", decl.name)),
            },
        }
    }

    for extra in provided.keys() {
        tracing::warn!(
            workflow_id = %definition.id,
            variable = %extra,
            "Ignoring undeclared variable"
        );
    }

    if problems.is_empty() {
        Ok(bound)
    } else {
        Err(ExecutorError::InvalidVariables(problems))
    }
}
