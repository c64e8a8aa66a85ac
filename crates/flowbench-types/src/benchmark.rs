//! Benchmark sweep records.
//!
//! A sweep runs every (workflow, model) pair and appends one
//! `BenchmarkRecord` per pair to an append-only log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rubric::ScoreRecord;
use crate::run::{RunStatus, StepErrorKind, StepState, WorkflowRun};

/// Identity of one sweep cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub workflow_id: String,
    pub model_id: String,
}

impl PairKey {
    pub fn new(workflow_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {}", self.workflow_id, self.model_id)
    }
}

/// One persisted line of the benchmark log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub workflow_id: String,
    pub model_id: String,
    /// Absent when the run could not start (e.g. invalid variables).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub run_status: RunStatus,
    pub step_summaries: Vec<StepSummary>,
    #[serde(default)]
    pub failing_steps: Vec<String>,
    pub scores: Vec<ScoreRecord>,
    /// Set when the run or its scoring could not be completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl BenchmarkRecord {
    /// Build a record from a finished run and its scores.
    pub fn from_run(model_id: &str, run: &WorkflowRun, scores: Vec<ScoreRecord>) -> Self {
        Self {
            workflow_id: run.workflow_id.clone(),
            model_id: model_id.to_string(),
            run_id: Some(run.id),
            run_status: run.status,
            step_summaries: run.steps.values().map(StepSummary::from_step).collect(),
            failing_steps: run
                .failing_steps()
                .iter()
                .map(|s| s.step_id.clone())
                .collect(),
            scores,
            error: None,
            timestamp: Utc::now(),
            duration_ms: run.duration_ms().unwrap_or(0),
        }
    }

    /// Record for a pair whose run could not be executed at all.
    pub fn failed(key: &PairKey, error: impl Into<String>) -> Self {
        Self {
            workflow_id: key.workflow_id.clone(),
            model_id: key.model_id.clone(),
            run_id: None,
            run_status: RunStatus::Failed,
            step_summaries: Vec::new(),
            failing_steps: Vec::new(),
            scores: Vec::new(),
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(&self.workflow_id, &self.model_id)
    }

    /// Mean aggregate over all rubrics, if any were scored.
    pub fn mean_score(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        let total: f64 = self.scores.iter().map(|s| s.aggregate).sum();
        Some(total / self.scores.len() as f64)
    }
}

/// Compact per-step outcome stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub state: StepState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepSummary {
    pub fn from_step(step: &crate::run::StepRun) -> Self {
        Self {
            step_id: step.step_id.clone(),
            state: step.state,
            attempts: step.attempt,
            error_kind: step.error.as_ref().map(|e| e.kind),
            adapter: step.adapter.clone(),
            duration_ms: step.duration_ms(),
        }
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Records produced by this invocation, in completion order.
    pub records: Vec<BenchmarkRecord>,
    /// Pairs skipped because the log already held them.
    pub skipped: Vec<PairKey>,
    /// Whether the sweep stopped before every pair was dispatched.
    pub interrupted: bool,
}

impl BenchmarkResult {
    /// Whether every record produced by this invocation succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.run_status == RunStatus::Succeeded)
    }
}

/// Per-model roll-up of a set of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_id: String,
    pub runs: usize,
    pub succeeded: usize,
    /// Mean of per-record mean scores, over records that were scored.
    pub mean_score: Option<f64>,
}

/// Summarize records per model, in model-id order.
pub fn summarize(records: &[BenchmarkRecord]) -> Vec<ModelSummary> {
    let mut by_model: BTreeMap<&str, (usize, usize, Vec<f64>)> = BTreeMap::new();
    for record in records {
        let entry = by_model.entry(record.model_id.as_str()).or_default();
        entry.0 += 1;
        if record.run_status == RunStatus::Succeeded {
            entry.1 += 1;
        }
        if let Some(score) = record.mean_score() {
            entry.2.push(score);
        }
    }
    by_model
        .into_iter()
        .map(|(model_id, (runs, succeeded, scores))| ModelSummary {
            model_id: model_id.to_string(),
            runs,
            succeeded,
            mean_score: if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            },
        })
        .collect()
}
