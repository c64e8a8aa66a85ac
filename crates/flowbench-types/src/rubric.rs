//! Rubrics and score records.
//!
//! A rubric is a named set of weighted dimensions. Each dimension has a
//! scorer that is either a deterministic rule over the run or a
//! model-graded judgment. Scoring lives in `flowbench-core::eval`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named set of scoring dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub dimensions: Vec<Dimension>,
}

/// One weighted dimension of a rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub scorer: Scorer,
}

fn default_weight() -> f64 {
    1.0
}

/// Scoring function for a dimension. Every scorer yields a value in [0, 1].
///
/// `value` fields are JEXL expressions evaluated against
/// `{ run, steps, variables }`, e.g. `steps.draft.output.text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scorer {
    /// 1 if the step succeeded.
    StepSucceeded { step: String },
    /// 1 if the run succeeded.
    RunSucceeded,
    /// 1 if the string at `value` contains `needle`.
    Contains {
        value: String,
        needle: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// 1 if the number at `value` lies within `[min, max]`.
    NumberRange {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// A JEXL expression; booleans map to 0/1, numbers are clamped.
    Expression { expr: String },
    /// Ask a model to grade `value` against `criteria` on a 0..=`scale` range.
    Judge {
        model: String,
        criteria: String,
        value: String,
        #[serde(default = "default_scale")]
        scale: f64,
    },
}

fn default_scale() -> f64 {
    10.0
}

impl Scorer {
    /// Whether scoring calls out to a model.
    pub fn is_model_graded(&self) -> bool {
        matches!(self, Scorer::Judge { .. })
    }
}

/// Result of grading one run against one rubric.
///
/// Carries no timestamp: grading the same run twice with deterministic
/// scorers yields an identical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub run_id: Uuid,
    pub rubric_id: String,
    pub scores: BTreeMap<String, f64>,
    pub aggregate: f64,
    pub rationale: String,
}
