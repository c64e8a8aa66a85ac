//! Scoring engine.
//!
//! Grades a completed `WorkflowRun` against rubrics. Deterministic scorers
//! read the run through a JEXL context:
//!
//! ```text
//! {
//!   "run":       { "id", "workflow_id", "model", "status" },
//!   "steps":     { "<id>": { "state", "output", "attempts", "error_kind" } },
//!   "variables": { ... }
//! }
//! ```
//!
//! Judge scorers route a grading prompt through the `ModelRouter`. Every
//! dimension score is clamped to [0, 1]; the aggregate is the weighted mean.
//! Scoring never mutates the run.

use std::collections::BTreeMap;
use std::time::Duration;

use flowbench_types::model::ModelRequest;
use flowbench_types::rubric::{Rubric, ScoreRecord, Scorer};
use flowbench_types::run::{StepState, WorkflowRun};
use flowbench_types::workflow::RetryPolicy;
use serde_json::{json, Map, Value};

use super::rubric::validate_rubric;
use crate::router::fallback::ModelRouter;
use crate::workflow::expression::value_to_string;
use crate::workflow::jexl::{value_to_bool, JexlEvaluator};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringError {
    #[error("run {run_id} is incomplete: steps not terminal: {}", steps.join(", "))]
    IncompleteRun { run_id: uuid::Uuid, steps: Vec<String> },

    #[error("invalid rubric '{rubric}': {reason}")]
    InvalidRubric { rubric: String, reason: String },

    #[error("judge for '{rubric}.{dimension}' failed: {message}")]
    Judge {
        rubric: String,
        dimension: String,
        message: String,
    },
}

/// One graded dimension before aggregation.
struct DimensionScore {
    score: f64,
    note: String,
}

/// Grades runs against rubrics.
#[derive(Clone, Default)]
pub struct ScoringEngine {
    judge: Option<(ModelRouter, Duration)>,
}

impl ScoringEngine {
    /// An engine for deterministic scorers only; judge scorers fail.
    pub fn new() -> Self {
        Self { judge: None }
    }

    /// An engine that routes judge scorers through `router`.
    pub fn with_judge(router: ModelRouter, timeout: Duration) -> Self {
        Self {
            judge: Some((router, timeout)),
        }
    }

    /// Score `run` against every rubric, in order.
    pub async fn score(&self, run: &WorkflowRun, rubrics: &[Rubric]) -> Result<Vec<ScoreRecord>, ScoringError> {
        let pending: Vec<String> = run
            .steps
            .values()
            .filter(|s| !s.is_terminal())
            .map(|s| s.step_id.clone())
            .collect();
        if !pending.is_empty() {
            return Err(ScoringError::IncompleteRun {
                run_id: run.id,
                steps: pending,
            });
        }

        let context = scoring_context(run);
        let mut records = Vec::with_capacity(rubrics.len());
        for rubric in rubrics {
            records.push(self.score_rubric(run, &context, rubric).await?);
        }
        Ok(records)
    }

    async fn score_rubric(
        &self,
        run: &WorkflowRun,
        context: &Value,
        rubric: &Rubric,
    ) -> Result<ScoreRecord, ScoringError> {
        validate_rubric(rubric)?;

        let mut scores = BTreeMap::new();
        let mut notes = Vec::with_capacity(rubric.dimensions.len());
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for dim in &rubric.dimensions {
            let graded = match &dim.scorer {
                Scorer::Judge {
                    model,
                    criteria,
                    value,
                    scale,
                } => self
                    .judge(context, model, criteria, value, *scale)
                    .await
                    .map_err(|message| ScoringError::Judge {
                        rubric: rubric.id.clone(),
                        dimension: dim.name.clone(),
                        message,
                    })?,
                scorer => score_deterministic(scorer, run, context),
            };
            let score = clamp_unit(graded.score);
            weighted += dim.weight * score;
            total_weight += dim.weight;
            notes.push(format!("{}={score:.2} ({})", dim.name, graded.note));
            scores.insert(dim.name.clone(), score);
        }

        let aggregate = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        tracing::debug!(
            run_id = %run.id,
            rubric_id = %rubric.id,
            aggregate,
            "Scored run"
        );

        Ok(ScoreRecord {
            run_id: run.id,
            rubric_id: rubric.id.clone(),
            scores,
            aggregate,
            rationale: notes.join("; "),
        })
    }

    async fn judge(
        &self,
        context: &Value,
        model: &str,
        criteria: &str,
        value_expr: &str,
        scale: f64,
    ) -> Result<DimensionScore, String> {
        let Some((router, timeout)) = &self.judge else {
            return Err("no model router configured for judge scorers".to_string());
        };
        if scale.is_nan() || scale <= 0.0 {
            return Err(format!("scale must be positive, got {scale}"));
        }
        let subject = evaluate(value_expr, context)
            .map(|v| value_to_string(&v))
            .map_err(|e| format!("cannot read '{value_expr}': {e}"))?;

        let mut request = ModelRequest::new(format!(
            "Grade the following output against the criteria.\n\n\
             Criteria: {criteria}\n\n\
             Output:\n{subject}\n\n\
             Reply with a single number from 0 to {scale}."
        ));
        request.system = Some("You are a strict, consistent grader.".to_string());
        request.temperature = Some(0.0);

        let routed = router
            .route(model, &request, &RetryPolicy::default(), *timeout)
            .await
            .map_err(|e| e.to_string())?;
        let raw = first_number(&routed.response.content).ok_or_else(|| {
            format!(
                "judge reply contains no number: {:?}",
                truncate(&routed.response.content, 80)
            )
        })?;
        Ok(DimensionScore {
            score: raw / scale,
            note: format!("judged {raw}/{scale} via {}", routed.adapter),
        })
    }
}

fn score_deterministic(scorer: &Scorer, run: &WorkflowRun, context: &Value) -> DimensionScore {
    let binary = |ok: bool, note: String| DimensionScore {
        score: if ok { 1.0 } else { 0.0 },
        note,
    };

    match scorer {
        Scorer::StepSucceeded { step } => {
            let state = run.steps.get(step).map(|s| s.state);
            match state {
                Some(state) => binary(state == StepState::Succeeded, format!("step {step} {state}")),
                None => binary(false, format!("step {step} not in run")),
            }
        }
        Scorer::RunSucceeded => binary(
            run.status == flowbench_types::run::RunStatus::Succeeded,
            format!("run {}", run.status),
        ),
        Scorer::Contains {
            value,
            needle,
            case_sensitive,
        } => match evaluate(value, context) {
            Ok(Value::Null) => binary(false, "no value".into()),
            Ok(v) => {
                let text = value_to_string(&v);
                let found = if *case_sensitive {
                    text.contains(needle.as_str())
                } else {
                    text.to_lowercase().contains(&needle.to_lowercase())
                };
                binary(found, if found { "found" } else { "not found" }.to_string())
            }
            Err(e) => binary(false, e),
        },
        Scorer::NumberRange { value, min, max } => match evaluate(value, context) {
            Ok(v) => match v.as_f64() {
                Some(n) => {
                    let ok = min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m);
                    binary(ok, format!("{n}"))
                }
                None => binary(false, "not a number".into()),
            },
            Err(e) => binary(false, e),
        },
        Scorer::Expression { expr } => match evaluate(expr, context) {
            Ok(Value::Number(n)) => DimensionScore {
                score: n.as_f64().unwrap_or(0.0),
                note: format!("{n}"),
            },
            Ok(Value::Bool(b)) => binary(b, b.to_string()),
            Ok(other) => binary(value_to_bool(&other), "non-numeric result".into()),
            Err(e) => binary(false, e),
        },
        Scorer::Judge { .. } => binary(false, "judge scored separately".into()),
    }
}

/// Evaluate a JEXL expression. The evaluator is built and dropped here so it
/// never lives across an await.
fn evaluate(expr: &str, context: &Value) -> Result<Value, String> {
    JexlEvaluator::new()
        .evaluate_value(expr, context)
        .map_err(|e| e.to_string())
}

fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// The JEXL context a run is scored against.
pub fn scoring_context(run: &WorkflowRun) -> Value {
    let steps: Map<String, Value> = run
        .steps
        .iter()
        .map(|(id, step)| {
            (
                id.clone(),
                json!({
                    "state": step.state.to_string(),
                    "output": step.output.clone().unwrap_or(Value::Null),
                    "attempts": step.attempt,
                    "error_kind": step.error.as_ref().map(|e| e.kind.to_string()),
                }),
            )
        })
        .collect();
    json!({
        "run": {
            "id": run.id.to_string(),
            "workflow_id": run.workflow_id,
            "model": run.model,
            "status": run.status.to_string(),
        },
        "steps": steps,
        "variables": run.variables,
    })
}

/// First decimal number in `text` (e.g. "Score: 7/10" yields 7).
pub fn first_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let starts_number = bytes[i].is_ascii_digit()
            || (bytes[i] == b'-' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit));
        if starts_number {
            let start = i;
            i += 1;
            let mut seen_dot = false;
            while i < bytes.len() {
                match bytes[i] {
                    b'0'..=b'9' => i += 1,
                    b'.' if !seen_dot && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                        seen_dot = true;
                        i += 1;
                    }
                    _ => break,
                }
            }
            return text[start..i].parse().ok();
        }
        i += 1;
    }
    None
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flowbench_types::model::{AdapterBinding, AdapterError, ModelResponse, ModelSpec};
    use flowbench_types::rubric::Dimension;
    use flowbench_types::run::{RunStatus, StepRun};

    use super::*;
    use crate::router::adapter::ModelAdapter;
    use crate::router::box_adapter::BoxModelAdapter;
    use crate::router::registry::{AdapterRegistry, ModelTable};

    fn finished_run() -> WorkflowRun {
        let mut draft = StepRun::new("draft", 1, false);
        draft.state = StepState::Succeeded;
        draft.attempt = 1;
        draft.output = Some(json!({ "text": "Rust makes systems programming safe", "words": 5 }));
        let mut extra = StepRun::new("extra", 1, true);
        extra.state = StepState::Cancelled;

        let mut steps = BTreeMap::new();
        steps.insert("draft".to_string(), draft);
        steps.insert("extra".to_string(), extra);
        let mut vars = Map::new();
        vars.insert("topic".into(), json!("rust"));
        let mut run = WorkflowRun::new("summarize", Some("fast".into()), vars, steps);
        run.status = RunStatus::Succeeded;
        run
    }

    fn dim(name: &str, weight: f64, scorer: Scorer) -> Dimension {
        Dimension {
            name: name.to_string(),
            weight,
            scorer,
        }
    }

    fn deterministic_rubric() -> Rubric {
        Rubric {
            id: "quality".into(),
            description: None,
            dimensions: vec![
                dim("completed", 2.0, Scorer::RunSucceeded),
                dim(
                    "mentions-topic",
                    1.0,
                    Scorer::Contains {
                        value: "steps.draft.output.text".into(),
                        needle: "RUST".into(),
                        case_sensitive: false,
                    },
                ),
                dim(
                    "length",
                    1.0,
                    Scorer::NumberRange {
                        value: "steps.draft.output.words".into(),
                        min: Some(10.0),
                        max: None,
                    },
                ),
                dim(
                    "extra-ran",
                    0.0,
                    Scorer::StepSucceeded {
                        step: "extra".into(),
                    },
                ),
            ],
        }
    }

    #[tokio::test]
    async fn test_weighted_aggregate() {
        let records = ScoringEngine::new()
            .score(&finished_run(), &[deterministic_rubric()])
            .await
            .unwrap();
        let record = &records[0];
        assert_eq!(record.scores["completed"], 1.0);
        assert_eq!(record.scores["mentions-topic"], 1.0);
        assert_eq!(record.scores["length"], 0.0);
        assert_eq!(record.scores["extra-ran"], 0.0);
        // (2*1 + 1*1 + 1*0 + 0*0) / 4
        assert!((record.aggregate - 0.75).abs() < 1e-9);
        assert!(record.rationale.contains("length=0.00"));
    }

    #[tokio::test]
    async fn test_scoring_is_idempotent() {
        let run = finished_run();
        let before = run.clone();
        let engine = ScoringEngine::new();
        let first = engine.score(&run, &[deterministic_rubric()]).await.unwrap();
        let second = engine.score(&run, &[deterministic_rubric()]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(run, before);
    }

    #[tokio::test]
    async fn test_expression_scorer_is_clamped() {
        let rubric = Rubric {
            id: "expr".into(),
            description: None,
            dimensions: vec![
                dim(
                    "ratio",
                    1.0,
                    Scorer::Expression {
                        expr: "steps.draft.output.words / 2".into(),
                    },
                ),
                dim(
                    "topic",
                    1.0,
                    Scorer::Expression {
                        expr: "variables.topic == 'rust'".into(),
                    },
                ),
            ],
        };
        let records = ScoringEngine::new()
            .score(&finished_run(), &[rubric])
            .await
            .unwrap();
        assert_eq!(records[0].scores["ratio"], 1.0);
        assert_eq!(records[0].scores["topic"], 1.0);
    }

    #[tokio::test]
    async fn test_incomplete_run_is_rejected() {
        let mut run = finished_run();
        run.steps.get_mut("extra").unwrap().state = StepState::Running;
        let err = ScoringEngine::new()
            .score(&run, &[deterministic_rubric()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::IncompleteRun { ref steps, .. } if steps == &["extra".to_string()]));
    }

    #[tokio::test]
    async fn test_invalid_rubric_is_rejected() {
        let rubric = Rubric {
            id: "empty".into(),
            description: None,
            dimensions: vec![],
        };
        let err = ScoringEngine::new()
            .score(&finished_run(), &[rubric])
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::InvalidRubric { .. }));
    }

    #[test]
    fn test_first_number() {
        assert_eq!(first_number("Score: 7/10"), Some(7.0));
        assert_eq!(first_number("I'd say 8.5."), Some(8.5));
        assert_eq!(first_number("-2 points"), Some(-2.0));
        assert_eq!(first_number("no digits"), None);
    }

    struct FixedJudge(&'static str);

    impl ModelAdapter for FixedJudge {
        fn name(&self) -> &str {
            "judge-backend"
        }

        async fn invoke(
            &self,
            model: &str,
            request: &ModelRequest,
            _timeout: Duration,
        ) -> Result<ModelResponse, AdapterError> {
            assert!(request.prompt.contains("Rust makes systems programming safe"));
            Ok(ModelResponse {
                content: self.0.to_string(),
                model: model.to_string(),
                usage: None,
            })
        }
    }

    fn judge_engine(reply: &'static str) -> ScoringEngine {
        let mut adapters = AdapterRegistry::new();
        adapters.register(BoxModelAdapter::new(FixedJudge(reply)));
        let table = ModelTable::new(vec![ModelSpec {
            name: "judge".into(),
            adapters: vec![AdapterBinding {
                adapter: "judge-backend".into(),
                model: "grader".into(),
                cost: Default::default(),
                latency: Default::default(),
            }],
        }])
        .unwrap();
        ScoringEngine::with_judge(
            ModelRouter::new(Arc::new(table), Arc::new(adapters)),
            Duration::from_secs(5),
        )
    }

    fn judge_rubric() -> Rubric {
        Rubric {
            id: "judged".into(),
            description: None,
            dimensions: vec![dim(
                "clarity",
                1.0,
                Scorer::Judge {
                    model: "judge".into(),
                    criteria: "clear and accurate".into(),
                    value: "steps.draft.output.text".into(),
                    scale: 10.0,
                },
            )],
        }
    }

    #[tokio::test]
    async fn test_judge_scorer_uses_first_number() {
        let records = judge_engine("Score: 8 out of 10")
            .score(&finished_run(), &[judge_rubric()])
            .await
            .unwrap();
        assert!((records[0].scores["clarity"] - 0.8).abs() < 1e-9);
        assert!(records[0].rationale.contains("judge-backend"));
    }

    #[tokio::test]
    async fn test_judge_reply_without_number_fails() {
        let err = judge_engine("excellent work")
            .score(&finished_run(), &[judge_rubric()])
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::Judge { ref dimension, .. } if dimension == "clarity"));
    }

    #[tokio::test]
    async fn test_judge_without_router_fails() {
        let err = ScoringEngine::new()
            .score(&finished_run(), &[judge_rubric()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no model router"));
    }
}
