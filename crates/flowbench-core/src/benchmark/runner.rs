//! Benchmark sweep runner.
//!
//! Every (workflow, model) pair runs as its own task on a `JoinSet`, gated by
//! a semaphore of `parallel` permits. Finished pairs are sent back to the
//! runner loop, which is the only writer to the log: one record appended per
//! pair, as soon as that pair finishes.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use flowbench_types::benchmark::{BenchmarkRecord, BenchmarkResult, PairKey};
use flowbench_types::event::EngineEvent;
use flowbench_types::rubric::Rubric;
use flowbench_types::workflow::StepKind;

use super::log::{BenchmarkLog, LogError};
use crate::eval::rubric::validate_rubric;
use crate::eval::scoring::ScoringEngine;
use crate::event::bus::EventBus;
use crate::router::registry::ModelTable;
use crate::workflow::executor::{bind_variables, DagExecutor, RunOptions};
use crate::workflow::loader::LoadedWorkflow;

#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error("benchmark plan has no {0}")]
    EmptyPlan(&'static str),
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Everything a sweep needs: the workflows and models that form the grid,
/// the rubrics every run is scored against, and execution settings.
#[derive(Debug, Clone)]
pub struct BenchmarkPlan {
    pub workflows: Vec<Arc<LoadedWorkflow>>,
    pub models: Vec<String>,
    pub rubrics: Arc<Vec<Rubric>>,
    /// Variables offered to every workflow; each takes the ones it declares.
    pub variables: Map<String, Value>,
    /// Pairs running at once (at least 1).
    pub parallel: usize,
    /// Skip pairs already present in the log.
    pub resume: bool,
    /// Options for each run; the model override is set per pair.
    pub run_options: RunOptions,
}

impl BenchmarkPlan {
    pub fn new(workflows: Vec<LoadedWorkflow>, models: Vec<String>) -> Self {
        Self {
            workflows: workflows.into_iter().map(Arc::new).collect(),
            models,
            rubrics: Arc::new(Vec::new()),
            variables: Map::new(),
            parallel: 1,
            resume: true,
            run_options: RunOptions::default(),
        }
    }

    pub fn with_rubrics(mut self, rubrics: Vec<Rubric>) -> Self {
        self.rubrics = Arc::new(rubrics);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Every pair of the grid, workflow-major.
    pub fn pairs(&self) -> Vec<PairKey> {
        self.workflows
            .iter()
            .flat_map(|w| self.models.iter().map(move |m| PairKey::new(w.id(), m)))
            .collect()
    }

    fn check_not_empty(&self) -> Result<(), BenchmarkError> {
        if self.workflows.is_empty() {
            return Err(BenchmarkError::EmptyPlan("workflows"));
        }
        if self.models.is_empty() {
            return Err(BenchmarkError::EmptyPlan("models"));
        }
        Ok(())
    }
}

/// Offered variables restricted to the ones `workflow` declares.
fn variables_for(workflow: &LoadedWorkflow, offered: &Map<String, Value>) -> Map<String, Value> {
    workflow
        .definition
        .variables
        .iter()
        .filter_map(|decl| {
            offered
                .get(&decl.name)
                .map(|v| (decl.name.clone(), v.clone()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// Static shape of one workflow in a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowPreview {
    pub workflow_id: String,
    pub steps: usize,
    pub model_calls: usize,
    pub waves: usize,
    /// Variable binding problems with the plan's variables.
    pub variable_problems: Vec<String>,
}

/// What a sweep would do, computed without calling any model.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    /// Pairs that would run.
    pub pairs: Vec<PairKey>,
    /// Pairs the log already holds.
    pub skipped: Vec<PairKey>,
    /// Plan models missing from the model table.
    pub unknown_models: Vec<String>,
    /// Rubric problems, one line each.
    pub rubric_problems: Vec<String>,
    pub workflows: Vec<WorkflowPreview>,
}

impl DryRunReport {
    pub fn is_valid(&self) -> bool {
        self.unknown_models.is_empty()
            && self.rubric_problems.is_empty()
            && self.workflows.iter().all(|w| w.variable_problems.is_empty())
    }

    /// Model calls the sweep would make, counting one per model-call step.
    pub fn planned_model_calls(&self) -> usize {
        self.pairs
            .iter()
            .filter_map(|p| self.workflows.iter().find(|w| w.workflow_id == p.workflow_id))
            .map(|w| w.model_calls)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Result of one pair's task.
enum PairOutcome {
    Finished(BenchmarkRecord),
    /// Cancelled before it acquired a permit.
    NotStarted(PairKey),
}

/// Runs sweeps and persists one record per finished pair.
pub struct BenchmarkRunner<L: BenchmarkLog> {
    executor: DagExecutor,
    scoring: ScoringEngine,
    log: L,
    events: EventBus,
}

impl<L: BenchmarkLog> BenchmarkRunner<L> {
    pub fn new(executor: DagExecutor, scoring: ScoringEngine, log: L) -> Self {
        let events = executor.events().clone();
        Self {
            executor,
            scoring,
            log,
            events,
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Preview a sweep: validate workflows against the plan's variables,
    /// check every model name, and compute which pairs resume would skip.
    pub async fn dry_run(&self, plan: &BenchmarkPlan, models: &ModelTable) -> Result<DryRunReport, BenchmarkError> {
        plan.check_not_empty()?;

        let (pairs, skipped) = self.partition(plan).await?;
        let unknown_models = plan
            .models
            .iter()
            .filter(|m| !models.contains(m))
            .cloned()
            .collect();
        let rubric_problems = plan
            .rubrics
            .iter()
            .filter_map(|r| validate_rubric(r).err().map(|e| e.to_string()))
            .collect();
        let workflows = plan
            .workflows
            .iter()
            .map(|w| {
                let variable_problems = match bind_variables(&w.definition, variables_for(w, &plan.variables)) {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![e.to_string()],
                };
                WorkflowPreview {
                    workflow_id: w.id().to_string(),
                    steps: w.definition.steps.len(),
                    model_calls: w
                        .definition
                        .steps
                        .iter()
                        .filter(|s| matches!(s.kind, StepKind::ModelCall { .. }))
                        .count(),
                    waves: w.waves().len(),
                    variable_problems,
                }
            })
            .collect();

        Ok(DryRunReport {
            pairs,
            skipped,
            unknown_models,
            rubric_problems,
            workflows,
        })
    }

    /// Run every pair not already logged (when resuming).
    ///
    /// Cancelling `cancel` stops new pairs from starting and cancels the ones
    /// in flight. Their results are discarded, so the log holds exactly the
    /// pairs that completed.
    pub async fn run(&self, plan: &BenchmarkPlan, cancel: CancellationToken) -> Result<BenchmarkResult, BenchmarkError> {
        plan.check_not_empty()?;

        let (pending, skipped) = self.partition(plan).await?;
        let total = pending.len();
        tracing::info!(
            pairs = total,
            skipped = skipped.len(),
            parallel = plan.parallel,
            "Starting benchmark sweep"
        );

        let semaphore = Arc::new(Semaphore::new(plan.parallel.max(1)));
        let mut tasks = JoinSet::new();
        for key in pending {
            let Some(workflow) = plan.workflows.iter().find(|w| w.id() == key.workflow_id).cloned() else {
                continue;
            };
            let pair = PairTask {
                key,
                workflow,
                rubrics: plan.rubrics.clone(),
                variables: plan.variables.clone(),
                options: plan.run_options.clone(),
                executor: self.executor.clone(),
                scoring: self.scoring.clone(),
                semaphore: semaphore.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(pair.run());
        }

        let mut result = BenchmarkResult {
            skipped,
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    // PairTask catches panics itself; this is a runtime abort.
                    tracing::error!(error = %err, "Benchmark task failed to join");
                    result.interrupted = true;
                    continue;
                }
            };
            let record = match outcome {
                PairOutcome::Finished(record) if !cancel.is_cancelled() => record,
                PairOutcome::Finished(record) => {
                    tracing::debug!(pair = %record.key(), "Discarding result of cancelled pair");
                    result.interrupted = true;
                    continue;
                }
                PairOutcome::NotStarted(_) => {
                    result.interrupted = true;
                    continue;
                }
            };

            self.log.append(&record).await?;
            let completed = result.records.len() + 1;
            tracing::info!(
                workflow_id = %record.workflow_id,
                model_id = %record.model_id,
                status = %record.run_status,
                score = record.mean_score().unwrap_or_default(),
                completed,
                total,
                "Benchmark pair completed"
            );
            self.events.publish(EngineEvent::PairCompleted {
                workflow_id: record.workflow_id.clone(),
                model_id: record.model_id.clone(),
                run_status: record.run_status,
                completed,
                total,
            });
            result.records.push(record);
        }

        if result.interrupted {
            tracing::warn!(
                completed = result.records.len(),
                total,
                "Benchmark sweep interrupted"
            );
        }
        Ok(result)
    }

    /// Split the grid into pairs to run and pairs the log already holds.
    async fn partition(&self, plan: &BenchmarkPlan) -> Result<(Vec<PairKey>, Vec<PairKey>), BenchmarkError> {
        let done: HashSet<PairKey> = if plan.resume {
            self.log.load().await?.iter().map(BenchmarkRecord::key).collect()
        } else {
            HashSet::new()
        };
        Ok(plan.pairs().into_iter().partition(|k| !done.contains(k)))
    }
}

/// One pair's run and scoring, owned by its task.
struct PairTask {
    key: PairKey,
    workflow: Arc<LoadedWorkflow>,
    rubrics: Arc<Vec<Rubric>>,
    variables: Map<String, Value>,
    options: RunOptions,
    executor: DagExecutor,
    scoring: ScoringEngine,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl PairTask {
    async fn run(self) -> PairOutcome {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return PairOutcome::NotStarted(self.key),
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return PairOutcome::NotStarted(self.key),
            },
        };

        let key = self.key.clone();
        match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(record) => PairOutcome::Finished(record),
            Err(_) => {
                tracing::error!(pair = %key, "Benchmark pair panicked");
                PairOutcome::Finished(BenchmarkRecord::failed(&key, "pair task panicked"))
            }
        }
    }

    async fn execute(self) -> BenchmarkRecord {
        let options = self.options.clone().with_model_override(&self.key.model_id);
        let variables = variables_for(&self.workflow, &self.variables);

        let run = match self
            .executor
            .execute(&self.workflow, variables, &options, self.cancel.child_token())
            .await
        {
            Ok(run) => run,
            Err(err) => {
                tracing::warn!(pair = %self.key, error = %err, "Benchmark pair could not run");
                return BenchmarkRecord::failed(&self.key, err.to_string());
            }
        };

        match self.scoring.score(&run, &self.rubrics).await {
            Ok(scores) => BenchmarkRecord::from_run(&self.key.model_id, &run, scores),
            Err(err) => {
                tracing::warn!(pair = %self.key, error = %err, "Scoring failed");
                let mut record = BenchmarkRecord::from_run(&self.key.model_id, &run, Vec::new());
                record.error = Some(err.to_string());
                record
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use flowbench_types::model::{AdapterBinding, AdapterError, ModelRequest, ModelResponse, ModelSpec};
    use flowbench_types::run::RunStatus;
    use serde_json::json;

    use super::*;
    use crate::benchmark::log::MemoryBenchmarkLog;
    use crate::eval::rubric::parse_rubric_yaml;
    use crate::router::adapter::ModelAdapter;
    use crate::router::box_adapter::BoxModelAdapter;
    use crate::router::fallback::ModelRouter;
    use crate::router::registry::AdapterRegistry;
    use crate::workflow::loader::parse_workflow_yaml;
    use crate::workflow::step_runner::StepDispatcher;
    use crate::workflow::tools::ToolRegistry;

    /// Answers with the model name; fails for models named `broken*`.
    struct NamingAdapter;

    impl ModelAdapter for NamingAdapter {
        fn name(&self) -> &str {
            "local"
        }

        async fn invoke(
            &self,
            model: &str,
            _request: &ModelRequest,
            _timeout: Duration,
        ) -> Result<ModelResponse, AdapterError> {
            if model.starts_with("broken") {
                return Err(AdapterError::InvalidResponse(format!("{model} is broken")));
            }
            Ok(ModelResponse {
                content: format!("answer from {model}"),
                model: model.to_string(),
                usage: None,
            })
        }
    }

    fn table(models: &[&str]) -> ModelTable {
        ModelTable::new(
            models
                .iter()
                .map(|m| ModelSpec {
                    name: m.to_string(),
                    adapters: vec![AdapterBinding {
                        adapter: "local".into(),
                        model: m.to_string(),
                        cost: Default::default(),
                        latency: Default::default(),
                    }],
                })
                .collect(),
        )
        .unwrap()
    }

    fn executor(models: &[&str]) -> DagExecutor {
        let mut adapters = AdapterRegistry::new();
        adapters.register(BoxModelAdapter::new(NamingAdapter));
        let router = ModelRouter::new(Arc::new(table(models)), Arc::new(adapters));
        let dispatcher = StepDispatcher::new(router, Arc::new(ToolRegistry::with_builtins()), Duration::from_secs(5));
        DagExecutor::new(Arc::new(dispatcher))
    }

    fn workflow(id: &str) -> LoadedWorkflow {
        parse_workflow_yaml(&format!(
            r#"
id: {id}
variables:
  - name: question
    type: string
    default: why
steps:
  - id: ask
    kind: {{ type: model_call }}
    inputs:
      prompt: "{{{{ variables.question }}}}"
"#
        ))
        .unwrap()
    }

    fn rubric() -> Rubric {
        parse_rubric_yaml(
            r#"
id: sanity
dimensions:
  - name: finished
    scorer: { type: run_succeeded }
  - name: answered
    scorer: { type: contains, value: steps.ask.output.text, needle: answer }
"#,
            "inline",
        )
        .unwrap()
    }

    fn plan(models: &[&str]) -> BenchmarkPlan {
        BenchmarkPlan::new(
            vec![workflow("alpha"), workflow("beta")],
            models.iter().map(|m| m.to_string()).collect(),
        )
        .with_rubrics(vec![rubric()])
    }

    /// Cancels the sweep after a fixed number of appends.
    struct CancellingLog {
        inner: MemoryBenchmarkLog,
        appends: AtomicUsize,
        stop_after: usize,
        cancel: CancellationToken,
    }

    impl BenchmarkLog for CancellingLog {
        async fn append(&self, record: &BenchmarkRecord) -> Result<(), LogError> {
            self.inner.append(record).await?;
            if self.appends.fetch_add(1, Ordering::SeqCst) + 1 >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(())
        }

        async fn load(&self) -> Result<Vec<BenchmarkRecord>, LogError> {
            self.inner.load().await
        }
    }

    #[tokio::test]
    async fn test_sweep_records_every_pair() {
        let models = ["small", "large"];
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), MemoryBenchmarkLog::new());

        let result = runner
            .run(&plan(&models).with_parallel(3), CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.interrupted);
        assert!(result.all_succeeded());
        assert_eq!(result.records.len(), 4);

        let mut keys: Vec<PairKey> = result.records.iter().map(BenchmarkRecord::key).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PairKey::new("alpha", "large"),
                PairKey::new("alpha", "small"),
                PairKey::new("beta", "large"),
                PairKey::new("beta", "small"),
            ]
        );
        for record in &result.records {
            assert_eq!(record.scores.len(), 1);
            assert_eq!(record.scores[0].aggregate, 1.0);
        }
        assert_eq!(runner.log().load().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failing_pair_is_recorded_and_sweep_continues() {
        let models = ["small", "broken"];
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), MemoryBenchmarkLog::new());

        let result = runner
            .run(&plan(&models).with_parallel(2), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.records.len(), 4);
        assert!(!result.all_succeeded());
        let broken: Vec<&BenchmarkRecord> = result
            .records
            .iter()
            .filter(|r| r.model_id == "broken")
            .collect();
        assert_eq!(broken.len(), 2);
        for record in broken {
            assert_eq!(record.run_status, RunStatus::Failed);
            assert_eq!(record.failing_steps, vec!["ask".to_string()]);
            assert!(record.scores[0].aggregate < 1.0);
        }
    }

    #[tokio::test]
    async fn test_interrupted_sweep_resumes_remaining_pairs() {
        let models = ["small", "large"];
        let cancel = CancellationToken::new();
        let log = CancellingLog {
            inner: MemoryBenchmarkLog::new(),
            appends: AtomicUsize::new(0),
            stop_after: 3,
            cancel: cancel.clone(),
        };
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), log);

        let first = runner.run(&plan(&models), cancel).await.unwrap();
        assert!(first.interrupted);
        assert_eq!(first.records.len(), 3);

        let logged = runner.log().load().await.unwrap();
        assert_eq!(logged.len(), 3);

        // Resume against the same log with a fresh token.
        let resumed = BenchmarkRunner::new(
            executor(&models),
            ScoringEngine::new(),
            MemoryBenchmarkLog::with_records(logged.clone()),
        );
        let second = resumed.run(&plan(&models), CancellationToken::new()).await.unwrap();

        assert!(!second.interrupted);
        assert_eq!(second.skipped.len(), 3);
        assert_eq!(second.records.len(), 1);
        let remaining = second.records[0].key();
        assert!(logged.iter().all(|r| r.key() != remaining));
        assert_eq!(resumed.log().load().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_no_resume_reruns_logged_pairs() {
        let models = ["small"];
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), MemoryBenchmarkLog::new());

        runner.run(&plan(&models), CancellationToken::new()).await.unwrap();
        let again = runner
            .run(&plan(&models).with_resume(false), CancellationToken::new())
            .await
            .unwrap();

        assert!(again.skipped.is_empty());
        assert_eq!(again.records.len(), 2);
        assert_eq!(runner.log().load().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let models = ["small"];
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), MemoryBenchmarkLog::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner.run(&plan(&models), cancel).await.unwrap();

        assert!(result.interrupted);
        assert!(result.records.is_empty());
        assert!(runner.log().load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_variables_produce_failed_record() {
        let models = ["small"];
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), MemoryBenchmarkLog::new());
        let mut plan = plan(&models);
        plan.variables = json!({ "question": 42 }).as_object().cloned().unwrap();

        let result = runner.run(&plan, CancellationToken::new()).await.unwrap();

        assert_eq!(result.records.len(), 2);
        for record in &result.records {
            assert!(record.run_id.is_none());
            assert_eq!(record.run_status, RunStatus::Failed);
            assert!(record.error.as_deref().unwrap().contains("expects string"));
        }
    }

    #[tokio::test]
    async fn test_progress_events_count_up() {
        let models = ["small"];
        let runner = BenchmarkRunner::new(executor(&models), ScoringEngine::new(), MemoryBenchmarkLog::new());
        let mut rx = runner.events.subscribe();

        runner.run(&plan(&models), CancellationToken::new()).await.unwrap();

        let mut completed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::PairCompleted { completed: n, total, .. } = event {
                assert_eq!(total, 2);
                completed.push(n);
            }
        }
        assert_eq!(completed, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let runner = BenchmarkRunner::new(executor(&[]), ScoringEngine::new(), MemoryBenchmarkLog::new());
        let err = runner
            .run(&plan(&[]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchmarkError::EmptyPlan("models")));
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_calling_models() {
        let runner = BenchmarkRunner::new(executor(&["small"]), ScoringEngine::new(), MemoryBenchmarkLog::new());
        let plan = plan(&["small", "mystery"]);

        let report = runner.dry_run(&plan, &table(&["small"])).await.unwrap();

        assert_eq!(report.pairs.len(), 4);
        assert!(report.skipped.is_empty());
        assert_eq!(report.unknown_models, vec!["mystery".to_string()]);
        assert!(!report.is_valid());
        assert_eq!(report.workflows.len(), 2);
        assert_eq!(report.workflows[0].model_calls, 1);
        assert_eq!(report.planned_model_calls(), 4);
        assert!(runner.log().load().await.unwrap().is_empty());
    }
}
