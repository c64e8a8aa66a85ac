//! CLI command definitions and shared helpers for the `fbench` binary.

pub mod bench;
pub mod models;
pub mod progress;
pub mod run;
pub mod score;
pub mod validate;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use flowbench_core::benchmark::runner::BenchmarkError;
use flowbench_core::eval::rubric::{load_rubrics, RubricError};
use flowbench_core::router::registry::TableError;
use flowbench_core::workflow::executor::ExecutorError;
use flowbench_core::workflow::loader::{discover_workflows, load_workflow_file, LoadedWorkflow, WorkflowError};
use flowbench_infra::config::ConfigError;
use flowbench_types::model::AdapterError;
use flowbench_types::rubric::Rubric;

/// Run workflows against models and benchmark the results.
#[derive(Parser)]
#[command(name = "fbench", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (default: ./flowbench.toml, then the user config dir).
    #[arg(long, global = true, env = "FLOWBENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate workflow files without running them.
    Validate(validate::ValidateArgs),

    /// Execute one workflow.
    Run(run::RunArgs),

    /// Run every (workflow, model) pair and append results to a log.
    Bench(bench::BenchArgs),

    /// Summarize an existing benchmark log.
    Score(score::ScoreArgs),

    /// List the configured model table.
    Models,
}

impl Cli {
    /// Whether styled progress and tables should be drawn.
    pub fn styled(&self) -> bool {
        !self.json && !self.quiet
    }
}

// ---------------------------------------------------------------------------
// Outcome and exit codes
// ---------------------------------------------------------------------------

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Something ran and failed (a step, a pair).
    ExecutionFailed,
    /// Input or configuration was rejected before anything ran.
    Invalid,
}

impl Outcome {
    pub fn exit_code(self) -> std::process::ExitCode {
        match self {
            Outcome::Success => std::process::ExitCode::SUCCESS,
            Outcome::ExecutionFailed => std::process::ExitCode::from(1),
            Outcome::Invalid => std::process::ExitCode::from(2),
        }
    }
}

/// Input rejected by a command handler.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidInput(pub String);

/// Map an error to the outcome it represents: load, validation and
/// configuration errors are `Invalid`, everything else `ExecutionFailed`.
pub fn classify_error(err: &anyhow::Error) -> Outcome {
    let invalid = err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<TableError>().is_some()
        || err.downcast_ref::<WorkflowError>().is_some()
        || err.downcast_ref::<RubricError>().is_some()
        || err.downcast_ref::<InvalidInput>().is_some()
        || err
            .downcast_ref::<AdapterError>()
            .is_some_and(AdapterError::is_configuration)
        || matches!(
            err.downcast_ref::<ExecutorError>(),
            Some(ExecutorError::InvalidVariables(_) | ExecutorError::MissingModel { .. })
        )
        || matches!(
            err.downcast_ref::<BenchmarkError>(),
            Some(BenchmarkError::EmptyPlan(_))
        );
    if invalid {
        Outcome::Invalid
    } else {
        Outcome::ExecutionFailed
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Parse `key=value`. The value is read as JSON when it parses (numbers,
/// booleans, arrays, quoted strings) and taken as a plain string otherwise.
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn vars_to_map(vars: &[(String, Value)]) -> Map<String, Value> {
    vars.iter().cloned().collect()
}

/// Load workflow files; directories contribute every workflow inside them.
pub fn load_workflows(paths: &[PathBuf]) -> anyhow::Result<Vec<LoadedWorkflow>> {
    let mut workflows = Vec::new();
    for path in paths {
        if path.is_dir() {
            let found = discover_workflows(path)?;
            if found.is_empty() {
                tracing::warn!(dir = %path.display(), "No workflow files found");
            }
            workflows.extend(found.into_iter().map(|(_, w)| w));
        } else {
            workflows.push(load_workflow(path)?);
        }
    }
    Ok(workflows)
}

pub fn load_workflow(path: &Path) -> anyhow::Result<LoadedWorkflow> {
    load_workflow_file(path)
        .map_err(|e| anyhow::Error::new(e).context(format!("failed to load {}", path.display())))
}

pub fn load_rubric_paths(paths: &[PathBuf]) -> anyhow::Result<Vec<Rubric>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    Ok(load_rubrics(paths)?)
}

/// A token cancelled on Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Interrupted, finishing up...");
            child.cancel();
        }
    });
    token
}

/// Table with the shared preset and header styling.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::White))
            .collect::<Vec<_>>(),
    );
    table
}

pub fn format_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{s:.3}"))
}
