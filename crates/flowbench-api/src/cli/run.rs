//! `fbench run`: execute one workflow and optionally score it.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color};
use console::style;
use serde_json::Value;

use flowbench_types::run::{RunStatus, StepState, WorkflowRun};
use flowbench_types::rubric::ScoreRecord;

use super::progress::ProgressHandle;
use super::{
    cancel_on_ctrl_c, format_score, load_rubric_paths, load_workflow, new_table, parse_var, vars_to_map, Cli,
    Outcome,
};
use crate::state::AppState;

#[derive(Args)]
pub struct RunArgs {
    /// Workflow file to execute.
    pub file: PathBuf,

    /// Workflow variable as key=value (repeatable). Values parse as JSON when they can.
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, Value)>,

    /// Run every model-call step against this model.
    #[arg(long)]
    pub model: Option<String>,

    /// Rubric file to score the run with (repeatable).
    #[arg(long = "rubric")]
    pub rubrics: Vec<PathBuf>,

    /// Maximum steps running at once (overrides config).
    #[arg(long)]
    pub concurrency: Option<usize>,
}

pub async fn handle_run(args: &RunArgs, state: &AppState, cli: &Cli) -> Result<Outcome> {
    let workflow = load_workflow(&args.file)?;
    let rubrics = load_rubric_paths(&args.rubrics)?;

    let mut options = state.run_options();
    if let Some(model) = &args.model {
        options = options.with_model_override(model.clone());
    }
    if let Some(concurrency) = args.concurrency {
        options = options.with_concurrency(concurrency);
    }

    let cancel = cancel_on_ctrl_c();
    let progress = ProgressHandle::for_run(&state.events, cli.styled())?;
    let result = state
        .executor
        .execute(&workflow, vars_to_map(&args.vars), &options, cancel)
        .await;
    progress.finish().await;
    let run = result?;

    let scores = if rubrics.is_empty() || run.status == RunStatus::Cancelled {
        Vec::new()
    } else {
        state.scoring.score(&run, &rubrics).await?
    };

    if cli.json {
        let out = serde_json::json!({ "run": run, "scores": scores });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !cli.quiet {
        print_run(&run, &workflow.order, &scores);
    }

    Ok(if run.status == RunStatus::Succeeded {
        Outcome::Success
    } else {
        Outcome::ExecutionFailed
    })
}

/// Print step rows in topological order, then the report and any scores.
fn print_run(run: &WorkflowRun, order: &[String], scores: &[ScoreRecord]) {
    let mut table = new_table(&["Step", "State", "Attempts", "Adapter", "Duration", "Error"]);
    for step in order.iter().filter_map(|id| run.steps.get(id)) {
        let state = Cell::new(step.state.to_string()).fg(state_color(step.state));
        let duration = step
            .duration_ms()
            .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
        let error = step.error.as_ref().map(ToString::to_string).unwrap_or_default();
        table.add_row(vec![
            Cell::new(&step.step_id),
            state,
            Cell::new(format!("{}/{}", step.attempt, step.max_attempts)),
            Cell::new(step.adapter.as_deref().unwrap_or("-")),
            Cell::new(duration),
            Cell::new(error),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    let report = run.report();
    let headline = match run.status {
        RunStatus::Succeeded => style(report.to_string()).green(),
        RunStatus::Cancelled => style(report.to_string()).yellow(),
        _ => style(report.to_string()).red(),
    };
    print!("{headline}");

    if !scores.is_empty() {
        let mut table = new_table(&["Rubric", "Aggregate", "Dimensions"]);
        for record in scores {
            let dims = record
                .scores
                .iter()
                .map(|(name, score)| format!("{name}={score:.2}"))
                .collect::<Vec<_>>()
                .join(", ");
            table.add_row(vec![
                Cell::new(&record.rubric_id),
                Cell::new(format_score(Some(record.aggregate))),
                Cell::new(dims),
            ]);
        }
        println!();
        println!("{table}");
    }

    if let Some(ms) = run.duration_ms() {
        println!();
        println!("  {} {ms}ms", style("Elapsed:").dim());
    }
    println!();
}

fn state_color(state: StepState) -> Color {
    match state {
        StepState::Succeeded => Color::Green,
        StepState::Failed => Color::Red,
        StepState::Cancelled => Color::Yellow,
        _ => Color::Grey,
    }
}
