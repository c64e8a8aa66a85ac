//! `fbench bench`: sweep workflows x models and append results to the log.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use comfy_table::Cell;
use console::style;
use serde_json::Value;

use flowbench_core::benchmark::runner::{BenchmarkPlan, BenchmarkRunner, DryRunReport};
use flowbench_infra::log::JsonlBenchmarkLog;
use flowbench_types::benchmark::{summarize, BenchmarkResult};

use super::progress::ProgressHandle;
use super::{
    cancel_on_ctrl_c, format_score, load_rubric_paths, load_workflows, new_table, parse_var, vars_to_map, Cli,
    InvalidInput, Outcome,
};
use crate::state::AppState;

#[derive(Args)]
pub struct BenchArgs {
    /// Workflow file or directory (repeatable).
    #[arg(long = "workflow", short = 'w', required = true)]
    pub workflows: Vec<PathBuf>,

    /// Model to benchmark (repeatable; default: every configured model).
    #[arg(long = "model", short = 'm')]
    pub models: Vec<String>,

    /// Rubric file every run is scored with (repeatable).
    #[arg(long = "rubric")]
    pub rubrics: Vec<PathBuf>,

    /// Benchmark log to append to (default from config).
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Pairs running at once (overrides config).
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Validate the plan and show what would run, without running it.
    #[arg(long)]
    pub dry_run: bool,

    /// Rerun pairs that already have a record in the log.
    #[arg(long)]
    pub no_resume: bool,

    /// Variable offered to every workflow as key=value (repeatable).
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, Value)>,
}

pub async fn handle_bench(args: &BenchArgs, state: &AppState, cli: &Cli) -> Result<Outcome> {
    let workflows = load_workflows(&args.workflows)?;
    let rubrics = load_rubric_paths(&args.rubrics)?;

    let models: Vec<String> = if args.models.is_empty() {
        state.models.iter().map(|m| m.name.clone()).collect()
    } else {
        args.models.clone()
    };

    let log_path = args
        .log
        .clone()
        .unwrap_or_else(|| state.config.benchmark.log_path.clone());
    let parallel = args.parallel.unwrap_or(state.config.benchmark.max_parallel);

    let mut plan = BenchmarkPlan::new(workflows, models)
        .with_rubrics(rubrics)
        .with_parallel(parallel)
        .with_resume(!args.no_resume);
    plan.variables = vars_to_map(&args.vars);
    plan.run_options = state.run_options();

    let runner = BenchmarkRunner::new(
        state.executor.clone(),
        state.scoring.clone(),
        JsonlBenchmarkLog::new(log_path.clone()),
    );

    if args.dry_run {
        let report = runner.dry_run(&plan, &state.models).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if !cli.quiet {
            print_dry_run(&report, &log_path);
        }
        return Ok(if report.is_valid() {
            Outcome::Success
        } else {
            Outcome::Invalid
        });
    }

    let unknown: Vec<&str> = plan
        .models
        .iter()
        .filter(|m| !state.models.contains(m))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(InvalidInput(format!("unknown model(s): {}", unknown.join(", "))).into());
    }

    let total = plan.pairs().len();
    tracing::info!(
        pairs = total,
        parallel = plan.parallel,
        log = %log_path.display(),
        "Benchmark started"
    );

    let cancel = cancel_on_ctrl_c();
    let progress = ProgressHandle::for_sweep(&state.events, total, cli.styled())?;
    let result = runner.run(&plan, cancel).await;
    progress.finish().await;
    let result = result?;

    if cli.json {
        let out = serde_json::json!({
            "log": log_path,
            "result": result,
            "summary": summarize(&result.records),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !cli.quiet {
        print_result(&result, &log_path);
    }

    Ok(if result.all_succeeded() && !result.interrupted {
        Outcome::Success
    } else {
        Outcome::ExecutionFailed
    })
}

fn print_dry_run(report: &DryRunReport, log_path: &std::path::Path) {
    let mut table = new_table(&["Workflow", "Steps", "Model calls", "Waves", "Variables"]);
    for preview in &report.workflows {
        let variables = if preview.variable_problems.is_empty() {
            Cell::new("ok")
        } else {
            Cell::new(preview.variable_problems.join("; "))
        };
        table.add_row(vec![
            Cell::new(&preview.workflow_id),
            Cell::new(preview.steps),
            Cell::new(preview.model_calls),
            Cell::new(preview.waves),
            variables,
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} {} pair(s) to run, {} already in {}",
        style("Plan:").bold(),
        report.pairs.len(),
        report.skipped.len(),
        log_path.display()
    );
    println!(
        "  {} {} model call(s) at minimum",
        style("Cost:").bold(),
        report.planned_model_calls()
    );
    for model in &report.unknown_models {
        println!("  {} unknown model '{model}'", style("x").red().bold());
    }
    for problem in &report.rubric_problems {
        println!("  {} {problem}", style("x").red().bold());
    }
    println!();
}

fn print_result(result: &BenchmarkResult, log_path: &std::path::Path) {
    let mut table = new_table(&["Model", "Runs", "Succeeded", "Mean score"]);
    for summary in summarize(&result.records) {
        table.add_row(vec![
            Cell::new(&summary.model_id),
            Cell::new(summary.runs),
            Cell::new(summary.succeeded),
            Cell::new(format_score(summary.mean_score)),
        ]);
    }

    println!();
    if result.records.is_empty() {
        println!("  {}", style("No pairs ran.").dim());
    } else {
        println!("{table}");
    }
    println!();

    for record in result.records.iter().filter(|r| !r.failing_steps.is_empty() || r.error.is_some()) {
        let detail = record
            .error
            .clone()
            .unwrap_or_else(|| format!("failing steps: {}", record.failing_steps.join(", ")));
        println!(
            "  {} {} x {}: {detail}",
            style("x").red().bold(),
            record.workflow_id,
            record.model_id
        );
    }
    if !result.skipped.is_empty() {
        println!(
            "  {} {} pair(s) skipped (already logged)",
            style("-").dim(),
            result.skipped.len()
        );
    }
    if result.interrupted {
        println!(
            "  {} Interrupted; rerun the same command to resume.",
            style("!").yellow().bold()
        );
    }
    println!("  {} {}", style("Log:").dim(), log_path.display());
    println!();
}
