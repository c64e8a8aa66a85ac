//! `fbench validate`: load workflows and rubrics without running anything.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color};
use console::style;
use serde::Serialize;

use flowbench_core::eval::rubric::load_rubric_file;
use flowbench_core::workflow::loader::{discover_workflows, load_workflow_file, LoadedWorkflow};
use flowbench_types::config::EngineConfig;
use flowbench_types::workflow::StepKind;

use super::{new_table, Cli, Outcome};

#[derive(Args)]
pub struct ValidateArgs {
    /// Workflow files or directories of workflows.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Rubric files to validate as well.
    #[arg(long = "rubric")]
    pub rubrics: Vec<PathBuf>,
}

/// Validation result for one file.
#[derive(Debug, Serialize)]
struct FileReport {
    path: String,
    kind: &'static str,
    id: Option<String>,
    steps: usize,
    waves: usize,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl FileReport {
    fn failed(path: &Path, kind: &'static str, error: String) -> Self {
        Self {
            path: path.display().to_string(),
            kind,
            id: None,
            steps: 0,
            waves: 0,
            errors: vec![error],
            warnings: Vec::new(),
        }
    }
}

pub async fn handle_validate(args: &ValidateArgs, config: &EngineConfig, cli: &Cli) -> Result<Outcome> {
    let mut reports = Vec::new();

    for path in &args.files {
        if path.is_dir() {
            match discover_workflows(path) {
                Ok(found) => {
                    for (file, workflow) in found {
                        reports.push(workflow_report(&file, &workflow, config));
                    }
                }
                Err(err) => reports.push(FileReport::failed(path, "workflow", err.to_string())),
            }
        } else {
            match load_workflow_file(path) {
                Ok(workflow) => reports.push(workflow_report(path, &workflow, config)),
                Err(err) => reports.push(FileReport::failed(path, "workflow", err.to_string())),
            }
        }
    }

    for path in &args.rubrics {
        match load_rubric_file(path) {
            Ok(rubric) => reports.push(FileReport {
                path: path.display().to_string(),
                kind: "rubric",
                id: Some(rubric.id),
                steps: 0,
                waves: 0,
                errors: Vec::new(),
                warnings: Vec::new(),
            }),
            Err(err) => reports.push(FileReport::failed(path, "rubric", err.to_string())),
        }
    }

    let valid = reports.iter().all(|r| r.errors.is_empty());

    if cli.json {
        let out = serde_json::json!({ "valid": valid, "files": reports });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !cli.quiet {
        print_reports(&reports);
    }

    Ok(if valid { Outcome::Success } else { Outcome::Invalid })
}

/// Check model references a loaded workflow makes against the model table.
fn workflow_report(path: &Path, workflow: &LoadedWorkflow, config: &EngineConfig) -> FileReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let known = |name: &str| config.models.iter().any(|m| m.name == name);

    for step in &workflow.definition.steps {
        if let StepKind::ModelCall { model, .. } = &step.kind {
            match model {
                Some(name) if !known(name) => {
                    errors.push(format!("step '{}' uses unknown model '{name}'", step.id));
                }
                Some(_) => {}
                None if config.engine.default_model.is_none() => warnings.push(format!(
                    "step '{}' names no model and no default is configured; pass --model",
                    step.id
                )),
                None => {}
            }
        }
    }

    FileReport {
        path: path.display().to_string(),
        kind: "workflow",
        id: Some(workflow.id().to_string()),
        steps: workflow.definition.steps.len(),
        waves: workflow.waves().len(),
        errors,
        warnings,
    }
}

fn print_reports(reports: &[FileReport]) {
    let mut table = new_table(&["File", "Kind", "Id", "Steps", "Waves", "Result"]);
    for report in reports {
        let result = if report.errors.is_empty() {
            Cell::new("ok").fg(Color::Green)
        } else {
            Cell::new("invalid").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&report.path),
            Cell::new(report.kind),
            Cell::new(report.id.as_deref().unwrap_or("-")),
            Cell::new(report.steps),
            Cell::new(report.waves),
            result,
        ]);
    }
    println!();
    println!("{table}");

    for report in reports {
        for error in &report.errors {
            println!("  {} {}: {error}", style("x").red().bold(), report.path);
        }
        for warning in &report.warnings {
            println!("  {} {}: {warning}", style("!").yellow().bold(), report.path);
        }
    }
    println!();
}
