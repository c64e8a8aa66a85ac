//! `fbench score`: summarize a benchmark log per model.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use comfy_table::Cell;
use console::style;

use flowbench_core::benchmark::log::BenchmarkLog;
use flowbench_infra::log::JsonlBenchmarkLog;
use flowbench_types::benchmark::{summarize, BenchmarkRecord, ModelSummary};
use flowbench_types::config::EngineConfig;

use super::{format_score, new_table, Cli, Outcome};

#[derive(Args)]
pub struct ScoreArgs {
    /// Benchmark log to read (default from config).
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Only include records for this workflow.
    #[arg(long)]
    pub workflow: Option<String>,
}

pub async fn handle_score(args: &ScoreArgs, config: &EngineConfig, cli: &Cli) -> Result<Outcome> {
    let path = args
        .log
        .clone()
        .unwrap_or_else(|| config.benchmark.log_path.clone());
    let log = JsonlBenchmarkLog::new(path.clone());
    let records: Vec<BenchmarkRecord> = log
        .load()
        .await?
        .into_iter()
        .filter(|r| args.workflow.as_ref().is_none_or(|w| &r.workflow_id == w))
        .collect();
    let summary = summarize(&records);

    if cli.json {
        let out = serde_json::json!({
            "log": path,
            "records": records.len(),
            "models": summary,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !cli.quiet {
        print_summary(&summary, records.len(), &path);
    }

    Ok(Outcome::Success)
}

fn print_summary(summary: &[ModelSummary], records: usize, path: &std::path::Path) {
    if summary.is_empty() {
        println!();
        println!("  {} {}", style("No records in").dim(), path.display());
        println!();
        return;
    }

    let mut table = new_table(&["Model", "Runs", "Succeeded", "Success rate", "Mean score"]);
    for row in summary {
        let rate = if row.runs == 0 {
            0.0
        } else {
            row.succeeded as f64 / row.runs as f64 * 100.0
        };
        table.add_row(vec![
            Cell::new(&row.model_id),
            Cell::new(row.runs),
            Cell::new(row.succeeded),
            Cell::new(format!("{rate:.0}%")),
            Cell::new(format_score(row.mean_score)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} {records} record(s) from {}",
        style("Source:").dim(),
        path.display()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn handle_score_reads_missing_log_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("none.jsonl");
        let cli = Cli::try_parse_from(["fbench", "--json", "score", "--log", log.to_str().unwrap()]).unwrap();
        let crate::cli::Commands::Score(args) = &cli.command else {
            panic!("expected score command");
        };
        let outcome = handle_score(args, &EngineConfig::default(), &cli).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
    }
}
