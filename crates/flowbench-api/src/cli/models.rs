//! `fbench models`: show the model table and its adapter chains.

use anyhow::Result;
use comfy_table::{Cell, Color};
use console::style;
use serde::Serialize;

use flowbench_types::model::{CostClass, LatencyClass, ModelSpec};

use super::{new_table, Cli, Outcome};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct CandidateView<'a> {
    adapter: &'a str,
    model: &'a str,
    cost: CostClass,
    latency: LatencyClass,
    registered: bool,
}

#[derive(Debug, Serialize)]
struct ModelView<'a> {
    name: &'a str,
    default: bool,
    candidates: Vec<CandidateView<'a>>,
}

fn model_view<'a>(spec: &'a ModelSpec, state: &AppState) -> ModelView<'a> {
    ModelView {
        name: &spec.name,
        default: state.config.engine.default_model.as_deref() == Some(spec.name.as_str()),
        candidates: spec
            .adapters
            .iter()
            .map(|b| CandidateView {
                adapter: &b.adapter,
                model: &b.model,
                cost: b.cost,
                latency: b.latency,
                registered: state.adapters.contains(&b.adapter),
            })
            .collect(),
    }
}

pub fn handle_models(state: &AppState, cli: &Cli) -> Result<Outcome> {
    let views: Vec<ModelView<'_>> = state.models.iter().map(|s| model_view(s, state)).collect();

    if cli.json {
        let out = serde_json::json!({
            "config": state.config_source,
            "models": views,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(Outcome::Success);
    }
    if cli.quiet {
        return Ok(Outcome::Success);
    }

    let source = state
        .config_source
        .as_ref()
        .map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string());

    if views.is_empty() {
        println!();
        println!("  {}", style("No models configured.").dim());
        println!("  {} {source}", style("Config:").dim());
        println!();
        return Ok(Outcome::Success);
    }

    let mut table = new_table(&["Model", "#", "Adapter", "Backend model", "Cost", "Latency"]);
    for view in &views {
        let name = if view.default {
            format!("{} (default)", view.name)
        } else {
            view.name.to_string()
        };
        for (i, candidate) in view.candidates.iter().enumerate() {
            let adapter = if candidate.registered {
                Cell::new(candidate.adapter)
            } else {
                Cell::new(format!("{} (missing)", candidate.adapter)).fg(Color::Red)
            };
            table.add_row(vec![
                Cell::new(if i == 0 { name.as_str() } else { "" }),
                Cell::new(i + 1),
                adapter,
                Cell::new(candidate.model),
                Cell::new(format!("{:?}", candidate.cost).to_lowercase()),
                Cell::new(format!("{:?}", candidate.latency).to_lowercase()),
            ]);
        }
    }

    println!();
    println!("{table}");
    println!();
    println!("  {} {source}", style("Config:").dim());
    println!();
    Ok(Outcome::Success)
}
