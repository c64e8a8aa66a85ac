//! Flowbench CLI entry point.
//!
//! Binary name: `fbench`
//!
//! Parses CLI arguments, sets up tracing, loads configuration and wires the
//! engine, then dispatches to the command handler. Exit codes: 0 on full
//! success, 2 on validation or configuration failure, 1 on execution failure.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;

use cli::{Cli, Commands, Outcome};
use flowbench_infra::config::load_engine_config;
use flowbench_observe::{init_tracing, shutdown_tracing, TracingOptions};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions::from_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        tracing_options.default_directive = "error".to_string();
    }
    tracing_options.json = cli.json;
    tracing_options.enable_otel = cli.otel;
    init_tracing(&tracing_options)?;

    let code = match dispatch(&cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            let outcome = cli::classify_error(&err);
            if cli.json {
                let out = serde_json::json!({ "error": format!("{err:#}") });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                eprintln!("{} {err:#}", console::style("error:").red().bold());
            }
            outcome.exit_code()
        }
    };

    shutdown_tracing();
    Ok(code)
}

async fn dispatch(cli: &Cli) -> anyhow::Result<Outcome> {
    let config_path = cli.config.as_deref();
    match &cli.command {
        // Validation and log summaries need configuration but no adapters.
        Commands::Validate(args) => {
            let loaded = load_engine_config(config_path).await?;
            cli::validate::handle_validate(args, &loaded.config, cli).await
        }
        Commands::Score(args) => {
            let loaded = load_engine_config(config_path).await?;
            cli::score::handle_score(args, &loaded.config, cli).await
        }
        Commands::Run(args) => {
            let state = AppState::init(config_path).await?;
            cli::run::handle_run(args, &state, cli).await
        }
        Commands::Bench(args) => {
            let state = AppState::init(config_path).await?;
            cli::bench::handle_bench(args, &state, cli).await
        }
        Commands::Models => {
            let state = AppState::init(config_path).await?;
            cli::models::handle_models(&state, cli)
        }
    }
}
