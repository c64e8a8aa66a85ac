//! Application state wiring the engine together.
//!
//! AppState holds the concrete instances every execution command needs:
//! the validated configuration, the model table and adapter registry, and
//! the executor and scoring engine built on top of them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use flowbench_core::eval::scoring::ScoringEngine;
use flowbench_core::event::bus::EventBus;
use flowbench_core::router::fallback::ModelRouter;
use flowbench_core::router::registry::{AdapterRegistry, ModelTable};
use flowbench_core::workflow::executor::{DagExecutor, RunOptions};
use flowbench_core::workflow::step_runner::StepDispatcher;
use flowbench_infra::adapters::build_registry;
use flowbench_infra::config::load_engine_config;
use flowbench_infra::tools::default_tools;
use flowbench_types::config::EngineConfig;

pub struct AppState {
    pub config: EngineConfig,
    /// File the configuration was read from, `None` for defaults.
    pub config_source: Option<PathBuf>,
    pub models: Arc<ModelTable>,
    pub adapters: Arc<AdapterRegistry>,
    pub events: EventBus,
    pub executor: DagExecutor,
    pub scoring: ScoringEngine,
}

impl AppState {
    /// Load configuration and wire adapters, router, tools and executor.
    pub async fn init(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let loaded = load_engine_config(config_path).await?;
        let config = loaded.config;

        let models = Arc::new(ModelTable::new(config.models.clone())?);
        let adapters = Arc::new(build_registry(&config.adapters)?);
        let router = ModelRouter::new(models.clone(), adapters.clone());
        let tools = Arc::new(default_tools().context("failed to initialize tools")?);

        let adapter_timeout = Duration::from_secs(config.engine.router_timeout_secs);
        let dispatcher = StepDispatcher::new(router.clone(), tools, adapter_timeout);
        let events = EventBus::default();
        let executor = DagExecutor::new(Arc::new(dispatcher)).with_events(events.clone());
        let scoring = ScoringEngine::with_judge(router, adapter_timeout);

        tracing::debug!(
            source = ?loaded.source,
            models = models.len(),
            adapters = adapters.list_names().len(),
            "Engine initialized"
        );

        Ok(Self {
            config,
            config_source: loaded.source,
            models,
            adapters,
            events,
            executor,
            scoring,
        })
    }

    /// Run options from `[engine]` settings.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::from_settings(&self.config.engine)
    }
}
