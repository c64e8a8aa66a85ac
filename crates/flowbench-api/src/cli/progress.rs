//! Progress bars driven by engine events.

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use flowbench_core::event::bus::EventBus;
use flowbench_types::event::EngineEvent;
use flowbench_types::run::StepState;

/// A progress bar updated from the event bus until `finish` is called.
pub struct ProgressHandle {
    bar: ProgressBar,
    task: JoinHandle<()>,
}

impl ProgressHandle {
    /// Steps of a single run.
    pub fn for_run(events: &EventBus, styled: bool) -> anyhow::Result<Self> {
        let bar = new_bar(0, styled, "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} steps {msg}")?;
        let mut rx = events.subscribe();
        let task_bar = bar.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                match event {
                    EngineEvent::RunStarted { step_count, workflow_id, .. } => {
                        task_bar.set_length(step_count as u64);
                        task_bar.set_message(workflow_id);
                    }
                    EngineEvent::StepStateChanged { step_id, to, attempt, .. } => match to {
                        StepState::Running => task_bar.set_message(format!("{step_id} (attempt {attempt})")),
                        StepState::Succeeded | StepState::Cancelled => task_bar.inc(1),
                        StepState::Retrying => task_bar.set_message(format!("{step_id} retrying")),
                        _ => {}
                    },
                    EngineEvent::RunCompleted { status, .. } => {
                        task_bar.set_message(status.to_string());
                        break;
                    }
                    EngineEvent::PairCompleted { .. } => {}
                }
            }
        });
        Ok(Self { bar, task })
    }

    /// Pairs of a sweep. `total` is refined by the first completed pair.
    pub fn for_sweep(events: &EventBus, total: usize, styled: bool) -> anyhow::Result<Self> {
        let bar = new_bar(
            total as u64,
            styled,
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} pairs {elapsed_precise} {msg}",
        )?;
        let mut rx = events.subscribe();
        let task_bar = bar.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                match event {
                    EngineEvent::RunStarted { workflow_id, model, .. } => {
                        task_bar.set_message(format!("{workflow_id} x {}", model.unwrap_or_default()));
                    }
                    EngineEvent::PairCompleted {
                        completed, total, ..
                    } => {
                        task_bar.set_length(total as u64);
                        task_bar.set_position(completed as u64);
                    }
                    _ => {}
                }
            }
        });
        Ok(Self { bar, task })
    }

    pub async fn finish(self) {
        self.task.abort();
        let _ = self.task.await;
        self.bar.finish_and_clear();
    }
}

fn new_bar(len: u64, styled: bool, template: &str) -> anyhow::Result<ProgressBar> {
    if !styled {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(len);
    bar.set_style(ProgressStyle::default_bar().template(template)?.progress_chars("=> "));
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    Ok(bar)
}
