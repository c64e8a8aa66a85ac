//! Engine events broadcast during runs and sweeps.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{RunStatus, StepState};

/// Lifecycle events published on the engine event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
        model: Option<String>,
        step_count: usize,
    },

    StepStateChanged {
        run_id: Uuid,
        step_id: String,
        from: StepState,
        to: StepState,
        attempt: u32,
    },

    RunCompleted {
        run_id: Uuid,
        workflow_id: String,
        status: RunStatus,
        duration_ms: u64,
    },

    /// A sweep pair finished and its record was persisted.
    PairCompleted {
        workflow_id: String,
        model_id: String,
        run_status: RunStatus,
        completed: usize,
        total: usize,
    },
}

impl EngineEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::StepStateChanged { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. } => Some(*run_id),
            EngineEvent::PairCompleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_state_changed_serde() {
        let event = EngineEvent::StepStateChanged {
            run_id: Uuid::now_v7(),
            step_id: "draft".into(),
            from: StepState::Running,
            to: StepState::Failed,
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_state_changed\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_pair_completed_has_no_run_id() {
        let event = EngineEvent::PairCompleted {
            workflow_id: "w".into(),
            model_id: "m".into(),
            run_status: RunStatus::Succeeded,
            completed: 1,
            total: 4,
        };
        assert!(event.run_id().is_none());
    }
}
