//! Step lifecycle state machine.
//!
//! ```text
//! Pending -> Ready -> Running -> Succeeded
//!                             -> Failed -> Retrying -> Ready   (while retries remain)
//!                             -> Cancelled
//! Pending | Ready | Retrying -> Cancelled
//! Pending -> Failed                        (inputs cannot be resolved)
//! ```
//!
//! `Succeeded`, `Cancelled`, and `Failed` without a remaining retry are
//! terminal: nothing leaves them. Every accepted transition is appended to
//! the step's history. Rejected transitions leave the step untouched.

use chrono::Utc;
use flowbench_types::run::{StepFailure, StepRun, StepState, StepTransition};
use serde_json::Value;

/// A transition the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("illegal transition for step '{step_id}': {from} -> {to}")]
pub struct StateError {
    pub step_id: String,
    pub from: StepState,
    pub to: StepState,
}

/// Whether `step` may move to `to` from its current state.
pub fn can_transition(step: &StepRun, to: StepState) -> bool {
    use StepState::*;
    match (step.state, to) {
        (Pending, Ready | Failed | Cancelled) => true,
        (Ready, Running | Cancelled) => true,
        (Running, Succeeded | Failed | Cancelled) => true,
        (Failed, Retrying) => step.can_retry(),
        (Retrying, Ready | Cancelled) => true,
        _ => false,
    }
}

fn illegal(step: &StepRun, to: StepState) -> StateError {
    StateError {
        step_id: step.step_id.clone(),
        from: step.state,
        to,
    }
}

/// Apply a transition, recording it in the step's history.
pub fn transition(step: &mut StepRun, to: StepState) -> Result<StepTransition, StateError> {
    if !can_transition(step, to) {
        return Err(illegal(step, to));
    }
    let record = StepTransition {
        from: step.state,
        to,
        attempt: step.attempt,
        at: Utc::now(),
    };
    step.state = to;
    if step.is_terminal() {
        step.ended_at = Some(record.at);
    }
    step.transitions.push(record.clone());
    Ok(record)
}

/// `Pending | Retrying -> Ready` with freshly resolved inputs.
pub fn mark_ready(step: &mut StepRun, inputs: Value) -> Result<StepTransition, StateError> {
    let record = transition(step, StepState::Ready)?;
    step.inputs = Some(inputs);
    Ok(record)
}

/// `Ready -> Running`, starting the next attempt.
pub fn start(step: &mut StepRun) -> Result<StepTransition, StateError> {
    if !can_transition(step, StepState::Running) {
        return Err(illegal(step, StepState::Running));
    }
    step.attempt += 1;
    step.error = None;
    if step.started_at.is_none() {
        step.started_at = Some(Utc::now());
    }
    transition(step, StepState::Running)
}

/// `Running -> Succeeded` with the validated output.
pub fn succeed(step: &mut StepRun, output: Value) -> Result<StepTransition, StateError> {
    let record = transition(step, StepState::Succeeded)?;
    step.output = Some(output);
    Ok(record)
}

/// `Running -> Failed`. Whether the failure is terminal depends on the
/// remaining attempts and `failure.retryable`.
pub fn fail(step: &mut StepRun, failure: StepFailure) -> Result<StepTransition, StateError> {
    if step.state != StepState::Running || !can_transition(step, StepState::Failed) {
        return Err(illegal(step, StepState::Failed));
    }
    // Set before the transition so terminality is known when it is recorded.
    step.error = Some(failure);
    transition(step, StepState::Failed)
}

/// `Pending -> Failed` for a step that can never start, e.g. because its
/// inputs do not resolve. The failure is terminal regardless of attempts left.
pub fn reject(step: &mut StepRun, mut failure: StepFailure) -> Result<StepTransition, StateError> {
    if step.state != StepState::Pending {
        return Err(illegal(step, StepState::Failed));
    }
    failure.retryable = false;
    step.error = Some(failure);
    transition(step, StepState::Failed)
}

/// `Failed -> Retrying`, allowed only while a retryable attempt remains.
pub fn retry(step: &mut StepRun) -> Result<StepTransition, StateError> {
    transition(step, StepState::Retrying)
}

/// Cancel a non-terminal step, recording why.
pub fn cancel(step: &mut StepRun, reason: Option<StepFailure>) -> Result<StepTransition, StateError> {
    let record = transition(step, StepState::Cancelled)?;
    if reason.is_some() {
        step.error = reason;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbench_types::run::StepErrorKind;
    use serde_json::json;

    fn transient() -> StepFailure {
        StepFailure::new(StepErrorKind::Timeout, "slow", true)
    }

    fn run_attempt(step: &mut StepRun) {
        mark_ready(step, json!({})).unwrap();
        start(step).unwrap();
    }

    #[test]
    fn test_happy_path() {
        let mut step = StepRun::new("a", 1, false);
        run_attempt(&mut step);
        assert_eq!(step.attempt, 1);
        assert!(step.started_at.is_some());
        succeed(&mut step, json!({ "text": "ok" })).unwrap();
        assert_eq!(step.state, StepState::Succeeded);
        assert!(step.is_terminal());
        assert!(step.ended_at.is_some());
        assert_eq!(step.transitions.len(), 3);
    }

    #[test]
    fn test_three_attempts_retry_exactly_twice() {
        let mut step = StepRun::new("a", 3, false);
        let mut retries = 0;
        loop {
            run_attempt(&mut step);
            fail(&mut step, transient()).unwrap();
            if step.can_retry() {
                retry(&mut step).unwrap();
                retries += 1;
            } else {
                break;
            }
        }
        assert_eq!(retries, 2);
        assert_eq!(step.retries(), 2);
        assert_eq!(step.attempt, 3);
        assert_eq!(step.state, StepState::Failed);
        assert!(step.is_terminal());
        assert!(retry(&mut step).is_err());

        let path: Vec<(StepState, StepState)> =
            step.transitions.iter().map(|t| (t.from, t.to)).collect();
        let retry_cycles = path
            .windows(3)
            .filter(|w| {
                w[0] == (StepState::Running, StepState::Failed)
                    && w[1] == (StepState::Failed, StepState::Retrying)
                    && w[2] == (StepState::Retrying, StepState::Ready)
            })
            .count();
        assert_eq!(retry_cycles, 2);
    }

    #[test]
    fn test_non_retryable_failure_is_terminal() {
        let mut step = StepRun::new("a", 3, false);
        run_attempt(&mut step);
        fail(
            &mut step,
            StepFailure::new(StepErrorKind::ContractViolation, "bad", false),
        )
        .unwrap();
        assert!(step.is_terminal());
        assert!(!can_transition(&step, StepState::Retrying));
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let mut done = StepRun::new("a", 1, false);
        run_attempt(&mut done);
        succeed(&mut done, json!({})).unwrap();

        let mut cancelled = StepRun::new("b", 1, false);
        cancel(&mut cancelled, None).unwrap();

        for step in [&mut done, &mut cancelled] {
            let before = step.clone();
            for to in [
                StepState::Pending,
                StepState::Ready,
                StepState::Running,
                StepState::Succeeded,
                StepState::Failed,
                StepState::Retrying,
                StepState::Cancelled,
            ] {
                assert!(transition(step, to).is_err(), "{} -> {to}", before.state);
            }
            assert_eq!(*step, before);
        }
    }

    #[test]
    fn test_pending_cannot_run_directly() {
        let mut step = StepRun::new("a", 1, false);
        let err = start(&mut step).unwrap_err();
        assert_eq!(err.from, StepState::Pending);
        assert_eq!(err.to, StepState::Running);
        assert_eq!(step.attempt, 0);
        assert!(step.transitions.is_empty());
    }

    #[test]
    fn test_cancel_records_reason() {
        let mut step = StepRun::new("c", 1, false);
        cancel(
            &mut step,
            Some(StepFailure::new(
                StepErrorKind::Cancelled,
                "dependency 'b' failed",
                false,
            )),
        )
        .unwrap();
        assert_eq!(step.state, StepState::Cancelled);
        assert_eq!(step.error.as_ref().unwrap().kind, StepErrorKind::Cancelled);
        assert!(step.ended_at.is_some());
    }

    #[test]
    fn test_fail_from_pending_is_rejected_without_side_effects() {
        let mut step = StepRun::new("a", 3, false);
        assert!(fail(&mut step, transient()).is_err());
        assert!(step.error.is_none());
    }

    #[test]
    fn test_reject_fails_pending_step_terminally() {
        let mut step = StepRun::new("b", 3, false);
        reject(
            &mut step,
            StepFailure::new(StepErrorKind::UnresolvedInput, "no field 'nope'", true),
        )
        .unwrap();
        assert_eq!(step.state, StepState::Failed);
        assert!(step.is_terminal());
        assert!(!step.can_retry());
        assert!(step.ended_at.is_some());
        assert_eq!(step.attempt, 0);
        assert_eq!(step.error.as_ref().unwrap().kind, StepErrorKind::UnresolvedInput);
        assert_eq!(
            step.transitions.iter().map(|t| (t.from, t.to)).collect::<Vec<_>>(),
            vec![(StepState::Pending, StepState::Failed)]
        );
    }

    #[test]
    fn test_reject_only_applies_to_pending_steps() {
        let mut step = StepRun::new("b", 1, false);
        run_attempt(&mut step);
        let err = reject(
            &mut step,
            StepFailure::new(StepErrorKind::UnresolvedInput, "late", false),
        )
        .unwrap_err();
        assert_eq!(err.from, StepState::Running);
        assert_eq!(step.state, StepState::Running);
        assert!(step.error.is_none());
    }
}
