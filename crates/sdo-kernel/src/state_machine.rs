//! Task lifecycle transition table

use crate::error::TransitionError;
use sdo_artifact::TaskState;

/// Validates a state transition.
///
/// With the `strict-debug` feature an illegal transition panics, which
/// surfaces orchestrator bugs at the call site during development.
pub fn validate_transition(from: TaskState, to: TaskState) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal state transition attempted: {from} -> {to}");

        #[cfg(not(feature = "strict-debug"))]
        Err(TransitionError::Illegal { from, to })
    }
}

/// Every state reachable in one step from `from`
#[must_use]
pub fn allowed_transitions(from: TaskState) -> &'static [TaskState] {
    use TaskState::*;
    match from {
        Pending => &[Planning, Failed, Abandoned],
        Planning => &[AwaitingPlanApproval, Failed, Abandoned],
        AwaitingPlanApproval => &[Developing, Planning, Failed, Abandoned],
        Developing => &[Reviewing, Failed, Abandoned],
        Reviewing => &[RetryDeveloping, AwaitingFinalApproval, Failed, Abandoned],
        RetryDeveloping => &[Reviewing, Failed, Abandoned],
        AwaitingFinalApproval => &[Finalizing, RetryDeveloping, Failed, Abandoned],
        Finalizing => &[Completed, Failed, Abandoned],
        Completed | Failed | Abandoned => &[],
    }
}

/// Name of the stage that runs in a working state
#[must_use]
pub fn stage_name(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "ingest",
        TaskState::Planning => "planning",
        TaskState::AwaitingPlanApproval => "plan_gate",
        TaskState::Developing | TaskState::RetryDeveloping => "development",
        TaskState::Reviewing => "review",
        TaskState::AwaitingFinalApproval => "final_gate",
        TaskState::Finalizing => "delivery",
        TaskState::Completed | TaskState::Failed | TaskState::Abandoned => "terminal",
    }
}
