use serde::Serialize;

use crate::error::{JourneyError, JourneyResult};
use crate::journey::JourneyStatus;

/// Describes a single valid status transition for a journey.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StateTransition {
    pub from: JourneyStatus,
    pub to: JourneyStatus,
    pub trigger: &'static str,
}

const TRANSITIONS: &[StateTransition] = &[
    // Active ->
    StateTransition {
        from: JourneyStatus::Active,
        to: JourneyStatus::Paused,
        trigger: "suspend",
    },
    StateTransition {
        from: JourneyStatus::Active,
        to: JourneyStatus::Completed,
        trigger: "journey_complete",
    },
    StateTransition {
        from: JourneyStatus::Active,
        to: JourneyStatus::Exited,
        trigger: "exit",
    },
    StateTransition {
        from: JourneyStatus::Active,
        to: JourneyStatus::Errored,
        trigger: "processing_error",
    },
    // Paused ->
    StateTransition {
        from: JourneyStatus::Paused,
        to: JourneyStatus::Active,
        trigger: "resume",
    },
    StateTransition {
        from: JourneyStatus::Paused,
        to: JourneyStatus::Completed,
        trigger: "goal_met_while_paused",
    },
    StateTransition {
        from: JourneyStatus::Paused,
        to: JourneyStatus::Exited,
        trigger: "exit_while_paused",
    },
    StateTransition {
        from: JourneyStatus::Paused,
        to: JourneyStatus::Errored,
        trigger: "resume_error",
    },
];

/// Guards the journey lifecycle by enforcing a finite set of valid status
/// transitions. Terminal statuses have no outgoing edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct JourneyStateMachine;

impl JourneyStateMachine {
    pub fn transitions() -> &'static [StateTransition] {
        TRANSITIONS
    }

    /// Returns `true` if the given transition is allowed. Staying in a
    /// non-terminal status is always allowed.
    pub fn can_transition(from: JourneyStatus, to: JourneyStatus) -> bool {
        (from == to && !from.is_terminal())
            || TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// Moves `state` to `to`, or errors if the transition is not permitted.
    pub fn transition(state: &mut JourneyStatus, to: JourneyStatus) -> JourneyResult<()> {
        if Self::can_transition(*state, to) {
            *state = to;
            Ok(())
        } else {
            Err(JourneyError::InvalidTransition(format!(
                "from {:?} to {:?}",
                state, to
            )))
        }
    }
}
