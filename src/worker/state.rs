//! Job state machine.

use serde::{Deserialize, Serialize};

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is queued, possibly waiting out a backoff.
    Idle,
    /// An attempt is in flight.
    Running,
    /// The result handle has been assigned. Terminal.
    Settled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Idle (queued jobs can also be settled by a pool abort)
            (Idle, Running) | (Idle, Settled) |
            // From Running
            (Running, Idle) | (Running, Settled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Settled => "settled",
        };
        write!(f, "{s}")
    }
}
