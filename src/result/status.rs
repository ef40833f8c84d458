//! Task status state machine.

use serde::{Deserialize, Serialize};

use crate::result::record::TaskKind;

/// State of an executed unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Known to the store but not yet picked up by a worker.
    #[default]
    Pending,
    /// A worker has begun executing the unit.
    Started,
    /// The unit's body returned but the composite it roots is still
    /// running, or the unit reported intermediate progress.
    Progress,
    /// A delivery-level retry sent the unit back to a worker.
    Retry,
    /// Terminal: completed with a result.
    Success,
    /// Terminal and sticky: failed with a traceback.
    Failure,
    /// The execution engine revoked the unit before completion.
    Revoked,
}

impl TaskStatus {
    /// Whether the state machine allows moving from `self` to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Started) | (Pending, Revoked) |
            // A started unit can progress, finish either way, or be retried/revoked
            (Started, Progress) | (Started, Success) | (Started, Failure) |
            (Started, Retry) | (Started, Revoked) |
            (Progress, Success) | (Progress, Failure) | (Progress, Retry) |
            (Progress, Revoked) |
            // Retry sends the unit back to a worker
            (Retry, Started) | (Retry, Failure)
        )
    }

    /// Terminal states never transition again. Failure is additionally
    /// sticky at the store level: later writes cannot replace it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Resolve the status to store when a unit's terminal callback fires.
    ///
    /// A `Job`-kind unit returning Success only means its own body
    /// returned; children may still be executing, so the stored status is
    /// forced to [`TaskStatus::Progress`]. True Success for a job is
    /// written explicitly by its end bracket once all children completed.
    pub fn resolve_terminal(kind: TaskKind, reported: TaskStatus) -> TaskStatus {
        match (kind, reported) {
            (TaskKind::Job, TaskStatus::Success) => TaskStatus::Progress,
            (_, other) => other,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Progress => "PROGRESS",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Revoked => "REVOKED",
        };
        write!(f, "{s}")
    }
}
