//! Lifecycle status shared by the command and HTTP request queues
//!
//! ```text
//! pending ──> sent ──> completed
//!    │          └────> failed
//!    ├──> cancelled
//!    └──> failed   (housekeeper: stuck)
//! ```
//!
//! No transition leaves a terminal state.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet handed to the agent
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Delivered to the agent by a poll
    #[sea_orm(string_value = "sent")]
    Sent,

    /// Agent reported success
    #[sea_orm(string_value = "completed")]
    Completed,

    /// Agent reported failure, or the housekeeper timed the task out
    #[sea_orm(string_value = "failed")]
    Failed,

    /// Withdrawn by the caller before delivery
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Sent,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Sent => "sent",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the queue state machine.
    ///
    /// `pending -> failed` only happens through stuck detection.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Sent, Completed)
                | (Sent, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown task status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_sent_cannot_be_cancelled() {
        assert!(!TaskStatus::Sent.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_completion_requires_sent() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Sent.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_parse_round_trip() {
        assert_eq!("SENT".parse::<TaskStatus>().unwrap(), TaskStatus::Sent);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }
}
