//! Read-only reporting types: dashboard summary and housekeeping results

use outpost_db::TaskStatus;
use serde::{Deserialize, Serialize};

use crate::task::TaskKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Sent => self.sent += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
        self.total += count;
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        self.pending += other.pending;
        self.sent += other.sent;
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.total += other.total;
    }
}

/// Counts for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary {
    pub kind: TaskKind,
    pub counts: StatusCounts,
    /// Terminal tasks older than their retention window
    pub purge_eligible: u64,
    /// Live tasks past their grace period
    pub stuck: u64,
}

/// Snapshot used to drive dashboard badges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub commands: KindSummary,
    pub http_requests: KindSummary,
    pub totals: StatusCounts,
    pub purge_eligible: u64,
    pub stuck: u64,
}

/// Result of a retention purge, broken down by terminal status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn merge(&mut self, other: &PurgeReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// Result of stuck-task detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckReport {
    /// Timed out while waiting for a poll
    pub pending_timed_out: u64,
    /// Timed out while waiting for the agent's report
    pub sent_timed_out: u64,
}

impl StuckReport {
    pub fn total(&self) -> u64 {
        self.pending_timed_out + self.sent_timed_out
    }

    pub fn merge(&mut self, other: &StuckReport) {
        self.pending_timed_out += other.pending_timed_out;
        self.sent_timed_out += other.sent_timed_out;
    }
}
