//! Grace periods and retention windows used by the housekeeper

use chrono::{DateTime, Duration, Utc};

/// When a live task counts as stuck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckPolicy {
    /// Max time a task may wait in `pending`, measured from `created_at`
    pub pending_grace: Duration,
    /// Max time a task may sit in `sent`, measured from delivery (`updated_at`)
    pub sent_grace: Duration,
}

impl StuckPolicy {
    pub fn pending_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.pending_grace
    }

    pub fn sent_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.sent_grace
    }
}

impl Default for StuckPolicy {
    fn default() -> Self {
        Self {
            pending_grace: Duration::hours(1),
            sent_grace: Duration::minutes(30),
        }
    }
}

/// How long terminal tasks are kept, measured from when they became terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_retention: Duration,
    /// Applies to `failed` and `cancelled`
    pub failed_retention: Duration,
}

impl RetentionPolicy {
    pub fn from_days(completed_days: i64, failed_days: i64) -> Self {
        Self {
            completed_retention: Duration::days(completed_days),
            failed_retention: Duration::days(failed_days),
        }
    }

    pub fn completed_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.completed_retention
    }

    pub fn failed_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.failed_retention
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_days(7, 14)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let stuck = StuckPolicy::default();
        assert_eq!(stuck.pending_grace, Duration::hours(1));
        assert_eq!(stuck.sent_grace, Duration::minutes(30));

        let retention = RetentionPolicy::default();
        assert_eq!(retention.completed_retention, Duration::days(7));
        assert_eq!(retention.failed_retention, Duration::days(14));
    }

    #[test]
    fn test_cutoffs() {
        let now = Utc::now();
        let retention = RetentionPolicy::from_days(7, 14);
        assert_eq!(retention.completed_cutoff(now), now - Duration::days(7));
        assert_eq!(retention.failed_cutoff(now), now - Duration::days(14));
    }
}
