use std::time::Duration;

/// Housekeeper schedule and session retention
///
/// Stuck-task grace periods and task retention windows live on the
/// [`outpost_queue::TaskDispatcher`] (`StuckPolicy` / `RetentionPolicy`) so a
/// manual purge uses the same windows as the scheduled one.
#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    /// Time between two runs
    pub interval: Duration,
    /// Terminated sessions older than this are deleted
    pub session_retention: chrono::Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            session_retention: chrono::Duration::days(14),
        }
    }
}
