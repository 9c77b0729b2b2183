use chrono::{DateTime, Utc};
use outpost_control::{ExpiryReport, ReconcileReport, TunnelSessionManager};
use outpost_queue::{PurgeReport, StuckReport, TaskDispatcher};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::config::HousekeeperConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sweep {
    StuckTasks,
    RetentionPurge,
    OrphanSweep,
    ExpirySweep,
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Sweep::StuckTasks => "stuck_tasks",
            Sweep::RetentionPurge => "retention_purge",
            Sweep::OrphanSweep => "orphan_sweep",
            Sweep::ExpirySweep => "expiry_sweep",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub sweep: Sweep,
    pub error: String,
}

/// Outcome of one housekeeper run. A `None` section means that sweep failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub stuck: Option<StuckReport>,
    pub purged_tasks: Option<PurgeReport>,
    pub purged_sessions: Option<u64>,
    pub reconcile: Option<ReconcileReport>,
    pub expiry: Option<ExpiryReport>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<T, E: fmt::Display>(&mut self, sweep: Sweep, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    target: "outpost::housekeeper",
                    sweep = %sweep,
                    error = %e,
                    "Sweep failed, retrying on next run"
                );
                self.failures.push(SweepFailure {
                    sweep,
                    error: e.to_string(),
                });
                None
            }
        }
    }
}

pub struct Housekeeper {
    dispatcher: TaskDispatcher,
    sessions: Arc<TunnelSessionManager>,
    config: HousekeeperConfig,
}

impl Housekeeper {
    pub fn new(
        dispatcher: TaskDispatcher,
        sessions: Arc<TunnelSessionManager>,
        config: HousekeeperConfig,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            config,
        }
    }

    pub async fn run_once(&self) -> SweepReport {
        self.run_once_at(Utc::now()).await
    }

    /// Run every sweep as of `now`. Never fails; failures are in the report.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let stuck = self.dispatcher.fail_stuck(now).await;
        report.stuck = report.record(Sweep::StuckTasks, stuck);
        if let Some(stuck) = report.stuck {
            info!(
                target: "outpost::housekeeper",
                sweep = %Sweep::StuckTasks,
                pending_timed_out = stuck.pending_timed_out,
                sent_timed_out = stuck.sent_timed_out,
                "Sweep finished"
            );
        }

        let retention = self.dispatcher.retention_policy();
        let purged = self.dispatcher.purge(now, &retention).await;
        report.purged_tasks = report.record(Sweep::RetentionPurge, purged);
        let purged_sessions = self
            .sessions
            .purge_terminated(now, self.config.session_retention)
            .await;
        report.purged_sessions = report.record(Sweep::RetentionPurge, purged_sessions);
        if let (Some(tasks), Some(sessions)) = (report.purged_tasks, report.purged_sessions) {
            info!(
                target: "outpost::housekeeper",
                sweep = %Sweep::RetentionPurge,
                completed = tasks.completed,
                failed = tasks.failed,
                cancelled = tasks.cancelled,
                sessions,
                "Sweep finished"
            );
        }

        let reconcile = self.sessions.reconcile().await;
        report.reconcile = report.record(Sweep::OrphanSweep, reconcile);
        if let Some(reconcile) = report.reconcile {
            info!(
                target: "outpost::housekeeper",
                sweep = %Sweep::OrphanSweep,
                killed_processes = reconcile.killed_processes,
                orphaned_sessions = reconcile.orphaned_sessions,
                finished_teardowns = reconcile.finished_teardowns,
                removed_bindings = reconcile.removed_bindings,
                released_leases = reconcile.released_leases,
                failures = reconcile.failures,
                "Sweep finished"
            );
        }

        let expiry = self.sessions.expire_sessions(now).await;
        report.expiry = report.record(Sweep::ExpirySweep, expiry);
        if let Some(expiry) = report.expiry {
            info!(
                target: "outpost::housekeeper",
                sweep = %Sweep::ExpirySweep,
                expired = expiry.expired,
                idled = expiry.idled,
                failures = expiry.failures,
                "Sweep finished"
            );
        }

        report
    }

    /// Run on the configured interval until the returned task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                target: "outpost::housekeeper",
                interval_secs = self.config.interval.as_secs(),
                "Housekeeper started"
            );

            loop {
                interval.tick().await;
                let report = self.run_once().await;
                if !report.is_clean() {
                    error!(
                        target: "outpost::housekeeper",
                        failed_sweeps = report.failures.len(),
                        "Housekeeper run finished with failures"
                    );
                }
            }
        })
    }
}
