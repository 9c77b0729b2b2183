//! Task dispatcher: the operations callers and polling agents invoke

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_db::entities::{command, http_request};
use outpost_db::TaskStatus;
use sea_orm::{
    AccessMode, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbBackend,
    IsolationLevel, TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::policy::{RetentionPolicy, StuckPolicy};
use crate::store::{self, QueueTable};
use crate::summary::{KindSummary, PurgeReport, QueueSummary, StatusCounts, StuckReport};
use crate::task::{validate_agent_id, QueuedTask, ReportOutcome, TaskKind, TaskPayload};

const PENDING_TIMEOUT_OUTPUT: &str = "timed out: agent did not poll within the grace period";
const SENT_TIMEOUT_OUTPUT: &str = "timed out: agent did not report a result within the grace period";

/// Lookup of agents that may receive work
#[async_trait]
pub trait KnownAgents: Send + Sync {
    async fn is_known(&self, agent_id: &str) -> bool;
}

/// Queue front end shared by the API, the housekeeper and the CLI
#[derive(Clone)]
pub struct TaskDispatcher {
    db: DatabaseConnection,
    agents: Arc<dyn KnownAgents>,
    stuck: StuckPolicy,
    retention: RetentionPolicy,
}

impl TaskDispatcher {
    pub fn new(db: DatabaseConnection, agents: Arc<dyn KnownAgents>) -> Self {
        Self {
            db,
            agents,
            stuck: StuckPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_stuck_policy(mut self, stuck: StuckPolicy) -> Self {
        self.stuck = stuck;
        self
    }

    pub fn with_retention_policy(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn stuck_policy(&self) -> StuckPolicy {
        self.stuck
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.retention
    }

    /// Queue a task for `agent_id` with status `pending`
    pub async fn enqueue(
        &self,
        agent_id: &str,
        payload: TaskPayload,
    ) -> Result<QueuedTask, QueueError> {
        validate_agent_id(agent_id)?;
        let payload = payload.validated()?;

        if !self.agents.is_known(agent_id).await {
            return Err(QueueError::InvalidInput(format!(
                "Unknown agent: {}",
                agent_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let task = store::insert(&self.db, &id, agent_id, payload, Utc::now()).await?;

        info!(
            target: "outpost::task",
            kind = %task.kind,
            task_id = %task.id,
            agent_id = %task.agent_id,
            to = %task.status,
            "Task enqueued"
        );
        Ok(task)
    }

    /// Hand every pending task of `agent_id` to the caller, marking it `sent`.
    ///
    /// Commands come first, then HTTP requests; within a kind, oldest first.
    /// All tasks of one poll share a `delivery_id`.
    pub async fn poll(&self, agent_id: &str) -> Result<Vec<QueuedTask>, QueueError> {
        validate_agent_id(agent_id)?;

        let delivery_id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();

        let mut tasks =
            store::claim_pending::<command::Entity, _>(&self.db, agent_id, &delivery_id, now)
                .await?;
        tasks.extend(
            store::claim_pending::<http_request::Entity, _>(
                &self.db,
                agent_id,
                &delivery_id,
                now,
            )
            .await?,
        );

        for task in &tasks {
            info!(
                target: "outpost::task",
                kind = %task.kind,
                task_id = %task.id,
                agent_id = %task.agent_id,
                delivery_id = %delivery_id,
                from = %TaskStatus::Pending,
                to = %TaskStatus::Sent,
                "Task delivered"
            );
        }
        debug!(agent_id, delivered = tasks.len(), "Poll served");

        Ok(tasks)
    }

    /// Record the agent's result for a delivered task.
    ///
    /// A report for a task that is no longer `sent` is stale; it is logged and
    /// returned as [`QueueError::InvalidState`] without touching the task.
    pub async fn report(
        &self,
        kind: TaskKind,
        id: &str,
        outcome: ReportOutcome,
        output: Option<String>,
    ) -> Result<QueuedTask, QueueError> {
        match kind {
            TaskKind::Command => self.report_in::<command::Entity>(id, outcome, output).await,
            TaskKind::HttpRequest => {
                self.report_in::<http_request::Entity>(id, outcome, output)
                    .await
            }
        }
    }

    async fn report_in<E: QueueTable>(
        &self,
        id: &str,
        outcome: ReportOutcome,
        output: Option<String>,
    ) -> Result<QueuedTask, QueueError> {
        let to = outcome.status();
        let applied =
            store::transition::<E, _>(&self.db, id, &[TaskStatus::Sent], to, output, Utc::now())
                .await?;

        if !applied {
            let err = self.rejection::<E>(id, "report").await?;
            if let QueueError::InvalidState { current, .. } = &err {
                warn!(
                    target: "outpost::task",
                    kind = %E::KIND,
                    task_id = %id,
                    current = %current,
                    "Stale report ignored"
                );
            }
            return Err(err);
        }

        let task = self.fetch::<E>(id).await?;
        info!(
            target: "outpost::task",
            kind = %task.kind,
            task_id = %task.id,
            agent_id = %task.agent_id,
            from = %TaskStatus::Sent,
            to = %task.status,
            reason = "reported",
            "Task finished"
        );
        Ok(task)
    }

    /// Withdraw a task that has not been delivered yet
    pub async fn cancel(&self, kind: TaskKind, id: &str) -> Result<QueuedTask, QueueError> {
        match kind {
            TaskKind::Command => self.cancel_in::<command::Entity>(id).await,
            TaskKind::HttpRequest => self.cancel_in::<http_request::Entity>(id).await,
        }
    }

    async fn cancel_in<E: QueueTable>(&self, id: &str) -> Result<QueuedTask, QueueError> {
        let applied = store::transition::<E, _>(
            &self.db,
            id,
            &[TaskStatus::Pending],
            TaskStatus::Cancelled,
            None,
            Utc::now(),
        )
        .await?;

        if !applied {
            return Err(self.rejection::<E>(id, "cancel").await?);
        }

        let task = self.fetch::<E>(id).await?;
        info!(
            target: "outpost::task",
            kind = %task.kind,
            task_id = %task.id,
            agent_id = %task.agent_id,
            from = %TaskStatus::Pending,
            to = %TaskStatus::Cancelled,
            "Task cancelled"
        );
        Ok(task)
    }

    /// Remove a task that is terminal, or `sent` past the sent grace period
    pub async fn delete(&self, kind: TaskKind, id: &str) -> Result<(), QueueError> {
        self.delete_at(kind, id, Utc::now()).await
    }

    pub async fn delete_at(
        &self,
        kind: TaskKind,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        match kind {
            TaskKind::Command => self.delete_in::<command::Entity>(id, now).await,
            TaskKind::HttpRequest => self.delete_in::<http_request::Entity>(id, now).await,
        }
    }

    async fn delete_in<E: QueueTable>(&self, id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let condition = store::deletable::<E>(self.stuck.sent_cutoff(now));
        if !store::delete_if::<E, _>(&self.db, id, condition).await? {
            return Err(self.rejection::<E>(id, "delete").await?);
        }

        info!(target: "outpost::task", kind = %E::KIND, task_id = %id, "Task deleted");
        Ok(())
    }

    pub async fn get(&self, kind: TaskKind, id: &str) -> Result<QueuedTask, QueueError> {
        match kind {
            TaskKind::Command => self.fetch::<command::Entity>(id).await,
            TaskKind::HttpRequest => self.fetch::<http_request::Entity>(id).await,
        }
    }

    /// Tasks of one kind, newest first, optionally filtered
    pub async fn list(
        &self,
        kind: TaskKind,
        agent_id: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<QueuedTask>, QueueError> {
        let tasks = match kind {
            TaskKind::Command => {
                store::list::<command::Entity, _>(&self.db, agent_id, status).await?
            }
            TaskKind::HttpRequest => {
                store::list::<http_request::Entity, _>(&self.db, agent_id, status).await?
            }
        };
        Ok(tasks)
    }

    /// Per-status counts plus purge-eligible and stuck counts.
    ///
    /// All counts are read from one read-only snapshot so a task moving
    /// between statuses is never counted twice or missed.
    pub async fn summary(&self, now: DateTime<Utc>) -> Result<QueueSummary, QueueError> {
        let txn = match self.db.get_database_backend() {
            // SQLite transactions are already serializable
            DbBackend::Sqlite => self.db.begin().await?,
            // Postgres defaults to READ COMMITTED, where every statement sees a new snapshot
            _ => {
                self.db
                    .begin_with_config(
                        Some(IsolationLevel::RepeatableRead),
                        Some(AccessMode::ReadOnly),
                    )
                    .await?
            }
        };
        let commands = self.kind_summary::<command::Entity, _>(&txn, now).await?;
        let http_requests = self.kind_summary::<http_request::Entity, _>(&txn, now).await?;
        txn.commit().await?;

        let mut totals = StatusCounts::default();
        totals.merge(&commands.counts);
        totals.merge(&http_requests.counts);

        Ok(QueueSummary {
            purge_eligible: commands.purge_eligible + http_requests.purge_eligible,
            stuck: commands.stuck + http_requests.stuck,
            commands,
            http_requests,
            totals,
        })
    }

    async fn kind_summary<E: QueueTable, C: sea_orm::ConnectionTrait>(
        &self,
        db: &C,
        now: DateTime<Utc>,
    ) -> Result<KindSummary, QueueError> {
        let mut counts = StatusCounts::default();
        for status in TaskStatus::ALL {
            let n = store::count::<E, _>(db, Condition::all().add(E::status_col().eq(status)))
                .await?;
            counts.add(status, n);
        }

        let purge_eligible = store::count::<E, _>(db, purge_condition::<E>(&self.retention, now))
            .await?;
        let stuck = store::count::<E, _>(db, stuck_condition::<E>(&self.stuck, now)).await?;

        Ok(KindSummary {
            kind: E::KIND,
            counts,
            purge_eligible,
            stuck,
        })
    }

    /// Force stuck `pending`/`sent` tasks to `failed` with a timeout output
    pub async fn fail_stuck(&self, now: DateTime<Utc>) -> Result<StuckReport, QueueError> {
        let mut report = self.fail_stuck_in::<command::Entity>(now).await?;
        report.merge(&self.fail_stuck_in::<http_request::Entity>(now).await?);
        Ok(report)
    }

    async fn fail_stuck_in<E: QueueTable>(
        &self,
        now: DateTime<Utc>,
    ) -> Result<StuckReport, QueueError> {
        let mut report = StuckReport::default();

        let sweeps = [
            (
                TaskStatus::Pending,
                E::created_col(),
                self.stuck.pending_cutoff(now),
                PENDING_TIMEOUT_OUTPUT,
            ),
            (
                TaskStatus::Sent,
                E::updated_col(),
                self.stuck.sent_cutoff(now),
                SENT_TIMEOUT_OUTPUT,
            ),
        ];

        for (status, age_col, cutoff, output) in sweeps {
            let candidates = store::older_than::<E, _>(&self.db, status, age_col, cutoff).await?;
            for task in candidates {
                // A report or poll may have moved the task since it was read
                let applied = store::transition::<E, _>(
                    &self.db,
                    &task.id,
                    &[status],
                    TaskStatus::Failed,
                    Some(output.to_string()),
                    now,
                )
                .await?;
                if !applied {
                    continue;
                }

                info!(
                    target: "outpost::task",
                    kind = %task.kind,
                    task_id = %task.id,
                    agent_id = %task.agent_id,
                    from = %status,
                    to = %TaskStatus::Failed,
                    reason = "timed_out",
                    "Stuck task failed"
                );
                match status {
                    TaskStatus::Pending => report.pending_timed_out += 1,
                    _ => report.sent_timed_out += 1,
                }
            }
        }

        Ok(report)
    }

    /// Delete terminal tasks older than the windows in `policy`
    pub async fn purge(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<PurgeReport, QueueError> {
        let mut report = self.purge_in::<command::Entity>(now, policy).await?;
        report.merge(&self.purge_in::<http_request::Entity>(now, policy).await?);
        Ok(report)
    }

    async fn purge_in<E: QueueTable>(
        &self,
        now: DateTime<Utc>,
        policy: &RetentionPolicy,
    ) -> Result<PurgeReport, QueueError> {
        let completed_cutoff = policy.completed_cutoff(now);
        let failed_cutoff = policy.failed_cutoff(now);

        let report = PurgeReport {
            completed: store::purge::<E, _>(&self.db, TaskStatus::Completed, completed_cutoff)
                .await?,
            failed: store::purge::<E, _>(&self.db, TaskStatus::Failed, failed_cutoff).await?,
            cancelled: store::purge::<E, _>(&self.db, TaskStatus::Cancelled, failed_cutoff)
                .await?,
        };

        if report.total() > 0 {
            debug!(
                kind = %E::KIND,
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
                "Purged terminal tasks"
            );
        }
        Ok(report)
    }

    async fn fetch<E: QueueTable>(&self, id: &str) -> Result<QueuedTask, QueueError> {
        store::find::<E, _>(&self.db, id)
            .await?
            .ok_or_else(|| QueueError::NotFound {
                kind: E::KIND,
                id: id.to_string(),
            })
    }

    /// Explain why a conditional write matched no row
    async fn rejection<E: QueueTable>(
        &self,
        id: &str,
        operation: &'static str,
    ) -> Result<QueueError, QueueError> {
        match store::find::<E, _>(&self.db, id).await? {
            Some(task) => Ok(QueueError::InvalidState {
                kind: E::KIND,
                id: id.to_string(),
                current: task.status,
                operation,
            }),
            None => Ok(QueueError::NotFound {
                kind: E::KIND,
                id: id.to_string(),
            }),
        }
    }
}

fn purge_condition<E: QueueTable>(policy: &RetentionPolicy, now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(
            Condition::all()
                .add(E::status_col().eq(TaskStatus::Completed))
                .add(E::updated_col().lt(policy.completed_cutoff(now))),
        )
        .add(
            Condition::all()
                .add(E::status_col().is_in([TaskStatus::Failed, TaskStatus::Cancelled]))
                .add(E::updated_col().lt(policy.failed_cutoff(now))),
        )
}

fn stuck_condition<E: QueueTable>(policy: &StuckPolicy, now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(
            Condition::all()
                .add(E::status_col().eq(TaskStatus::Pending))
                .add(E::created_col().lt(policy.pending_cutoff(now))),
        )
        .add(
            Condition::all()
                .add(E::status_col().eq(TaskStatus::Sent))
                .add(E::updated_col().lt(policy.sent_cutoff(now))),
        )
}

