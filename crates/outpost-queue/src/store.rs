//! Row-level queue operations shared by both task tables
//!
//! Every status change is a conditional `UPDATE ... WHERE id = ? AND status IN (...)`,
//! so a transition either applies atomically or reports zero affected rows.

use chrono::{DateTime, Utc};
use outpost_db::entities::{command, http_request};
use outpost_db::TaskStatus;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};

use crate::task::{QueuedTask, TaskKind, TaskPayload};

/// Column mapping for a queue table
///
/// Rows are `Sync` so the queue futures stay `Send` across awaits.
pub(crate) trait QueueTable: EntityTrait<Model: Sync> {
    const KIND: TaskKind;

    fn id_col() -> Self::Column;
    fn agent_col() -> Self::Column;
    fn status_col() -> Self::Column;
    /// `output` for commands, `response` for HTTP requests
    fn output_col() -> Self::Column;
    fn delivery_col() -> Self::Column;
    fn created_col() -> Self::Column;
    fn updated_col() -> Self::Column;

    fn to_task(model: Self::Model) -> QueuedTask;
}

impl QueueTable for command::Entity {
    const KIND: TaskKind = TaskKind::Command;

    fn id_col() -> Self::Column {
        command::Column::Id
    }
    fn agent_col() -> Self::Column {
        command::Column::TargetAgentId
    }
    fn status_col() -> Self::Column {
        command::Column::Status
    }
    fn output_col() -> Self::Column {
        command::Column::Output
    }
    fn delivery_col() -> Self::Column {
        command::Column::DeliveryId
    }
    fn created_col() -> Self::Column {
        command::Column::CreatedAt
    }
    fn updated_col() -> Self::Column {
        command::Column::UpdatedAt
    }

    fn to_task(model: command::Model) -> QueuedTask {
        QueuedTask {
            kind: TaskKind::Command,
            id: model.id,
            agent_id: model.target_agent_id,
            payload: TaskPayload::Command {
                command: model.command,
            },
            status: model.status,
            output: model.output,
            delivery_id: model.delivery_id,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

impl QueueTable for http_request::Entity {
    const KIND: TaskKind = TaskKind::HttpRequest;

    fn id_col() -> Self::Column {
        http_request::Column::Id
    }
    fn agent_col() -> Self::Column {
        http_request::Column::TargetAgentId
    }
    fn status_col() -> Self::Column {
        http_request::Column::Status
    }
    fn output_col() -> Self::Column {
        http_request::Column::Response
    }
    fn delivery_col() -> Self::Column {
        http_request::Column::DeliveryId
    }
    fn created_col() -> Self::Column {
        http_request::Column::CreatedAt
    }
    fn updated_col() -> Self::Column {
        http_request::Column::UpdatedAt
    }

    fn to_task(model: http_request::Model) -> QueuedTask {
        QueuedTask {
            kind: TaskKind::HttpRequest,
            id: model.id,
            agent_id: model.target_agent_id,
            payload: TaskPayload::HttpRequest {
                url: model.url,
                method: model.method,
            },
            status: model.status,
            output: model.response,
            delivery_id: model.delivery_id,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Insert a new `pending` row in the table matching the payload kind
pub(crate) async fn insert<C: ConnectionTrait>(
    db: &C,
    id: &str,
    agent_id: &str,
    payload: TaskPayload,
    now: DateTime<Utc>,
) -> Result<QueuedTask, DbErr> {
    match payload {
        TaskPayload::Command { command } => {
            let model = command::ActiveModel {
                id: Set(id.to_string()),
                target_agent_id: Set(agent_id.to_string()),
                command: Set(command),
                status: Set(TaskStatus::Pending),
                output: Set(None),
                delivery_id: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            Ok(command::Entity::to_task(model))
        }
        TaskPayload::HttpRequest { url, method } => {
            let model = http_request::ActiveModel {
                id: Set(id.to_string()),
                target_agent_id: Set(agent_id.to_string()),
                url: Set(url),
                method: Set(method),
                status: Set(TaskStatus::Pending),
                response: Set(None),
                delivery_id: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await?;
            Ok(http_request::Entity::to_task(model))
        }
    }
}

/// Claim every pending task of `agent_id` under `delivery_id` and return them.
///
/// The claim is one statement; concurrent claims partition the pending rows
/// between them and each reads back only the rows carrying its own token.
pub(crate) async fn claim_pending<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    agent_id: &str,
    delivery_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<QueuedTask>, DbErr> {
    let claimed = E::update_many()
        .col_expr(E::status_col(), Expr::value(TaskStatus::Sent.as_str()))
        .col_expr(E::delivery_col(), Expr::value(delivery_id.to_string()))
        .col_expr(E::updated_col(), Expr::value(now))
        .filter(E::agent_col().eq(agent_id))
        .filter(E::status_col().eq(TaskStatus::Pending))
        .exec(db)
        .await?
        .rows_affected;

    if claimed == 0 {
        return Ok(Vec::new());
    }

    let models = E::find()
        .filter(E::delivery_col().eq(delivery_id))
        .order_by_asc(E::created_col())
        .all(db)
        .await?;

    Ok(models.into_iter().map(E::to_task).collect())
}

pub(crate) async fn find<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<Option<QueuedTask>, DbErr> {
    let model = E::find().filter(E::id_col().eq(id)).one(db).await?;
    Ok(model.map(E::to_task))
}

/// Newest first
pub(crate) async fn list<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    agent_id: Option<&str>,
    status: Option<TaskStatus>,
) -> Result<Vec<QueuedTask>, DbErr> {
    let mut query = E::find();
    if let Some(agent_id) = agent_id {
        query = query.filter(E::agent_col().eq(agent_id));
    }
    if let Some(status) = status {
        query = query.filter(E::status_col().eq(status));
    }

    let models = query.order_by_desc(E::created_col()).all(db).await?;
    Ok(models.into_iter().map(E::to_task).collect())
}

/// Compare-and-set the status of one task.
///
/// Applies only while the current status is one of `from` and the move is
/// an edge of the state machine. `output` is written when given. Returns
/// whether the row changed.
pub(crate) async fn transition<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    id: &str,
    from: &[TaskStatus],
    to: TaskStatus,
    output: Option<String>,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let from: Vec<TaskStatus> = from
        .iter()
        .copied()
        .filter(|status| status.can_transition_to(to))
        .collect();
    if from.is_empty() {
        return Ok(false);
    }

    let mut update = E::update_many()
        .col_expr(E::status_col(), Expr::value(to.as_str()))
        .col_expr(E::updated_col(), Expr::value(now));
    if let Some(output) = output {
        update = update.col_expr(E::output_col(), Expr::value(output));
    }

    let result = update
        .filter(E::id_col().eq(id))
        .filter(E::status_col().is_in(from))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Tasks the caller may delete: terminal, or delivered and silent since `sent_cutoff`
pub(crate) fn deletable<E: QueueTable>(sent_cutoff: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(E::status_col().is_in(
            TaskStatus::ALL.into_iter().filter(|status| status.is_terminal()),
        ))
        .add(
            Condition::all()
                .add(E::status_col().eq(TaskStatus::Sent))
                .add(E::updated_col().lt(sent_cutoff)),
        )
}

/// Delete one task if it matches `condition`; returns whether it was removed
pub(crate) async fn delete_if<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    id: &str,
    condition: Condition,
) -> Result<bool, DbErr> {
    let result = E::delete_many()
        .filter(E::id_col().eq(id))
        .filter(condition)
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Live tasks in `status` whose age column is older than `cutoff`
pub(crate) async fn older_than<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    status: TaskStatus,
    age_col: E::Column,
    cutoff: DateTime<Utc>,
) -> Result<Vec<QueuedTask>, DbErr> {
    let models = E::find()
        .filter(E::status_col().eq(status))
        .filter(age_col.lt(cutoff))
        .order_by_asc(E::created_col())
        .all(db)
        .await?;

    Ok(models.into_iter().map(E::to_task).collect())
}

/// Delete tasks in `status` that last changed before `cutoff`
pub(crate) async fn purge<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    status: TaskStatus,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let result = E::delete_many()
        .filter(E::status_col().eq(status))
        .filter(E::updated_col().lt(cutoff))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

pub(crate) async fn count<E: QueueTable, C: ConnectionTrait>(
    db: &C,
    condition: Condition,
) -> Result<u64, DbErr> {
    E::find().filter(condition).count(db).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_db() -> sea_orm::DatabaseConnection {
        let db = outpost_db::connect("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory database");
        outpost_db::migrate(&db).await.expect("Failed to run migrations");
        db
    }

    #[tokio::test]
    async fn test_transition_follows_state_machine() {
        let db = setup_db().await;
        let now = Utc::now();
        insert(&db, "t1", "A1", TaskPayload::command("show version"), now)
            .await
            .unwrap();

        // pending -> completed skips delivery; rejected even when the caller allows it
        let applied = transition::<command::Entity, _>(
            &db,
            "t1",
            &[TaskStatus::Pending],
            TaskStatus::Completed,
            Some("ok".to_string()),
            now,
        )
        .await
        .unwrap();
        assert!(!applied);

        let task = find::<command::Entity, _>(&db, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.output.is_none());

        let applied = transition::<command::Entity, _>(
            &db,
            "t1",
            &[TaskStatus::Pending],
            TaskStatus::Cancelled,
            None,
            now,
        )
        .await
        .unwrap();
        assert!(applied);

        // Terminal rows never move again
        let applied = transition::<command::Entity, _>(
            &db,
            "t1",
            &TaskStatus::ALL,
            TaskStatus::Failed,
            None,
            now,
        )
        .await
        .unwrap();
        assert!(!applied);
    }
}
