//! Persisted tunnel session rows

use chrono::{DateTime, Utc};
use outpost_db::entities::tunnel_session::{ActiveModel, Column, Entity, Model};
use outpost_db::SessionStatus;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

pub(crate) async fn insert(
    db: &DatabaseConnection,
    id: &str,
    agent_id: &str,
    local_port: u16,
    now: DateTime<Utc>,
) -> Result<Model, DbErr> {
    ActiveModel {
        id: Set(id.to_string()),
        agent_id: Set(agent_id.to_string()),
        local_port: Set(i32::from(local_port)),
        process_id: Set(None),
        proxy_binding_id: Set(None),
        status: Set(SessionStatus::Requested),
        failure_reason: Set(None),
        created_at: Set(now),
        last_activity_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
}

pub(crate) async fn find(db: &DatabaseConnection, id: &str) -> Result<Option<Model>, DbErr> {
    Entity::find_by_id(id.to_string()).one(db).await
}

/// Sessions in any of `statuses`, oldest first
pub(crate) async fn with_status(
    db: &DatabaseConnection,
    statuses: &[SessionStatus],
    agent_id: Option<&str>,
) -> Result<Vec<Model>, DbErr> {
    let mut query = Entity::find().filter(Column::Status.is_in(statuses.iter().copied()));
    if let Some(agent_id) = agent_id {
        query = query.filter(Column::AgentId.eq(agent_id));
    }
    query.order_by_asc(Column::CreatedAt).all(db).await
}

pub(crate) async fn non_terminal(db: &DatabaseConnection) -> Result<Vec<Model>, DbErr> {
    Entity::find()
        .filter(Column::Status.ne(SessionStatus::Terminated))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await
}

/// Move a session from `from` to `to`; false if it was no longer in `from`
pub(crate) async fn compare_and_set(
    db: &DatabaseConnection,
    id: &str,
    from: SessionStatus,
    to: SessionStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let mut update = Entity::update_many()
        .col_expr(Column::Status, Expr::value(to.as_str()))
        .col_expr(Column::UpdatedAt, Expr::value(now));
    if let Some(reason) = reason {
        update = update.col_expr(Column::FailureReason, Expr::value(reason.to_string()));
    }

    let result = update
        .filter(Column::Id.eq(id))
        .filter(Column::Status.eq(from))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub(crate) async fn set_process(
    db: &DatabaseConnection,
    id: &str,
    pid: Option<i32>,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    Entity::update_many()
        .col_expr(Column::ProcessId, Expr::value(pid))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

pub(crate) async fn set_binding(
    db: &DatabaseConnection,
    id: &str,
    binding_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    Entity::update_many()
        .col_expr(
            Column::ProxyBindingId,
            Expr::value(binding_id.map(str::to_string)),
        )
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Refresh `last_activity_at` of a live session and make it `active` again
pub(crate) async fn record_activity(
    db: &DatabaseConnection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(SessionStatus::Active.as_str()))
        .col_expr(Column::LastActivityAt, Expr::value(now))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::Id.eq(id))
        .filter(Column::Status.is_in([SessionStatus::Active, SessionStatus::Idle]))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Delete terminated sessions last updated before `cutoff`
pub(crate) async fn purge_terminated(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let result = Entity::delete_many()
        .filter(Column::Status.eq(SessionStatus::Terminated))
        .filter(Column::UpdatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Non-terminal sessions leasing `local_port`
pub(crate) async fn holding_port(
    db: &DatabaseConnection,
    local_port: u16,
) -> Result<Vec<Model>, DbErr> {
    Entity::find()
        .filter(Column::LocalPort.eq(i32::from(local_port)))
        .filter(Column::Status.ne(SessionStatus::Terminated))
        .all(db)
        .await
}
