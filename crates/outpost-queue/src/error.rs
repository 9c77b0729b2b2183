use outpost_db::TaskStatus;
use thiserror::Error;

use crate::task::TaskKind;

/// Errors returned by the task dispatcher
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The task exists but its current status does not allow the operation
    #[error("Cannot {operation} {kind} {id}: task is {current}")]
    InvalidState {
        kind: TaskKind,
        id: String,
        current: TaskStatus,
        operation: &'static str,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: TaskKind, id: String },

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}
