//! Command entity: an opaque shell command queued for an agent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::TaskStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "commands")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Agent that will execute the command
    pub target_agent_id: String,

    /// Command line, passed to the agent untouched
    #[sea_orm(column_type = "Text")]
    pub command: String,

    pub status: TaskStatus,

    /// Output reported by the agent (or the synthetic timeout message)
    #[sea_orm(column_type = "Text", nullable)]
    pub output: Option<String>,

    /// Token of the poll that claimed this task
    pub delivery_id: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    /// Stamped on every status transition
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
