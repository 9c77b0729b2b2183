//! HttpRequest entity: an HTTP call the agent performs against its local service

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::TaskStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "http_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub target_agent_id: String,

    #[sea_orm(column_type = "Text")]
    pub url: String,

    pub method: String,

    pub status: TaskStatus,

    /// Response body reported by the agent
    #[sea_orm(column_type = "Text", nullable)]
    pub response: Option<String>,

    pub delivery_id: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
