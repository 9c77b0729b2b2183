//! TunnelSession entity: one outbound tunnel to an agent, exposed through a proxy binding

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::SessionStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub agent_id: String,

    /// Leased port from the configured pool
    pub local_port: i32,

    /// PID of the tunnel process, once spawned
    pub process_id: Option<i32>,

    /// Reverse proxy binding, once registered
    pub proxy_binding_id: Option<String>,

    pub status: SessionStatus,

    /// Why setup failed or why the session was torn down
    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    /// Refreshed by `touch` whenever the proxy sees traffic
    pub last_activity_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
