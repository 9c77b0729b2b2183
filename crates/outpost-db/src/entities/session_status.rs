//! Tunnel session lifecycle
//!
//! ```text
//! requested -> establishing -> active <-> idle -> expired -> terminated
//!                    └-> failed -> terminated
//! active | idle -> orphaned -> terminated
//! active | idle -> terminated            (explicit disconnect)
//! ```

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[sea_orm(string_value = "requested")]
    Requested,

    /// Port leased, tunnel process / proxy binding / probe in progress
    #[sea_orm(string_value = "establishing")]
    Establishing,

    #[sea_orm(string_value = "active")]
    Active,

    /// No traffic observed for a while; still usable
    #[sea_orm(string_value = "idle")]
    Idle,

    /// Idle timeout or max lifetime reached
    #[sea_orm(string_value = "expired")]
    Expired,

    /// Setup failed
    #[sea_orm(string_value = "failed")]
    Failed,

    /// Record and process table disagreed
    #[sea_orm(string_value = "orphaned")]
    Orphaned,

    #[sea_orm(string_value = "terminated")]
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Requested => "requested",
            SessionStatus::Establishing => "establishing",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Expired => "expired",
            SessionStatus::Failed => "failed",
            SessionStatus::Orphaned => "orphaned",
            SessionStatus::Terminated => "terminated",
        }
    }

    /// Sessions that serve traffic and may be reused by `connect`
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Terminated)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Requested, Establishing)
                | (Requested, Failed)
                | (Establishing, Active)
                | (Establishing, Failed)
                | (Active, Idle)
                | (Idle, Active)
                | (Active, Expired)
                | (Idle, Expired)
                | (Active, Orphaned)
                | (Idle, Orphaned)
                | (Active, Terminated)
                | (Idle, Terminated)
                | (Expired, Terminated)
                | (Failed, Terminated)
                | (Orphaned, Terminated)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn test_terminated_is_final() {
        for next in SessionStatus::iter() {
            assert!(!SessionStatus::Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn test_failed_setup_path() {
        assert!(SessionStatus::Establishing.can_transition_to(SessionStatus::Failed));
        assert!(SessionStatus::Failed.can_transition_to(SessionStatus::Terminated));
        assert!(!SessionStatus::Establishing.can_transition_to(SessionStatus::Idle));
    }

    #[test]
    fn test_idle_and_active_flip() {
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Idle));
        assert!(SessionStatus::Idle.can_transition_to(SessionStatus::Active));
    }
}
