use outpost_db::SessionStatus;
use thiserror::Error;

/// Errors returned by the tunnel session manager
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot {operation} session {session_id}: session is {current}")]
    InvalidState {
        session_id: String,
        current: SessionStatus,
        operation: &'static str,
    },

    #[error("Tunnel session not found: {0}")]
    NotFound(String),

    #[error("No free port in {range_start}-{range_end}")]
    PoolExhausted { range_start: u16, range_end: u16 },

    #[error("Tunnel to {agent_id} failed: {reason}")]
    ConnectionFailed { agent_id: String, reason: String },

    #[error("Tunnel setup for {agent_id} did not finish within {timeout_ms}ms")]
    Timeout { agent_id: String, timeout_ms: u64 },

    /// A tunnel process could not be listed or stopped
    #[error("Tunnel process error: {0}")]
    Process(#[from] LaunchError),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

/// Tunnel process failures
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Worth one more attempt (process exited early, spawn hiccup)
    #[error("Transient launch failure: {0}")]
    Transient(String),

    #[error("Launch failed: {0}")]
    Fatal(String),

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LaunchError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("{addr} did not answer within {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },
}
