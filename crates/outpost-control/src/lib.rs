//! Tunnel control plane
//!
//! Owns the local port pool, launches one outbound tunnel process per agent,
//! publishes it through the proxy registry and keeps the persisted
//! `tunnel_sessions` table consistent with the processes and bindings that
//! actually exist.

pub mod agent_registry;
pub mod config;
pub mod error;
pub mod launcher;
pub mod port_allocator;
pub mod probe;
pub mod session_manager;
mod sessions;

pub use agent_registry::{AgentDirectory, AgentFileError, AgentRecord, AgentRegistry};
pub use config::TunnelConfig;
pub use error::{LaunchError, ProbeError, TunnelError};
pub use launcher::{SshTunnelLauncher, TunnelLauncher, TunnelProcess, TunnelSpec};
pub use outpost_db::SessionStatus;
pub use port_allocator::{LeaseState, PortAllocator, PortLease};
pub use probe::{ConnectivityProbe, HttpProbe};
pub use session_manager::{
    purge_terminated_sessions, ExpiryReport, ReconcileReport, RestoreReport, SessionInfo,
    TunnelEndpoint, TunnelSessionManager,
};
