//! Tunnel session manager
//!
//! Orchestrates one tunnel per agent:
//!
//! ```text
//! connect:  reuse live session, or pre-flight cleanup -> lease port -> launch
//!           tunnel (retry once) -> bind proxy -> probe -> active
//! failure:  unbind -> stop process -> release port -> failed -> terminated
//! ```
//!
//! Calls touching the same agent are serialized by a per-agent lock, so two
//! concurrent `connect`s converge on one session. Port leases are serialized
//! by the [`PortAllocator`]. Session rows change status only through
//! compare-and-set updates, so `touch` can run without the agent lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outpost_db::entities::tunnel_session::Model;
use outpost_db::SessionStatus;
use outpost_router::{BindingError, ProxyBinding, ProxyRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent_registry::AgentDirectory;
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::launcher::{TunnelLauncher, TunnelProcess, TunnelSpec};
use crate::port_allocator::{LeaseState, PortAllocator};
use crate::probe::ConnectivityProbe;
use crate::sessions;

/// How many times a teardown re-reads a session that changed under it
const TEARDOWN_ATTEMPTS: usize = 3;

/// Returned by `connect`: where the caller should be sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub session_id: String,
    pub agent_id: String,
    pub local_port: u16,
    pub binding_id: String,
    pub public_url: String,
    /// An existing session was returned
    pub reused: bool,
    pub created_at: DateTime<Utc>,
    /// Earliest of the idle and lifetime deadlines, as of now
    pub expires_at: DateTime<Utc>,
}

/// Read model of a tunnel session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub agent_id: String,
    pub local_port: u16,
    pub process_id: Option<u32>,
    pub proxy_binding_id: Option<String>,
    pub public_url: Option<String>,
    pub status: SessionStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub expired: u64,
    pub idled: u64,
    /// Sessions whose teardown failed; retried on the next sweep
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Tunnel processes with no session, killed
    pub killed_processes: u64,
    /// Live sessions with no process or binding, torn down
    pub orphaned_sessions: u64,
    /// Sessions left half torn down, finished
    pub finished_teardowns: u64,
    /// Proxy bindings with no live session, removed
    pub removed_bindings: u64,
    /// Port leases with no session, released
    pub released_leases: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Live sessions whose lease and binding were re-created
    pub restored: u64,
    /// Sessions caught mid-setup, failed
    pub failed: u64,
    /// Sessions caught mid-teardown, or whose restore failed, terminated
    pub terminated: u64,
    /// Sessions whose teardown failed; left for the reconcile sweep
    pub failures: u64,
}

/// What `connect` acquired so far; survives the setup timeout for cleanup
#[derive(Debug, Default)]
struct SetupProgress {
    process: Option<TunnelProcess>,
    binding_id: Option<String>,
}

pub struct TunnelSessionManager {
    db: sea_orm::DatabaseConnection,
    config: TunnelConfig,
    ports: Arc<PortAllocator>,
    proxies: Arc<ProxyRegistry>,
    launcher: Arc<dyn TunnelLauncher>,
    probe: Arc<dyn ConnectivityProbe>,
    agents: Arc<dyn AgentDirectory>,
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
}

fn port_of(session: &Model) -> Option<u16> {
    u16::try_from(session.local_port).ok()
}

fn process_of(session: &Model) -> Option<TunnelProcess> {
    let pid = u32::try_from(session.process_id?).ok()?;
    Some(TunnelProcess {
        pid,
        local_port: port_of(session)?,
    })
}

impl TunnelSessionManager {
    pub fn new(
        db: sea_orm::DatabaseConnection,
        config: TunnelConfig,
        proxies: Arc<ProxyRegistry>,
        launcher: Arc<dyn TunnelLauncher>,
        probe: Arc<dyn ConnectivityProbe>,
        agents: Arc<dyn AgentDirectory>,
    ) -> Result<Self, TunnelError> {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end)?
            .with_os_check(config.verify_os_ports);

        Ok(Self {
            db,
            config,
            ports: Arc::new(ports),
            proxies,
            launcher,
            probe,
            agents,
            agent_locks: DashMap::new(),
        })
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    fn expiry_reason(&self, session: &Model, now: DateTime<Utc>) -> Option<&'static str> {
        if now - session.created_at >= self.config.max_lifetime {
            Some("max_lifetime")
        } else if now - session.last_activity_at >= self.config.idle_timeout {
            Some("idle_timeout")
        } else {
            None
        }
    }

    fn expires_at(&self, session: &Model) -> DateTime<Utc> {
        std::cmp::min(
            session.last_activity_at + self.config.idle_timeout,
            session.created_at + self.config.max_lifetime,
        )
    }

    fn info(&self, session: Model) -> SessionInfo {
        let public_url = session
            .proxy_binding_id
            .as_deref()
            .filter(|_| session.status.is_live())
            .map(|binding_id| self.proxies.public_url_for(binding_id));

        SessionInfo {
            expires_at: self.expires_at(&session),
            local_port: port_of(&session).unwrap_or_default(),
            process_id: session.process_id.and_then(|pid| u32::try_from(pid).ok()),
            public_url,
            id: session.id,
            agent_id: session.agent_id,
            proxy_binding_id: session.proxy_binding_id,
            status: session.status,
            failure_reason: session.failure_reason,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            updated_at: session.updated_at,
        }
    }

    fn endpoint(&self, session: &Model, binding: &ProxyBinding, reused: bool) -> TunnelEndpoint {
        TunnelEndpoint {
            session_id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            local_port: binding.local_port,
            binding_id: binding.binding_id.clone(),
            public_url: binding.public_url.clone(),
            reused,
            created_at: session.created_at,
            expires_at: self.expires_at(session),
        }
    }

    /// Compare-and-set a session status and emit the transition event
    async fn mark(
        &self,
        session_id: &str,
        agent_id: &str,
        from: SessionStatus,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<bool, TunnelError> {
        if !from.can_transition_to(to) {
            return Err(TunnelError::InvalidState {
                session_id: session_id.to_string(),
                current: from,
                operation: "transition",
            });
        }

        let applied =
            sessions::compare_and_set(&self.db, session_id, from, to, reason, Utc::now()).await?;
        if applied {
            info!(
                target: "outpost::session",
                session_id,
                agent_id,
                from = %from,
                to = %to,
                reason = reason.unwrap_or_default(),
                "Session status changed"
            );
        }
        Ok(applied)
    }

    /// Return a tunnel endpoint for `agent_id`, reusing its live session if possible
    pub async fn connect(&self, agent_id: &str) -> Result<TunnelEndpoint, TunnelError> {
        if agent_id.trim().is_empty() {
            return Err(TunnelError::InvalidInput(
                "Agent id must not be empty".to_string(),
            ));
        }
        let agent = self
            .agents
            .lookup(agent_id)
            .await
            .ok_or_else(|| TunnelError::InvalidInput(format!("Unknown agent: {}", agent_id)))?;

        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let live = sessions::with_status(
            &self.db,
            &[SessionStatus::Active, SessionStatus::Idle],
            Some(agent_id),
        )
        .await?;
        for session in live {
            let stale_reason = match self.expiry_reason(&session, now) {
                Some(reason) => (SessionStatus::Expired, reason),
                None => {
                    let binding = session
                        .proxy_binding_id
                        .as_deref()
                        .and_then(|binding_id| self.proxies.lookup(binding_id).ok());
                    match binding {
                        Some(binding) => {
                            debug!(session_id = %session.id, agent_id, "Reusing tunnel session");
                            return Ok(self.endpoint(&session, &binding, true));
                        }
                        None => (SessionStatus::Orphaned, "proxy binding missing"),
                    }
                }
            };

            let (via, reason) = stale_reason;
            self.teardown(&session.id, Some(via), reason).await?;
        }

        self.preflight_cleanup().await;

        let session_id = Uuid::new_v4().to_string();
        let port = self.ports.acquire(&session_id)?;

        let session = match sessions::insert(&self.db, &session_id, agent_id, port, now).await {
            Ok(session) => session,
            Err(e) => {
                self.ports.release(port, &session_id);
                return Err(e.into());
            }
        };
        info!(
            target: "outpost::session",
            session_id = %session_id,
            agent_id,
            local_port = port,
            to = %SessionStatus::Requested,
            "Session requested"
        );

        let spec = TunnelSpec {
            session_id: session_id.clone(),
            agent_id: agent_id.to_string(),
            local_port: port,
            tunnel_host: agent.tunnel_host,
            target_address: agent.target_address,
        };

        let mut progress = SetupProgress::default();
        let failure = match self
            .mark(
                &session_id,
                agent_id,
                SessionStatus::Requested,
                SessionStatus::Establishing,
                None,
            )
            .await
        {
            Ok(_) => {
                let outcome = tokio::time::timeout(
                    self.config.setup_timeout,
                    self.establish(&spec, &mut progress),
                )
                .await;

                match outcome {
                    Ok(Ok(binding)) => match self.activate(&session, &binding).await {
                        Ok(endpoint) => return Ok(endpoint),
                        Err(e) => e,
                    },
                    Ok(Err(e)) => e,
                    Err(_) => TunnelError::Timeout {
                        agent_id: agent_id.to_string(),
                        timeout_ms: self.config.setup_timeout.as_millis() as u64,
                    },
                }
            }
            Err(e) => e,
        };

        warn!(
            target: "outpost::session",
            session_id = %session_id,
            agent_id,
            local_port = port,
            "Tunnel setup failed: {}",
            failure
        );
        self.abort_setup(&session, progress, &failure).await;
        Err(failure)
    }

    /// Launch, bind and probe. Records each acquired resource in `progress`.
    async fn establish(
        &self,
        spec: &TunnelSpec,
        progress: &mut SetupProgress,
    ) -> Result<ProxyBinding, TunnelError> {
        let failed = |reason: String| TunnelError::ConnectionFailed {
            agent_id: spec.agent_id.clone(),
            reason,
        };

        let process = match self.launcher.launch(spec).await {
            Ok(process) => process,
            Err(e) if e.is_transient() => {
                warn!(agent_id = %spec.agent_id, "Tunnel launch failed, retrying once: {}", e);
                self.launcher
                    .launch(spec)
                    .await
                    .map_err(|e| failed(format!("tunnel launch failed: {}", e)))?
            }
            Err(e) => return Err(failed(format!("tunnel launch failed: {}", e))),
        };
        progress.process = Some(process);
        sessions::set_process(
            &self.db,
            &spec.session_id,
            i32::try_from(process.pid).ok(),
            Utc::now(),
        )
        .await?;

        let binding = self
            .proxies
            .bind(&spec.session_id, &spec.agent_id, spec.local_port)
            .map_err(|e| failed(format!("proxy binding failed: {}", e)))?;
        progress.binding_id = Some(binding.binding_id.clone());
        sessions::set_binding(
            &self.db,
            &spec.session_id,
            Some(&binding.binding_id),
            Utc::now(),
        )
        .await?;

        self.probe
            .probe(&binding)
            .await
            .map_err(|e| failed(format!("connectivity probe failed: {}", e)))?;

        Ok(binding)
    }

    async fn activate(
        &self,
        session: &Model,
        binding: &ProxyBinding,
    ) -> Result<TunnelEndpoint, TunnelError> {
        self.ports.bind(binding.local_port, &session.id)?;

        if !self
            .mark(
                &session.id,
                &session.agent_id,
                SessionStatus::Establishing,
                SessionStatus::Active,
                None,
            )
            .await?
        {
            return Err(TunnelError::InvalidState {
                session_id: session.id.clone(),
                current: SessionStatus::Establishing,
                operation: "activate",
            });
        }

        Ok(self.endpoint(session, binding, false))
    }

    /// Undo a failed setup. Every step is attempted even if an earlier one fails.
    async fn abort_setup(&self, session: &Model, progress: SetupProgress, failure: &TunnelError) {
        if let Some(binding_id) = progress.binding_id {
            if let Err(e) = self.proxies.unbind(&binding_id) {
                debug!(binding_id = %binding_id, "Binding already gone: {}", e);
            }
        }
        if let Some(process) = progress.process {
            if let Err(e) = self.launcher.terminate(process).await {
                error!(
                    target: "outpost::session",
                    session_id = %session.id,
                    pid = process.pid,
                    "Failed to stop tunnel process after setup failure: {}",
                    e
                );
            }
        }
        if let Some(port) = port_of(session) {
            self.ports.release(port, &session.id);
        }

        let reason = failure.to_string();
        for (from, to, reason) in [
            (SessionStatus::Requested, SessionStatus::Failed, Some(reason.as_str())),
            (SessionStatus::Establishing, SessionStatus::Failed, Some(reason.as_str())),
            (SessionStatus::Failed, SessionStatus::Terminated, None),
        ] {
            if let Err(e) = self.mark(&session.id, &session.agent_id, from, to, reason).await {
                error!(
                    target: "outpost::session",
                    session_id = %session.id,
                    "Failed to record setup failure: {}",
                    e
                );
            }
        }
    }

    /// Stop tunnel processes sitting on free pool ports (left by a crashed run)
    async fn preflight_cleanup(&self) {
        let running = match self.launcher.running().await {
            Ok(running) => running,
            Err(e) => {
                warn!("Pre-flight cleanup skipped, cannot list tunnel processes: {}", e);
                return;
            }
        };

        for process in running {
            let free = self
                .ports
                .lease(process.local_port)
                .is_some_and(|lease| lease.state == LeaseState::Free);
            if !free {
                continue;
            }

            warn!(
                target: "outpost::session",
                pid = process.pid,
                local_port = process.local_port,
                "Stopping stale tunnel process on free port"
            );
            if let Err(e) = self.launcher.terminate(process).await {
                warn!(pid = process.pid, "Failed to stop stale tunnel process: {}", e);
            }
        }
    }

    /// Tear a session down to `terminated`.
    ///
    /// Live sessions pass through `via` first when given (expired, orphaned);
    /// sessions caught mid-setup pass through `failed`. The caller must hold
    /// the agent lock. Returns false if the session was already terminated.
    async fn teardown(
        &self,
        session_id: &str,
        via: Option<SessionStatus>,
        reason: &str,
    ) -> Result<bool, TunnelError> {
        let mut session = None;
        for _ in 0..TEARDOWN_ATTEMPTS {
            let current = sessions::find(&self.db, session_id)
                .await?
                .ok_or_else(|| TunnelError::NotFound(session_id.to_string()))?;
            if current.status.is_terminal() {
                return Ok(false);
            }

            let next = match current.status {
                SessionStatus::Requested | SessionStatus::Establishing => {
                    Some(SessionStatus::Failed)
                }
                status if status.is_live() => via,
                _ => None,
            };

            match next {
                Some(to) => {
                    // touch may flip active/idle underneath; re-read and retry
                    if self
                        .mark(&current.id, &current.agent_id, current.status, to, Some(reason))
                        .await?
                    {
                        session = Some(Model {
                            status: to,
                            ..current
                        });
                        break;
                    }
                }
                None => {
                    session = Some(current);
                    break;
                }
            }
        }

        let session = match session {
            Some(session) => session,
            None => {
                let current = sessions::find(&self.db, session_id)
                    .await?
                    .map(|s| s.status)
                    .unwrap_or(SessionStatus::Terminated);
                return Err(TunnelError::InvalidState {
                    session_id: session_id.to_string(),
                    current,
                    operation: "tear down",
                });
            }
        };

        if let Some(binding_id) = session.proxy_binding_id.as_deref() {
            match self.proxies.unbind(binding_id) {
                Ok(_) | Err(BindingError::BindingNotFound(_)) => {}
                Err(e) => warn!(binding_id, "Failed to remove proxy binding: {}", e),
            }
        }

        // A failed stop leaves the lease held; the next sweep retries
        if let Some(process) = process_of(&session) {
            self.launcher.terminate(process).await?;
        }

        if let Some(port) = port_of(&session) {
            self.ports.release(port, &session.id);
        }

        self.mark(
            &session.id,
            &session.agent_id,
            session.status,
            SessionStatus::Terminated,
            None,
        )
        .await?;
        Ok(true)
    }

    /// Record traffic through a session's binding
    pub async fn touch(&self, session_id: &str) -> Result<SessionInfo, TunnelError> {
        let session = sessions::find(&self.db, session_id)
            .await?
            .ok_or_else(|| TunnelError::NotFound(session_id.to_string()))?;

        let rejected = |current| TunnelError::InvalidState {
            session_id: session_id.to_string(),
            current,
            operation: "touch",
        };
        if !session.status.is_live() {
            return Err(rejected(session.status));
        }

        if !sessions::record_activity(&self.db, session_id, Utc::now()).await? {
            let current = sessions::find(&self.db, session_id)
                .await?
                .map(|s| s.status)
                .unwrap_or(SessionStatus::Terminated);
            return Err(rejected(current));
        }

        if session.status == SessionStatus::Idle {
            info!(
                target: "outpost::session",
                session_id,
                agent_id = %session.agent_id,
                from = %SessionStatus::Idle,
                to = %SessionStatus::Active,
                reason = "activity",
                "Session status changed"
            );
        }

        self.get(session_id).await
    }

    /// Tear down a session. Disconnecting a terminated session is a no-op.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), TunnelError> {
        let session = sessions::find(&self.db, session_id)
            .await?
            .ok_or_else(|| TunnelError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            debug!(session_id, "Session already terminated");
            return Ok(());
        }

        let lock = self.agent_lock(&session.agent_id);
        let _guard = lock.lock().await;
        self.teardown(session_id, None, "disconnected").await?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionInfo, TunnelError> {
        let session = sessions::find(&self.db, session_id)
            .await?
            .ok_or_else(|| TunnelError::NotFound(session_id.to_string()))?;
        Ok(self.info(session))
    }

    /// Active and idle sessions, oldest first
    pub async fn list_live(&self) -> Result<Vec<SessionInfo>, TunnelError> {
        let live = sessions::with_status(
            &self.db,
            &[SessionStatus::Active, SessionStatus::Idle],
            None,
        )
        .await?;
        Ok(live.into_iter().map(|session| self.info(session)).collect())
    }

    /// Rebuild leases and bindings from persisted sessions.
    ///
    /// Must run before the first `connect`. Sessions interrupted mid-setup or
    /// mid-teardown are finished off.
    pub async fn restore(&self) -> Result<RestoreReport, TunnelError> {
        let mut report = RestoreReport::default();

        for session in sessions::non_terminal(&self.db).await? {
            let lock = self.agent_lock(&session.agent_id);
            let _guard = lock.lock().await;

            if session.status.is_live() {
                match self.restore_live(&session) {
                    Ok(()) => {
                        info!(
                            target: "outpost::session",
                            session_id = %session.id,
                            agent_id = %session.agent_id,
                            local_port = session.local_port,
                            "Session restored"
                        );
                        report.restored += 1;
                    }
                    Err(e) => {
                        warn!(session_id = %session.id, "Cannot restore session: {}", e);
                        let reason = format!("restore failed: {}", e);
                        match self
                            .teardown(&session.id, Some(SessionStatus::Orphaned), &reason)
                            .await
                        {
                            Ok(_) => report.terminated += 1,
                            Err(e) => self.restore_failure(&session, &e, &mut report),
                        }
                    }
                }
                continue;
            }

            let mid_setup = matches!(
                session.status,
                SessionStatus::Requested | SessionStatus::Establishing
            );
            match self
                .teardown(&session.id, None, "interrupted by manager restart")
                .await
            {
                Ok(_) if mid_setup => report.failed += 1,
                Ok(_) => report.terminated += 1,
                Err(e) => self.restore_failure(&session, &e, &mut report),
            }
        }

        info!(
            restored = report.restored,
            failed = report.failed,
            terminated = report.terminated,
            failures = report.failures,
            "Tunnel sessions restored"
        );
        Ok(report)
    }

    fn restore_failure(&self, session: &Model, e: &TunnelError, report: &mut RestoreReport) {
        error!(
            target: "outpost::session",
            session_id = %session.id,
            agent_id = %session.agent_id,
            "Failed to clean up session during restore: {}",
            e
        );
        report.failures += 1;
    }

    fn restore_live(&self, session: &Model) -> Result<(), TunnelError> {
        let port = port_of(session)
            .filter(|port| self.ports.contains(*port))
            .ok_or_else(|| {
                TunnelError::InvalidInput(format!(
                    "Port {} is outside the pool",
                    session.local_port
                ))
            })?;
        self.ports.restore(port, &session.id)?;

        if let Some(binding_id) = session.proxy_binding_id.as_deref() {
            if let Err(e) =
                self.proxies
                    .restore(binding_id, &session.id, &session.agent_id, port)
            {
                self.ports.release(port, &session.id);
                return Err(TunnelError::InvalidInput(e.to_string()));
            }
        }
        Ok(())
    }

    /// Apply idle marking and the idle/lifetime caps to every live session
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<ExpiryReport, TunnelError> {
        let mut report = ExpiryReport::default();
        let live = sessions::with_status(
            &self.db,
            &[SessionStatus::Active, SessionStatus::Idle],
            None,
        )
        .await?;

        for session in live {
            if self.expiry_reason(&session, now).is_none() {
                if session.status == SessionStatus::Active
                    && now - session.last_activity_at >= self.config.idle_after
                    && self
                        .mark(
                            &session.id,
                            &session.agent_id,
                            SessionStatus::Active,
                            SessionStatus::Idle,
                            None,
                        )
                        .await?
                {
                    report.idled += 1;
                }
                continue;
            }

            let lock = self.agent_lock(&session.agent_id);
            let _guard = lock.lock().await;

            // Re-check under the lock; the session may have been touched or replaced
            let Some(current) = sessions::find(&self.db, &session.id).await? else {
                continue;
            };
            if !current.status.is_live() {
                continue;
            }
            let Some(reason) = self.expiry_reason(&current, now) else {
                continue;
            };

            match self
                .teardown(&current.id, Some(SessionStatus::Expired), reason)
                .await
            {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        target: "outpost::session",
                        session_id = %current.id,
                        "Failed to expire session: {}",
                        e
                    );
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Compare sessions with running processes, proxy bindings and leases, and
    /// clean up whatever exists on one side only.
    pub async fn reconcile(&self) -> Result<ReconcileReport, TunnelError> {
        let mut report = ReconcileReport::default();
        let running = self.launcher.running().await?;
        let snapshot = sessions::non_terminal(&self.db).await?;

        // Processes with no session
        for process in &running {
            if self.is_setting_up(process.local_port) {
                continue;
            }
            let pid = i32::try_from(process.pid).ok();
            let owned = |sessions: &[Model]| {
                sessions.iter().any(|session| {
                    session.process_id == pid && port_of(session) == Some(process.local_port)
                })
            };
            if owned(snapshot.as_slice()) {
                continue;
            }
            // It may belong to a session created after the snapshot
            let holders = sessions::holding_port(&self.db, process.local_port).await?;
            if owned(holders.as_slice()) {
                continue;
            }

            warn!(
                target: "outpost::session",
                pid = process.pid,
                local_port = process.local_port,
                "Stopping tunnel process with no session"
            );
            match self.launcher.terminate(*process).await {
                Ok(()) => report.killed_processes += 1,
                Err(e) => {
                    error!(pid = process.pid, "Failed to stop orphaned tunnel process: {}", e);
                    report.failures += 1;
                }
            }
        }

        // Sessions with no process or binding, and teardowns that never finished
        for session in &snapshot {
            let reason = if session.status.is_live() {
                let has_process = process_of(session).is_some_and(|p| running.contains(&p));
                let has_binding = session
                    .proxy_binding_id
                    .as_deref()
                    .is_some_and(|binding_id| self.proxies.exists(binding_id));
                match (has_process, has_binding) {
                    (true, true) => continue,
                    (false, _) => "tunnel process not running",
                    (true, false) => "proxy binding missing",
                }
            } else {
                "interrupted teardown"
            };

            let lock = self.agent_lock(&session.agent_id);
            let _guard = lock.lock().await;

            let Some(current) = sessions::find(&self.db, &session.id).await? else {
                continue;
            };
            if current.status != session.status
                || current.process_id != session.process_id
                || current.proxy_binding_id != session.proxy_binding_id
            {
                continue;
            }
            if current.status.is_live() && reason == "tunnel process not running" {
                let still_running = match process_of(&current) {
                    Some(process) => self.launcher.running().await?.contains(&process),
                    None => false,
                };
                if still_running {
                    continue;
                }
            }

            let via = current.status.is_live().then_some(SessionStatus::Orphaned);
            match self.teardown(&current.id, via, reason).await {
                Ok(true) if via.is_some() => report.orphaned_sessions += 1,
                Ok(true) => report.finished_teardowns += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        target: "outpost::session",
                        session_id = %current.id,
                        "Failed to clean up session: {}",
                        e
                    );
                    report.failures += 1;
                }
            }
        }

        // Bindings with no live session
        for binding in self.proxies.all_bindings() {
            if self.is_setting_up(binding.local_port) {
                continue;
            }
            let backed = sessions::find(&self.db, &binding.session_id)
                .await?
                .is_some_and(|session| {
                    session.status.is_live()
                        && session.proxy_binding_id.as_deref() == Some(binding.binding_id.as_str())
                });
            if backed {
                continue;
            }
            if self.proxies.unbind(&binding.binding_id).is_ok() {
                warn!(
                    target: "outpost::session",
                    binding_id = %binding.binding_id,
                    session_id = %binding.session_id,
                    "Removed proxy binding with no live session"
                );
                report.removed_bindings += 1;
            }
        }

        // Leases with no session
        for lease in self.ports.held() {
            if lease.state != LeaseState::Bound {
                continue;
            }
            let Some(holder) = lease.held_by else {
                continue;
            };
            let backed = sessions::find(&self.db, &holder)
                .await?
                .is_some_and(|session| !session.status.is_terminal());
            if !backed && self.ports.release(lease.port, &holder) {
                warn!(
                    target: "outpost::session",
                    port = lease.port,
                    session_id = %holder,
                    "Released port lease with no session"
                );
                report.released_leases += 1;
            }
        }

        Ok(report)
    }

    fn is_setting_up(&self, port: u16) -> bool {
        self.ports
            .lease(port)
            .is_some_and(|lease| lease.state == LeaseState::Reserved)
    }

    /// Delete terminated sessions older than `retention`
    pub async fn purge_terminated(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<u64, TunnelError> {
        purge_terminated_sessions(&self.db, now, retention).await
    }
}

/// Delete terminated sessions older than `retention` without a running manager
///
/// Terminated rows hold no port, process or binding, so this is safe to run
/// from a maintenance command while a manager is serving.
pub async fn purge_terminated_sessions(
    db: &sea_orm::DatabaseConnection,
    now: DateTime<Utc>,
    retention: chrono::Duration,
) -> Result<u64, TunnelError> {
    let purged = sessions::purge_terminated(db, now - retention).await?;
    if purged > 0 {
        debug!(purged, "Purged terminated tunnel sessions");
    }
    Ok(purged)
}
