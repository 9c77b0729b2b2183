use async_trait::async_trait;
use chrono::{Duration, Utc};
use outpost_control::{
    AgentRecord, AgentRegistry, ConnectivityProbe, LaunchError, ProbeError, SessionStatus,
    TunnelConfig, TunnelLauncher, TunnelProcess, TunnelSessionManager, TunnelSpec,
};
use outpost_housekeeper::{Housekeeper, HousekeeperConfig, Sweep};
use outpost_queue::{TaskDispatcher, TaskKind, TaskPayload, TaskStatus};
use outpost_router::{ProxyBinding, ProxyRegistry};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Launcher whose process listing can be made to fail
#[derive(Default)]
struct FlakyLauncher {
    next_pid: AtomicU32,
    listing_broken: AtomicBool,
    running: Mutex<HashSet<TunnelProcess>>,
}

#[async_trait]
impl TunnelLauncher for FlakyLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> Result<TunnelProcess, LaunchError> {
        let process = TunnelProcess {
            pid: 7000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            local_port: spec.local_port,
        };
        self.running.lock().unwrap().insert(process);
        Ok(process)
    }

    async fn terminate(&self, process: TunnelProcess) -> Result<(), LaunchError> {
        self.running.lock().unwrap().remove(&process);
        Ok(())
    }

    async fn running(&self) -> Result<Vec<TunnelProcess>, LaunchError> {
        if self.listing_broken.load(Ordering::SeqCst) {
            return Err(LaunchError::Fatal("run directory unreadable".to_string()));
        }
        Ok(self.running.lock().unwrap().iter().copied().collect())
    }
}

struct AlwaysReachable;

#[async_trait]
impl ConnectivityProbe for AlwaysReachable {
    async fn probe(&self, _binding: &ProxyBinding) -> Result<(), ProbeError> {
        Ok(())
    }
}

struct Harness {
    dispatcher: TaskDispatcher,
    sessions: Arc<TunnelSessionManager>,
    launcher: Arc<FlakyLauncher>,
    housekeeper: Housekeeper,
}

async fn setup() -> Harness {
    let db = outpost_db::connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    outpost_db::migrate(&db).await.expect("Failed to run migrations");

    let agents = Arc::new(AgentRegistry::from_records(["A1", "A42"].map(|id| {
        AgentRecord {
            agent_id: id.to_string(),
            tunnel_host: format!("{}.fw.example.net", id.to_lowercase()),
            target_address: "127.0.0.1:443".to_string(),
        }
    })));

    let dispatcher = TaskDispatcher::new(db.clone(), agents.clone());
    let launcher = Arc::new(FlakyLauncher::default());
    let sessions = Arc::new(
        TunnelSessionManager::new(
            db,
            TunnelConfig {
                port_range_start: 8100,
                port_range_end: 8103,
                ..TunnelConfig::default()
            },
            Arc::new(ProxyRegistry::new("https://manager.test")),
            launcher.clone(),
            Arc::new(AlwaysReachable),
            agents,
        )
        .unwrap(),
    );

    let housekeeper = Housekeeper::new(
        dispatcher.clone(),
        sessions.clone(),
        HousekeeperConfig::default(),
    );
    Harness {
        dispatcher,
        sessions,
        launcher,
        housekeeper,
    }
}

#[tokio::test]
async fn test_clean_run_on_empty_state() {
    let h = setup().await;

    let report = h.housekeeper.run_once().await;
    assert!(report.is_clean());
    assert_eq!(report.stuck.unwrap().total(), 0);
    assert_eq!(report.purged_tasks.unwrap().total(), 0);
    assert_eq!(report.purged_sessions, Some(0));
    assert_eq!(report.reconcile, Some(Default::default()));
    assert_eq!(report.expiry, Some(Default::default()));
}

#[tokio::test]
async fn test_stuck_then_purged() {
    let h = setup().await;
    let start = Utc::now();

    let stale = h
        .dispatcher
        .enqueue("A1", TaskPayload::command("show version"))
        .await
        .unwrap();

    let report = h.housekeeper.run_once_at(start + Duration::hours(2)).await;
    assert_eq!(report.stuck.unwrap().pending_timed_out, 1);

    let failed = h.dispatcher.get(TaskKind::Command, &stale.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    // Failed tasks are kept for 14 days after they failed
    let report = h.housekeeper.run_once_at(start + Duration::days(10)).await;
    assert_eq!(report.purged_tasks.unwrap().failed, 0);

    let report = h.housekeeper.run_once_at(start + Duration::days(15)).await;
    assert_eq!(report.purged_tasks.unwrap().failed, 1);
    assert!(h.dispatcher.get(TaskKind::Command, &stale.id).await.is_err());
}

#[tokio::test]
async fn test_failing_sweep_does_not_block_others() {
    let h = setup().await;
    let start = Utc::now();

    let endpoint = h.sessions.connect("A42").await.unwrap();
    let task = h
        .dispatcher
        .enqueue("A1", TaskPayload::command("show interfaces"))
        .await
        .unwrap();
    h.launcher.listing_broken.store(true, Ordering::SeqCst);

    let report = h.housekeeper.run_once_at(start + Duration::minutes(61)).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].sweep, Sweep::OrphanSweep);
    assert!(report.reconcile.is_none());

    // Sweeps before and after the failing one still ran
    assert_eq!(report.stuck.unwrap().pending_timed_out, 1);
    assert_eq!(report.expiry.unwrap().expired, 1);
    assert_eq!(
        h.dispatcher
            .get(TaskKind::Command, &task.id)
            .await
            .unwrap()
            .status,
        TaskStatus::Failed
    );
    assert_eq!(
        h.sessions.get(&endpoint.session_id).await.unwrap().status,
        SessionStatus::Terminated
    );

    // The orphan sweep succeeds again once listing recovers
    h.launcher.listing_broken.store(false, Ordering::SeqCst);
    let report = h.housekeeper.run_once_at(start + Duration::minutes(70)).await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_terminated_sessions_purged_after_retention() {
    let h = setup().await;
    let start = Utc::now();

    let endpoint = h.sessions.connect("A42").await.unwrap();
    h.sessions.disconnect(&endpoint.session_id).await.unwrap();

    let report = h.housekeeper.run_once_at(start + Duration::days(13)).await;
    assert_eq!(report.purged_sessions, Some(0));

    let report = h.housekeeper.run_once_at(start + Duration::days(15)).await;
    assert_eq!(report.purged_sessions, Some(1));
    assert!(h.sessions.get(&endpoint.session_id).await.is_err());
}
