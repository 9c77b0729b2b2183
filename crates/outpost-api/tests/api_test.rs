//! Integration tests for the HTTP surface

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use outpost_api::{models::*, ApiServer, ApiServerConfig};
use outpost_control::{
    AgentRecord, AgentRegistry, ConnectivityProbe, LaunchError, ProbeError, TunnelConfig,
    TunnelLauncher, TunnelProcess, TunnelSessionManager, TunnelSpec,
};
use outpost_queue::TaskDispatcher;
use outpost_router::{ProxyBinding, ProxyRegistry};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot` method

/// Pretends to start a tunnel; whatever listens on the pool port is the "agent"
#[derive(Default)]
struct NoopLauncher {
    next_pid: AtomicU32,
    running: std::sync::Mutex<Vec<TunnelProcess>>,
}

#[async_trait]
impl TunnelLauncher for NoopLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> Result<TunnelProcess, LaunchError> {
        let process = TunnelProcess {
            pid: 5000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            local_port: spec.local_port,
        };
        self.running.lock().unwrap().push(process);
        Ok(process)
    }

    async fn terminate(&self, process: TunnelProcess) -> Result<(), LaunchError> {
        self.running.lock().unwrap().retain(|p| *p != process);
        Ok(())
    }

    async fn running(&self) -> Result<Vec<TunnelProcess>, LaunchError> {
        Ok(self.running.lock().unwrap().clone())
    }
}

struct AlwaysReachable;

#[async_trait]
impl ConnectivityProbe for AlwaysReachable {
    async fn probe(&self, _binding: &ProxyBinding) -> Result<(), ProbeError> {
        Ok(())
    }
}

struct TestApp {
    router: Router,
    sessions: Arc<TunnelSessionManager>,
}

async fn create_test_app(port_range: (u16, u16)) -> TestApp {
    let db = outpost_db::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    outpost_db::migrate(&db).await.expect("Failed to run migrations");

    let agents = Arc::new(AgentRegistry::from_records(["A7", "A42"].map(|id| {
        AgentRecord {
            agent_id: id.to_string(),
            tunnel_host: format!("{}.fw.example.net", id.to_lowercase()),
            target_address: "127.0.0.1:443".to_string(),
        }
    })));

    let dispatcher = TaskDispatcher::new(db.clone(), agents.clone());
    let sessions = Arc::new(
        TunnelSessionManager::new(
            db,
            TunnelConfig {
                port_range_start: port_range.0,
                port_range_end: port_range.1,
                ..TunnelConfig::default()
            },
            Arc::new(ProxyRegistry::new("https://manager.test")),
            Arc::new(NoopLauncher::default()),
            Arc::new(AlwaysReachable),
            agents,
        )
        .unwrap(),
    );

    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(), // Random port
        enable_cors: false,
    };
    let server = ApiServer::new(config, dispatcher, sessions.clone());

    TestApp {
        router: server.build_router(),
        sessions,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_health_and_openapi() {
    let app = create_test_app((8100, 8109)).await;

    let (status, body) = send(&app.router, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = parse(&body);
    assert_eq!(health.status, "healthy");
    assert_eq!(health.live_tunnels, 0);

    let (status, body) = send(&app.router, "GET", "/api/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let doc: Value = parse(&body);
    assert!(doc["paths"]["/api/queue/summary"].is_object());
}

#[tokio::test]
async fn test_command_lifecycle() {
    let app = create_test_app((8100, 8109)).await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/agents/A42/commands",
        Some(json!({ "command": "show version" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task: Task = parse(&body);
    assert_eq!(task.kind, "command");
    assert_eq!(task.status, "pending");

    let (status, body) = send(&app.router, "POST", "/api/agents/A42/poll", None).await;
    assert_eq!(status, StatusCode::OK);
    let poll: PollResponse = parse(&body);
    assert_eq!(poll.tasks.len(), 1);
    assert_eq!(poll.tasks[0].status, "sent");

    // A second poll gets nothing
    let (_, body) = send(&app.router, "POST", "/api/agents/A42/poll", None).await;
    assert!(parse::<PollResponse>(&body).tasks.is_empty());

    let report_uri = format!("/api/queue/commands/{}/report", task.id);
    let (status, body) = send(
        &app.router,
        "POST",
        &report_uri,
        Some(json!({ "outcome": "completed", "output": "9.2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let report: ReportResponse = parse(&body);
    assert!(report.accepted);
    assert_eq!(report.task.unwrap().output.as_deref(), Some("9.2"));

    // Stale report is a soft failure
    let (status, body) = send(
        &app.router,
        "POST",
        &report_uri,
        Some(json!({ "outcome": "failed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let stale: ReportResponse = parse(&body);
    assert!(!stale.accepted);
    assert_eq!(stale.status, "completed");

    let (status, body) = send(&app.router, "GET", "/api/queue/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    let summary: SummaryResponse = parse(&body);
    assert_eq!(summary.commands.counts.completed, 1);
    assert_eq!(summary.totals.total, 1);

    let task_uri = format!("/api/queue/commands/{}", task.id);
    let (status, _) = send(&app.router, "DELETE", &task_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app.router, "GET", &task_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        parse::<ErrorResponse>(&body).code.as_deref(),
        Some("TASK_NOT_FOUND")
    );
}

#[tokio::test]
async fn test_enqueue_rejections() {
    let app = create_test_app((8100, 8109)).await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/agents/A42/commands",
        Some(json!({ "command": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/agents/B9/commands",
        Some(json!({ "command": "show version" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/agents/A42/http-requests",
        Some(json!({ "url": "http://127.0.0.1/status", "method": "post" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(parse::<Task>(&body).method.as_deref(), Some("POST"));

    let (status, _) = send(&app.router, "GET", "/api/queue/widgets", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        "GET",
        "/api/queue/commands?status=bogus",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_rules() {
    let app = create_test_app((8100, 8109)).await;

    let (_, body) = send(
        &app.router,
        "POST",
        "/api/agents/A7/http-requests",
        Some(json!({ "url": "http://127.0.0.1/" })),
    )
    .await;
    let pending: Task = parse(&body);
    let (_, body) = send(
        &app.router,
        "POST",
        "/api/agents/A7/commands",
        Some(json!({ "command": "reload" })),
    )
    .await;
    let command: Task = parse(&body);

    let cancel_uri = format!("/api/queue/http-requests/{}/cancel", pending.id);
    let (status, body) = send(&app.router, "POST", &cancel_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<Task>(&body).status, "cancelled");

    send(&app.router, "POST", "/api/agents/A7/poll", None).await;

    // Delivered tasks can no longer be cancelled or deleted
    let cancel_uri = format!("/api/queue/commands/{}/cancel", command.id);
    let (status, body) = send(&app.router, "POST", &cancel_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        parse::<ErrorResponse>(&body).code.as_deref(),
        Some("INVALID_STATE")
    );
    let delete_uri = format!("/api/queue/commands/{}", command.id);
    let (status, _) = send(&app.router, "DELETE", &delete_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app.router,
        "GET",
        "/api/queue/commands?agent_id=A7&status=sent",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<TaskList>(&body).total, 1);
}

#[tokio::test]
async fn test_manual_purge() {
    let app = create_test_app((8100, 8109)).await;

    let (_, body) = send(
        &app.router,
        "POST",
        "/api/agents/A7/commands",
        Some(json!({ "command": "show clock" })),
    )
    .await;
    let task: Task = parse(&body);
    send(
        &app.router,
        "POST",
        &format!("/api/queue/commands/{}/cancel", task.id),
        None,
    )
    .await;

    let (status, body) = send(&app.router, "POST", "/api/queue/purge", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<PurgeResponse>(&body).total, 0);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/queue/purge",
        Some(json!({ "completed_retention_days": 0, "failed_retention_days": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<PurgeResponse>(&body).cancelled, 1);

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/queue/purge",
        Some(json!({ "failed_retention_days": -1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tunnel_lifecycle() {
    let app = create_test_app((8100, 8100)).await;

    let (status, body) = send(&app.router, "POST", "/api/agents/A42/tunnel", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let endpoint: TunnelEndpointResponse = parse(&body);
    assert!(!endpoint.reused);
    assert!(endpoint
        .public_url
        .starts_with("https://manager.test/tunnel/"));

    let (status, body) = send(&app.router, "POST", "/api/agents/A42/tunnel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse::<TunnelEndpointResponse>(&body).reused);

    // Single-port pool: another agent cannot get a tunnel
    let (status, body) = send(&app.router, "POST", "/api/agents/A7/tunnel", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        parse::<ErrorResponse>(&body).code.as_deref(),
        Some("POOL_EXHAUSTED")
    );

    let (status, body) = send(&app.router, "GET", "/api/tunnels", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<TunnelSessionList>(&body).total, 1);

    let session_uri = format!("/api/tunnels/{}", endpoint.session_id);
    let (status, body) = send(
        &app.router,
        "POST",
        &format!("{}/touch", session_uri),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<TunnelSession>(&body).status, "active");

    let (status, _) = send(&app.router, "DELETE", &session_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app.router, "DELETE", &session_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app.router, "GET", &session_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<TunnelSession>(&body).status, "terminated");

    let (status, _) = send(&app.router, "POST", "/api/agents/A7/tunnel", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(&app.router, "DELETE", "/api/tunnels/no-such-session", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_forwards_and_touches() {
    // The "agent side" of the tunnel: a plain HTTP server on the pool port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let upstream = Router::new().fallback(|uri: axum::http::Uri| async move {
        format!("upstream saw {}", uri)
    });
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });

    let app = create_test_app((port, port)).await;
    let (status, body) = send(&app.router, "POST", "/api/agents/A42/tunnel", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let endpoint: TunnelEndpointResponse = parse(&body);

    let uri = format!("/tunnel/{}/cgi/status?verbose=1", endpoint.binding_id);
    let (status, body) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "upstream saw /cgi/status?verbose=1"
    );

    let session = app.sessions.get(&endpoint.session_id).await.unwrap();
    assert!(session.last_activity_at > endpoint.created_at);

    let (status, _) = send(&app.router, "GET", "/tunnel/unknown-binding/", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_rejects_binding_without_live_session() {
    let app = create_test_app((8100, 8109)).await;
    let binding = app
        .sessions
        .proxies()
        .bind("vanished-session", "A7", 8105)
        .unwrap();

    let uri = format!("/tunnel/{}/", binding.binding_id);
    let (status, body) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(
        parse::<ErrorResponse>(&body).code.as_deref(),
        Some("SESSION_GONE")
    );
}
