use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use outpost_queue::{QueueError, RetentionPolicy, TaskKind, TaskPayload, TaskStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{api_error, queue_error, tunnel_error, ApiResult};
use crate::models::*;
use crate::AppState;

const MAX_RETENTION_DAYS: i64 = 36_500;

fn parse_kind(kind: &str) -> ApiResult<TaskKind> {
    kind.parse::<TaskKind>().map_err(queue_error)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_tunnels: state.sessions.proxies().count(),
    })
}

/// Queue a command for an agent
#[utoipa::path(
    post,
    path = "/api/agents/{agent_id}/commands",
    params(
        ("agent_id" = String, Path, description = "Agent ID")
    ),
    request_body = EnqueueCommandRequest,
    responses(
        (status = 201, description = "Command queued", body = Task),
        (status = 400, description = "Empty command or unknown agent", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn enqueue_command(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<EnqueueCommandRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state
        .dispatcher
        .enqueue(&agent_id, TaskPayload::command(req.command))
        .await
        .map_err(queue_error)?;

    Ok((StatusCode::CREATED, Json(task.into())))
}

/// Queue an HTTP request for an agent
#[utoipa::path(
    post,
    path = "/api/agents/{agent_id}/http-requests",
    params(
        ("agent_id" = String, Path, description = "Agent ID")
    ),
    request_body = EnqueueHttpRequest,
    responses(
        (status = 201, description = "HTTP request queued", body = Task),
        (status = 400, description = "Invalid URL or method, or unknown agent", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn enqueue_http_request(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<EnqueueHttpRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let payload = TaskPayload::http_request(req.url, req.method.unwrap_or_default());
    let task = state
        .dispatcher
        .enqueue(&agent_id, payload)
        .await
        .map_err(queue_error)?;

    Ok((StatusCode::CREATED, Json(task.into())))
}

/// Claim every pending task of the calling agent
#[utoipa::path(
    post,
    path = "/api/agents/{agent_id}/poll",
    params(
        ("agent_id" = String, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Tasks now marked sent", body = PollResponse),
        (status = 400, description = "Invalid agent id", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn poll_tasks(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<PollResponse>> {
    let tasks = state.dispatcher.poll(&agent_id).await.map_err(queue_error)?;

    Ok(Json(PollResponse {
        tasks: tasks.into_iter().map(Task::from).collect(),
    }))
}

/// List tasks of one kind, newest first
#[utoipa::path(
    get,
    path = "/api/queue/{kind}",
    params(
        ("kind" = String, Path, description = "commands or http-requests"),
        TaskListQuery
    ),
    responses(
        (status = 200, description = "List of tasks", body = TaskList),
        (status = 400, description = "Unknown kind or status", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<TaskList>> {
    let kind = parse_kind(&kind)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_INPUT", e))?;

    debug!("Listing {} tasks", kind);
    let tasks: Vec<Task> = state
        .dispatcher
        .list(kind, query.agent_id.as_deref(), status)
        .await
        .map_err(queue_error)?
        .into_iter()
        .map(Task::from)
        .collect();

    let total = tasks.len();
    Ok(Json(TaskList { tasks, total }))
}

/// Get a single task
#[utoipa::path(
    get,
    path = "/api/queue/{kind}/{id}",
    params(
        ("kind" = String, Path, description = "commands or http-requests"),
        ("id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task", body = Task),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Json<Task>> {
    let kind = parse_kind(&kind)?;
    let task = state.dispatcher.get(kind, &id).await.map_err(queue_error)?;
    Ok(Json(task.into()))
}

/// Report the result of a delivered task
#[utoipa::path(
    post,
    path = "/api/queue/{kind}/{id}/report",
    params(
        ("kind" = String, Path, description = "commands or http-requests"),
        ("id" = String, Path, description = "Task ID")
    ),
    request_body = ReportRequest,
    responses(
        (status = 200, description = "Report accepted, or ignored as stale", body = ReportResponse),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn report_task(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<Json<ReportResponse>> {
    let kind = parse_kind(&kind)?;

    match state
        .dispatcher
        .report(kind, &id, req.outcome.into(), req.output)
        .await
    {
        Ok(task) => Ok(Json(ReportResponse {
            accepted: true,
            status: task.status.as_str().to_string(),
            task: Some(task.into()),
        })),
        // Superseded poll: the agent gets a soft answer, not an error
        Err(QueueError::InvalidState { current, .. }) => Ok(Json(ReportResponse {
            accepted: false,
            status: current.as_str().to_string(),
            task: None,
        })),
        Err(e) => Err(queue_error(e)),
    }
}

/// Cancel a task that has not been delivered yet
#[utoipa::path(
    post,
    path = "/api/queue/{kind}/{id}/cancel",
    params(
        ("kind" = String, Path, description = "commands or http-requests"),
        ("id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task cancelled", body = Task),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 409, description = "Task already delivered or finished", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Json<Task>> {
    let kind = parse_kind(&kind)?;
    info!("Cancelling {} {}", kind, id);

    let task = state.dispatcher.cancel(kind, &id).await.map_err(queue_error)?;
    Ok(Json(task.into()))
}

/// Delete a finished task
#[utoipa::path(
    delete,
    path = "/api/queue/{kind}/{id}",
    params(
        ("kind" = String, Path, description = "commands or http-requests"),
        ("id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 204, description = "Task deleted"),
        (status = 404, description = "Task not found", body = ErrorResponse),
        (status = 409, description = "Task still in flight", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let kind = parse_kind(&kind)?;
    info!("Deleting {} {}", kind, id);

    state.dispatcher.delete(kind, &id).await.map_err(queue_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Per-status counts for the dashboard
#[utoipa::path(
    get,
    path = "/api/queue/summary",
    responses(
        (status = 200, description = "Queue summary", body = SummaryResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn queue_summary(State(state): State<Arc<AppState>>) -> ApiResult<Json<SummaryResponse>> {
    let summary = state
        .dispatcher
        .summary(Utc::now())
        .await
        .map_err(queue_error)?;
    Ok(Json(summary.into()))
}

/// Run the retention purge now
#[utoipa::path(
    post,
    path = "/api/queue/purge",
    request_body = PurgeRequest,
    responses(
        (status = 200, description = "Deleted tasks by status", body = PurgeResponse),
        (status = 400, description = "Invalid retention window", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn purge_tasks(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PurgeRequest>,
) -> ApiResult<Json<PurgeResponse>> {
    let defaults = state.dispatcher.retention_policy();
    let completed_days = req
        .completed_retention_days
        .unwrap_or(defaults.completed_retention.num_days());
    let failed_days = req
        .failed_retention_days
        .unwrap_or(defaults.failed_retention.num_days());

    let valid = 0..=MAX_RETENTION_DAYS;
    if !valid.contains(&completed_days) || !valid.contains(&failed_days) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            format!("Retention windows must be 0-{} days", MAX_RETENTION_DAYS),
        ));
    }

    let policy = RetentionPolicy::from_days(completed_days, failed_days);
    info!(completed_days, failed_days, "Manual retention purge");
    let report = state
        .dispatcher
        .purge(Utc::now(), &policy)
        .await
        .map_err(queue_error)?;

    Ok(Json(report.into()))
}

/// Open (or reuse) a tunnel to an agent
#[utoipa::path(
    post,
    path = "/api/agents/{agent_id}/tunnel",
    params(
        ("agent_id" = String, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Existing session reused", body = TunnelEndpointResponse),
        (status = 201, description = "New session created", body = TunnelEndpointResponse),
        (status = 400, description = "Unknown agent", body = ErrorResponse),
        (status = 502, description = "Tunnel, proxy or probe failed", body = ErrorResponse),
        (status = 503, description = "Port pool exhausted", body = ErrorResponse),
        (status = 504, description = "Setup timed out", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn connect_tunnel(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TunnelEndpointResponse>)> {
    let endpoint = state.sessions.connect(&agent_id).await.map_err(|e| {
        warn!(agent_id = %agent_id, "Tunnel connect failed: {}", e);
        tunnel_error(e)
    })?;

    let status = if endpoint.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(endpoint.into())))
}

/// List live tunnel sessions
#[utoipa::path(
    get,
    path = "/api/tunnels",
    responses(
        (status = 200, description = "Active and idle sessions", body = TunnelSessionList),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TunnelSessionList>> {
    debug!("Listing tunnel sessions");

    let sessions: Vec<TunnelSession> = state
        .sessions
        .list_live()
        .await
        .map_err(tunnel_error)?
        .into_iter()
        .map(TunnelSession::from)
        .collect();

    let total = sessions.len();
    Ok(Json(TunnelSessionList { sessions, total }))
}

/// Get a tunnel session by ID
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Session", body = TunnelSession),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TunnelSession>> {
    let session = state.sessions.get(&id).await.map_err(tunnel_error)?;
    Ok(Json(session.into()))
}

/// Record activity on a session
#[utoipa::path(
    post,
    path = "/api/tunnels/{id}/touch",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 200, description = "Session after the update", body = TunnelSession),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session is not live", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn touch_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TunnelSession>> {
    let session = state.sessions.touch(&id).await.map_err(tunnel_error)?;
    Ok(Json(session.into()))
}

/// Tear a session down
#[utoipa::path(
    delete,
    path = "/api/tunnels/{id}",
    params(
        ("id" = String, Path, description = "Session ID")
    ),
    responses(
        (status = 204, description = "Session terminated (or already was)"),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn disconnect_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    info!("Disconnecting tunnel session: {}", id);

    state.sessions.disconnect(&id).await.map_err(tunnel_error)?;
    Ok(StatusCode::NO_CONTENT)
}
