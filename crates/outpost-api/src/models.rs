use chrono::{DateTime, Utc};
use outpost_control::{SessionInfo, TunnelEndpoint};
use outpost_queue::{
    KindSummary, PurgeReport, QueueSummary, QueuedTask, ReportOutcome, StatusCounts, TaskPayload,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Request to queue a shell command
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnqueueCommandRequest {
    /// Command line to run on the agent
    pub command: String,
}

/// Request to queue an HTTP request the agent performs locally
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnqueueHttpRequest {
    /// Target URL as seen from the agent
    pub url: String,
    /// HTTP method (default: GET)
    #[serde(default)]
    pub method: Option<String>,
}

/// A queued command or HTTP request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Task {
    /// Task ID
    pub id: String,
    /// Queue the task lives in ("command" or "http_request")
    pub kind: String,
    /// Agent the task is queued for
    pub agent_id: String,
    /// pending, sent, completed, failed or cancelled
    pub status: String,
    /// Command line (commands only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Target URL (HTTP requests only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// HTTP method (HTTP requests only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Command output or HTTP response reported by the agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Poll that delivered the task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<QueuedTask> for Task {
    fn from(task: QueuedTask) -> Self {
        let (command, url, method) = match task.payload {
            TaskPayload::Command { command } => (Some(command), None, None),
            TaskPayload::HttpRequest { url, method } => (None, Some(url), Some(method)),
        };

        Self {
            id: task.id,
            kind: task.kind.as_str().to_string(),
            agent_id: task.agent_id,
            status: task.status.as_str().to_string(),
            command,
            url,
            method,
            output: task.output,
            delivery_id: task.delivery_id,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// List of tasks
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskList {
    pub tasks: Vec<Task>,
    pub total: usize,
}

/// Query parameters for listing tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams)]
pub struct TaskListQuery {
    /// Only tasks for this agent
    pub agent_id: Option<String>,
    /// Only tasks in this status
    pub status: Option<String>,
}

/// Tasks handed to a polling agent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PollResponse {
    pub tasks: Vec<Task>,
}

/// Result reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed,
    Failed,
}

impl From<TaskOutcome> for ReportOutcome {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed => ReportOutcome::Completed,
            TaskOutcome::Failed => ReportOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportRequest {
    pub outcome: TaskOutcome,
    /// Command output or HTTP response body
    #[serde(default)]
    pub output: Option<String>,
}

/// Answer to a report.
///
/// A stale report (the task is no longer `sent`) is not an error for the
/// agent: `accepted` is false and `status` holds the task's current status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReportResponse {
    pub accepted: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

/// Per-status task counts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct StatusCountsResponse {
    pub pending: u64,
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl From<StatusCounts> for StatusCountsResponse {
    fn from(counts: StatusCounts) -> Self {
        Self {
            pending: counts.pending,
            sent: counts.sent,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            total: counts.total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KindSummaryResponse {
    pub kind: String,
    pub counts: StatusCountsResponse,
    /// Terminal tasks older than their retention window
    pub purge_eligible: u64,
    /// Pending or sent tasks past their grace period
    pub stuck: u64,
}

impl From<KindSummary> for KindSummaryResponse {
    fn from(summary: KindSummary) -> Self {
        Self {
            kind: summary.kind.as_str().to_string(),
            counts: summary.counts.into(),
            purge_eligible: summary.purge_eligible,
            stuck: summary.stuck,
        }
    }
}

/// Dashboard badge counts, read as one consistent snapshot
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SummaryResponse {
    pub commands: KindSummaryResponse,
    pub http_requests: KindSummaryResponse,
    pub totals: StatusCountsResponse,
    pub purge_eligible: u64,
    pub stuck: u64,
}

impl From<QueueSummary> for SummaryResponse {
    fn from(summary: QueueSummary) -> Self {
        Self {
            commands: summary.commands.into(),
            http_requests: summary.http_requests.into(),
            totals: summary.totals.into(),
            purge_eligible: summary.purge_eligible,
            stuck: summary.stuck,
        }
    }
}

/// Manual retention purge; omitted windows use the configured defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PurgeRequest {
    pub completed_retention_days: Option<i64>,
    pub failed_retention_days: Option<i64>,
}

/// Deleted tasks by terminal status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl From<PurgeReport> for PurgeResponse {
    fn from(report: PurgeReport) -> Self {
        Self {
            completed: report.completed,
            failed: report.failed,
            cancelled: report.cancelled,
            total: report.total(),
        }
    }
}

/// Public endpoint of a tunnel session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelEndpointResponse {
    pub session_id: String,
    pub agent_id: String,
    /// Local pool port the tunnel listens on
    pub local_port: u16,
    pub binding_id: String,
    /// URL to open in the browser
    pub public_url: String,
    /// An existing session was returned
    pub reused: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<TunnelEndpoint> for TunnelEndpointResponse {
    fn from(endpoint: TunnelEndpoint) -> Self {
        Self {
            session_id: endpoint.session_id,
            agent_id: endpoint.agent_id,
            local_port: endpoint.local_port,
            binding_id: endpoint.binding_id,
            public_url: endpoint.public_url,
            reused: endpoint.reused,
            created_at: endpoint.created_at,
            expires_at: endpoint.expires_at,
        }
    }
}

/// Tunnel session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelSession {
    pub id: String,
    pub agent_id: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    /// Set while the session is active or idle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// requested, establishing, active, idle, expired, failed, orphaned or terminated
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionInfo> for TunnelSession {
    fn from(session: SessionInfo) -> Self {
        Self {
            id: session.id,
            agent_id: session.agent_id,
            local_port: session.local_port,
            process_id: session.process_id,
            binding_id: session.proxy_binding_id,
            public_url: session.public_url,
            status: session.status.as_str().to_string(),
            failure_reason: session.failure_reason,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            expires_at: session.expires_at,
        }
    }
}

/// Live tunnel sessions
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelSessionList {
    pub sessions: Vec<TunnelSession>,
    pub total: usize,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Live tunnel sessions
    pub live_tunnels: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
