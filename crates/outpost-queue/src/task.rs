//! Task model and payload validation

use chrono::{DateTime, Utc};
use outpost_db::TaskStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QueueError;

/// Upper bound for a queued command line
pub const MAX_COMMAND_BYTES: usize = 64 * 1024;

/// Upper bound for a queued request URL
pub const MAX_URL_BYTES: usize = 8 * 1024;

pub const MAX_AGENT_ID_LEN: usize = 255;

/// Which queue a task lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Command,
    HttpRequest,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Command => "command",
            TaskKind::HttpRequest => "http_request",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" | "commands" => Ok(TaskKind::Command),
            "http_request" | "http-request" | "http-requests" => Ok(TaskKind::HttpRequest),
            other => Err(QueueError::InvalidInput(format!(
                "Unknown task kind: {}",
                other
            ))),
        }
    }
}

/// What the agent is asked to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Command { command: String },
    HttpRequest { url: String, method: String },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Command { .. } => TaskKind::Command,
            TaskPayload::HttpRequest { .. } => TaskKind::HttpRequest,
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        TaskPayload::Command {
            command: command.into(),
        }
    }

    pub fn http_request(url: impl Into<String>, method: impl Into<String>) -> Self {
        TaskPayload::HttpRequest {
            url: url.into(),
            method: method.into(),
        }
    }

    /// Validate and normalise the payload before it is stored.
    ///
    /// Methods are upper-cased; an empty method means `GET`.
    pub fn validated(self) -> Result<Self, QueueError> {
        match self {
            TaskPayload::Command { command } => {
                if command.trim().is_empty() {
                    return Err(QueueError::InvalidInput(
                        "Command must not be empty".to_string(),
                    ));
                }
                if command.len() > MAX_COMMAND_BYTES {
                    return Err(QueueError::InvalidInput(format!(
                        "Command exceeds {} bytes",
                        MAX_COMMAND_BYTES
                    )));
                }
                Ok(TaskPayload::Command { command })
            }
            TaskPayload::HttpRequest { url, method } => {
                let url = url.trim().to_string();
                if url.is_empty() {
                    return Err(QueueError::InvalidInput("URL must not be empty".to_string()));
                }
                if url.len() > MAX_URL_BYTES {
                    return Err(QueueError::InvalidInput(format!(
                        "URL exceeds {} bytes",
                        MAX_URL_BYTES
                    )));
                }
                url.parse::<http::Uri>()
                    .map_err(|e| QueueError::InvalidInput(format!("Invalid URL {}: {}", url, e)))?;

                let method = if method.trim().is_empty() {
                    "GET".to_string()
                } else {
                    method.trim().to_ascii_uppercase()
                };
                http::Method::from_bytes(method.as_bytes())
                    .map_err(|_| QueueError::InvalidInput(format!("Invalid method: {}", method)))?;

                Ok(TaskPayload::HttpRequest { url, method })
            }
        }
    }
}

pub(crate) fn validate_agent_id(agent_id: &str) -> Result<(), QueueError> {
    if agent_id.trim().is_empty() {
        return Err(QueueError::InvalidInput(
            "Agent id must not be empty".to_string(),
        ));
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(QueueError::InvalidInput(format!(
            "Agent id exceeds {} characters",
            MAX_AGENT_ID_LEN
        )));
    }
    Ok(())
}

/// Outcome an agent reports for a delivered task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportOutcome {
    Completed,
    Failed,
}

impl ReportOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            ReportOutcome::Completed => TaskStatus::Completed,
            ReportOutcome::Failed => TaskStatus::Failed,
        }
    }
}

/// A queue entry as seen by callers and agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub kind: TaskKind,
    pub id: String,
    pub agent_id: String,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    /// Command output or HTTP response body
    pub output: Option<String>,
    pub delivery_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
