//! Mapping of queue and tunnel errors to HTTP responses

use axum::{http::StatusCode, Json};
use outpost_control::TunnelError;
use outpost_queue::QueueError;
use tracing::error;

use crate::models::ErrorResponse;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: Some(code.to_string()),
        }),
    )
}

pub(crate) fn queue_error(e: QueueError) -> ApiError {
    let (status, code) = match &e {
        QueueError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        QueueError::NotFound { .. } => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
        QueueError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
        QueueError::Database(db_err) => {
            error!("Queue database error: {}", db_err);
            (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
        }
    };
    api_error(status, code, e.to_string())
}

pub(crate) fn tunnel_error(e: TunnelError) -> ApiError {
    let (status, code) = match &e {
        TunnelError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        TunnelError::NotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        TunnelError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
        TunnelError::PoolExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED"),
        TunnelError::ConnectionFailed { .. } => (StatusCode::BAD_GATEWAY, "CONNECTION_FAILED"),
        TunnelError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "CONNECTION_TIMEOUT"),
        TunnelError::Process(launch_err) => {
            error!("Tunnel process error: {}", launch_err);
            (StatusCode::INTERNAL_SERVER_ERROR, "PROCESS_ERROR")
        }
        TunnelError::Database(db_err) => {
            error!("Session database error: {}", db_err);
            (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
        }
    };
    api_error(status, code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_control::SessionStatus;

    #[test]
    fn test_tunnel_error_status_codes() {
        let cases = [
            (
                TunnelError::PoolExhausted {
                    range_start: 8100,
                    range_end: 8199,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                TunnelError::ConnectionFailed {
                    agent_id: "A7".to_string(),
                    reason: "probe failed".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                TunnelError::Timeout {
                    agent_id: "A7".to_string(),
                    timeout_ms: 5000,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                TunnelError::InvalidState {
                    session_id: "s1".to_string(),
                    current: SessionStatus::Terminated,
                    operation: "touch",
                },
                StatusCode::CONFLICT,
            ),
            (TunnelError::NotFound("s1".to_string()), StatusCode::NOT_FOUND),
        ];

        for (error, expected) in cases {
            let (status, Json(body)) = tunnel_error(error);
            assert_eq!(status, expected);
            assert!(body.code.is_some());
        }
    }

    #[test]
    fn test_queue_invalid_input_is_bad_request() {
        let (status, Json(body)) = queue_error(QueueError::InvalidInput("empty".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code.as_deref(), Some("INVALID_INPUT"));
    }
}
