//! Public reverse-proxy forwarder
//!
//! `/tunnel/{binding_id}/{*path}` is resolved through the proxy registry and
//! forwarded over plain HTTP to the session's local tunnel port. Every
//! forwarded request counts as activity on the session.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode, Uri, Version},
    response::Response,
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use outpost_control::TunnelError;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{api_error, tunnel_error, ApiResult};
use crate::AppState;

pub type ProxyClient = Client<HttpConnector, Body>;

pub fn build_client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// `ANY /tunnel/{binding_id}/{*path}`
pub async fn forward(
    State(state): State<Arc<AppState>>,
    Path((binding_id, path)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Response> {
    proxy(&state, &binding_id, &path, req).await
}

/// `ANY /tunnel/{binding_id}/`
pub async fn forward_root(
    State(state): State<Arc<AppState>>,
    Path(binding_id): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    proxy(&state, &binding_id, "", req).await
}

async fn proxy(state: &AppState, binding_id: &str, path: &str, req: Request) -> ApiResult<Response> {
    let binding = state.sessions.proxies().lookup(binding_id).map_err(|_| {
        api_error(
            StatusCode::NOT_FOUND,
            "BINDING_NOT_FOUND",
            format!("Tunnel '{}' not found", binding_id),
        )
    })?;

    state
        .sessions
        .touch(&binding.session_id)
        .await
        .map_err(|e| match e {
            TunnelError::NotFound(_) | TunnelError::InvalidState { .. } => api_error(
                StatusCode::GONE,
                "SESSION_GONE",
                format!("Tunnel session {} is no longer live", binding.session_id),
            ),
            other => tunnel_error(other),
        })?;

    let mut target = format!("http://{}/{}", binding.upstream_addr(), path);
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }
    debug!(binding_id, "Proxying request to {}", target);

    let uri: Uri = target.parse().map_err(|e| {
        error!("Invalid target URI {}: {:?}", target, e);
        api_error(StatusCode::BAD_REQUEST, "INVALID_PATH", "Invalid request path")
    })?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    // The upstream client speaks HTTP/1.1 regardless of the inbound protocol
    parts.version = Version::HTTP_11;
    parts.headers.remove(header::CONNECTION);
    if let Ok(host) = HeaderValue::from_str(&binding.upstream_addr()) {
        parts.headers.insert(header::HOST, host);
    }

    let response = state
        .proxy_client
        .request(Request::from_parts(parts, body))
        .await
        .map_err(|e| {
            error!(binding_id, "Proxy request failed: {:?}", e);
            api_error(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNREACHABLE",
                "Tunnel endpoint did not answer",
            )
        })?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}
