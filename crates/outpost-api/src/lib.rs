//! HTTP surface of the manager
//!
//! Queue operations for callers and polling agents, tunnel session control,
//! and the public reverse-proxy forwarder under `/tunnel/`.

pub mod error;
pub mod handlers;
pub mod models;
pub mod proxy;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{any, get, post},
    Json, Router,
};
use outpost_control::TunnelSessionManager;
use outpost_queue::TaskDispatcher;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;

use crate::proxy::ProxyClient;

/// Application state shared across handlers
pub struct AppState {
    pub dispatcher: TaskDispatcher,
    pub sessions: Arc<TunnelSessionManager>,
    pub proxy_client: ProxyClient,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Outpost API",
        version = "0.1.0",
        description = "Task queues for polling agents and on-demand tunnels to their web interfaces"
    ),
    paths(
        handlers::health_check,
        handlers::enqueue_command,
        handlers::enqueue_http_request,
        handlers::poll_tasks,
        handlers::list_tasks,
        handlers::get_task,
        handlers::report_task,
        handlers::cancel_task,
        handlers::delete_task,
        handlers::queue_summary,
        handlers::purge_tasks,
        handlers::connect_tunnel,
        handlers::list_tunnels,
        handlers::get_tunnel,
        handlers::touch_tunnel,
        handlers::disconnect_tunnel,
    ),
    components(
        schemas(
            models::EnqueueCommandRequest,
            models::EnqueueHttpRequest,
            models::Task,
            models::TaskList,
            models::TaskListQuery,
            models::PollResponse,
            models::TaskOutcome,
            models::ReportRequest,
            models::ReportResponse,
            models::StatusCountsResponse,
            models::KindSummaryResponse,
            models::SummaryResponse,
            models::PurgeRequest,
            models::PurgeResponse,
            models::TunnelEndpointResponse,
            models::TunnelSession,
            models::TunnelSessionList,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "queue", description = "Command and HTTP request queues"),
        (name = "agents", description = "Endpoints called by polling agents"),
        (name = "tunnels", description = "Tunnel session management"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS for local dashboard development
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3080)),
            enable_cors: false,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        dispatcher: TaskDispatcher,
        sessions: Arc<TunnelSessionManager>,
    ) -> Self {
        let state = Arc::new(AppState {
            dispatcher,
            sessions,
            proxy_client: proxy::build_client(),
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_json))
            // Queues
            .route(
                "/api/agents/{agent_id}/commands",
                post(handlers::enqueue_command),
            )
            .route(
                "/api/agents/{agent_id}/http-requests",
                post(handlers::enqueue_http_request),
            )
            .route("/api/agents/{agent_id}/poll", post(handlers::poll_tasks))
            .route("/api/queue/summary", get(handlers::queue_summary))
            .route("/api/queue/purge", post(handlers::purge_tasks))
            .route("/api/queue/{kind}", get(handlers::list_tasks))
            .route(
                "/api/queue/{kind}/{id}",
                get(handlers::get_task).delete(handlers::delete_task),
            )
            .route(
                "/api/queue/{kind}/{id}/report",
                post(handlers::report_task),
            )
            .route(
                "/api/queue/{kind}/{id}/cancel",
                post(handlers::cancel_task),
            )
            // Tunnels
            .route(
                "/api/agents/{agent_id}/tunnel",
                post(handlers::connect_tunnel),
            )
            .route("/api/tunnels", get(handlers::list_tunnels))
            .route(
                "/api/tunnels/{id}",
                get(handlers::get_tunnel).delete(handlers::disconnect_tunnel),
            )
            .route("/api/tunnels/{id}/touch", post(handlers::touch_tunnel))
            // Public forwarder
            .route("/tunnel/{binding_id}", any(proxy::forward_root))
            .route("/tunnel/{binding_id}/", any(proxy::forward_root))
            .route("/tunnel/{binding_id}/{*path}", any(proxy::forward))
            .with_state(self.state.clone());

        let mut router = api_router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin([
                    HeaderValue::from_static("http://localhost:3000"),
                    HeaderValue::from_static("http://127.0.0.1:3000"),
                ]);
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/queue/{kind}/{id}/report"));
        assert!(doc.paths.paths.contains_key("/api/agents/{agent_id}/tunnel"));
    }
}
