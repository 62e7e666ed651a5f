//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::{DeployError, DeployResult};
use crate::server::handlers::{
    clear_failed_handler, delete_site_handler, failed_jobs_handler, health_handler,
    queue_health_handler, queue_stats_handler, retry_failed_handler, rollback_handler,
    site_logs_handler, site_status_handler, trigger_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the HTTP router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route("/deployments/trigger", post(trigger_handler))
        .route("/deployments/{site_id}/status", get(site_status_handler))
        .route("/deployments/{site_id}/logs", get(site_logs_handler))
        // Queue
        .route("/queue/stats", get(queue_stats_handler))
        .route("/queue/health", get(queue_health_handler))
        .route("/queue/failed", get(failed_jobs_handler).delete(clear_failed_handler))
        .route("/queue/failed/{index}/retry", post(retry_failed_handler))
        // Sites
        .route("/sites/{site_id}", delete(delete_site_handler))
        .route("/sites/{site_id}/rollback", post(rollback_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> DeployResult<JoinHandle<DeployResult<()>>> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployError::ServerError(format!("bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeployError::ServerError(e.to_string()))
    });

    Ok(handle)
}
