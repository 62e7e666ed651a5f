//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use deploy_api::models::{
    ClearedResponse, ComponentCheck, ErrorResponse, HealthResponse, RetryResponse,
    SiteStatusResponse, TriggerResponse, VersionResponse,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::errors::DeployError;
use crate::models::job::JobData;
use crate::models::site::Site;
use crate::server::state::ServerState;
use crate::utils::version_info;

pub const SERVICE_NAME: &str = "sitedeploy";

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// `DeployError` rendered as a JSON error body
#[derive(Debug)]
pub struct ApiError(DeployError);

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            DeployError::ValidationError(_) | DeployError::ProviderNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::Conflict(_)
            | DeployError::SiteDeleted(_)
            | DeployError::InvalidTransition(_) => StatusCode::CONFLICT,
            DeployError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            DeployError::RedisError(_)
            | DeployError::DatabaseError(_)
            | DeployError::QueueError(_)
            | DeployError::StoreError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
            error!(status = status.as_u16(), "Request failed: {}", self.0);
        }
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn site_response(site: Site) -> SiteStatusResponse {
    SiteStatusResponse {
        site_id: site.site_id,
        status: site.status.to_string(),
        deployed_url: site.deployed_url,
        last_deployed_at: site.last_deployed_at,
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

/// Health check handler; 503 when the store or the queue is unreachable
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let database = match state.store.ping().await {
        Ok(()) => ComponentCheck {
            component: "database".to_string(),
            healthy: true,
            error: None,
        },
        Err(e) => ComponentCheck {
            component: "database".to_string(),
            healthy: false,
            error: Some(e.to_string()),
        },
    };
    let queue_health = state.queue.health_check().await;
    let queue = ComponentCheck {
        component: "queue".to_string(),
        healthy: queue_health.healthy,
        error: queue_health.error,
    };

    let healthy = database.healthy && queue.healthy;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        service: SERVICE_NAME.to_string(),
        timestamp: Utc::now(),
        checks: vec![database, queue],
    };
    (status, Json(body))
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Trigger body: job data plus an optional queue priority
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(flatten)]
    pub data: JobData,
    #[serde(default)]
    pub priority: i64,
}

pub async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(|e| DeployError::ValidationError(e.body_text()))?;
    let site_id = request.data.site_id.clone();
    let job_id = state.queue.enqueue(request.data, request.priority).await?;
    info!(job_id = %job_id, site_id = %site_id, priority = request.priority, "Deployment queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            success: true,
            job_id,
        }),
    ))
}

pub async fn site_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<SiteStatusResponse>> {
    let site = state
        .store
        .get_site(&site_id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("site {}", site_id)))?;
    Ok(Json(site_response(site)))
}

/// Deployment attempts for a site, newest first
pub async fn site_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(site_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let logs = state.store.list_logs(&site_id, query.limit()).await?;
    Ok(Json(logs))
}

pub async fn queue_stats_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queue.stats().await?))
}

pub async fn queue_health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let health = state.queue.health_check().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

pub async fn failed_jobs_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queue.list_failed(query.limit()).await?))
}

pub async fn retry_failed_handler(
    State(state): State<Arc<ServerState>>,
    Path(index): Path<usize>,
) -> ApiResult<Json<RetryResponse>> {
    match state.queue.retry_failed(index).await? {
        Some(job_id) => {
            info!(job_id = %job_id, index, "Dead-lettered job requeued");
            Ok(Json(RetryResponse {
                success: true,
                job_id: Some(job_id),
            }))
        }
        None => Err(DeployError::NotFound(format!("failed job at index {}", index)).into()),
    }
}

pub async fn clear_failed_handler(State(state): State<Arc<ServerState>>) -> ApiResult<Json<ClearedResponse>> {
    let cleared = state.queue.clear_failed().await?;
    info!(cleared, "Dead-letter list cleared");
    Ok(Json(ClearedResponse {
        success: true,
        cleared,
    }))
}

pub async fn delete_site_handler(
    State(state): State<Arc<ServerState>>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<SiteStatusResponse>> {
    let site = state.orchestrator.delete(&site_id).await?;
    Ok(Json(site_response(site)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub target_deployment_id: String,
}

/// Always 501 until providers expose rollback
pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(site_id): Path<String>,
    body: Result<Json<RollbackRequest>, JsonRejection>,
) -> ApiResult<Json<SiteStatusResponse>> {
    let target = body
        .map(|Json(request)| request.target_deployment_id)
        .unwrap_or_default();
    let site = state.orchestrator.rollback(&site_id, &target).await?;
    Ok(Json(site_response(site)))
}
