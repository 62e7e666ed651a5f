//! Deployment API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<ComponentCheck>,
}

/// Reachability of one backing component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub component: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Site deployment status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatusResponse {
    pub site_id: String,
    pub status: String,
    pub deployed_url: Option<String>,
    pub last_deployed_at: Option<DateTime<Utc>>,
}

/// Response to a deployment trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub job_id: String,
}

/// Response to a dead-letter retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub success: bool,
    pub job_id: Option<String>,
}

/// Response to clearing the dead-letter list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearedResponse {
    pub success: bool,
    pub cleared: usize,
}

/// Generic error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
