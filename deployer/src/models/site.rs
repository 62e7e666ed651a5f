//! Site and deployment log models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::DeployError;
use crate::models::job::ProviderKind;

/// Site deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Pending,
    Building,
    Live,
    DeploymentFailed,
    Deleted,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Pending => "pending",
            SiteStatus::Building => "building",
            SiteStatus::Live => "live",
            SiteStatus::DeploymentFailed => "deployment_failed",
            SiteStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SiteStatus::Pending),
            "building" => Ok(SiteStatus::Building),
            "live" => Ok(SiteStatus::Live),
            "deployment_failed" => Ok(SiteStatus::DeploymentFailed),
            "deleted" => Ok(SiteStatus::Deleted),
            other => Err(DeployError::StoreError(format!("Unknown site status: {}", other))),
        }
    }
}

/// A generated site as held by the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub site_id: String,
    pub status: SiteStatus,
    pub provider: Option<ProviderKind>,
    pub deployed_url: Option<String>,
    pub deployment_id: Option<String>,
    pub custom_domain: Option<String>,
    pub last_error: Option<String>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            status: SiteStatus::Pending,
            provider: None,
            deployed_url: None,
            deployment_id: None,
            custom_domain: None,
            last_error: None,
            last_deployed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Deployment log status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Started => "started",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
        }
    }
}

impl FromStr for LogStatus {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(LogStatus::Started),
            "completed" => Ok(LogStatus::Completed),
            "failed" => Ok(LogStatus::Failed),
            other => Err(DeployError::StoreError(format!("Unknown log status: {}", other))),
        }
    }
}

/// One orchestration attempt for a site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLog {
    pub id: String,
    pub site_id: String,
    pub provider: ProviderKind,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
}

impl DeploymentLog {
    pub fn started(site_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            site_id: site_id.into(),
            provider,
            status: LogStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            metadata: serde_json::json!({}),
            error_message: None,
        }
    }
}

/// Final fields written when an attempt ends
#[derive(Debug, Clone, PartialEq)]
pub struct LogCompletion {
    pub status: LogStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
}
