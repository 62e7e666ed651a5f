//! Error types for the deployment service

use thiserror::Error;

use crate::models::job::ProviderKind;

/// Main error type for the deployment service
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Queue backend error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Provider {0} is not configured")]
    ProviderNotConfigured(ProviderKind),

    #[error("{provider} API error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    ProviderError {
        provider: ProviderKind,
        status: Option<u16>,
        message: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Site {0} has been deleted")]
    SiteDeleted(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate
pub type DeployResult<T> = Result<T, DeployError>;

impl DeployError {
    /// Whether a job failing with this error should go back through the
    /// queue's backoff path. Input errors reproduce identically on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DeployError::ValidationError(_)
                | DeployError::ProviderNotConfigured(_)
                | DeployError::SiteDeleted(_)
                | DeployError::InvalidTransition(_)
                | DeployError::Unsupported(_)
        )
    }

    /// Queue or metadata store unavailable. The job itself is not at
    /// fault, so it goes back to the queue without using up a retry.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            DeployError::RedisError(_)
                | DeployError::DatabaseError(_)
                | DeployError::QueueError(_)
                | DeployError::StoreError(_)
        )
    }

    pub fn provider(provider: ProviderKind, status: Option<u16>, message: impl Into<String>) -> Self {
        DeployError::ProviderError {
            provider,
            status,
            message: message.into(),
        }
    }
}
