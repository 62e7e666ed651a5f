//! Priority job queue.
//!
//! Jobs are ordered by a score of `now - priority * K`, so a higher priority
//! always wins and equal priorities run in arrival order. Dequeued jobs move
//! to a processing set until they are completed or failed. Failed jobs wait
//! in a delayed set for `2^retryCount` seconds before they become pending
//! again; jobs that run out of retries land in the dead-letter list.
//!
//! Two backends implement [`JobQueue`]: [`RedisJobQueue`] for multi-process
//! deployments and [`MemoryJobQueue`] for tests and single-process use.

mod memory;
mod redis;

pub use memory::MemoryJobQueue;
pub use self::redis::{RedisJobQueue, RedisQueueOptions};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::DeployResult;
use crate::models::job::{DeploymentJob, FailedJob, JobData};

/// Priority weight in milliseconds (~115 days of recency per priority step)
pub const PRIORITY_WEIGHT_MS: i64 = 10_000_000_000;

/// Error text recorded when the visibility sweep reclaims a job
pub const VISIBILITY_TIMEOUT_ERROR: &str = "visibility timeout exceeded";

/// Ordering score for a job becoming ready at `ready_at_ms`
pub fn score(ready_at_ms: i64, priority: i64) -> f64 {
    (ready_at_ms - priority * PRIORITY_WEIGHT_MS) as f64
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Ready and backing-off jobs
    pub pending: usize,
    /// Subset of `pending` still waiting out a backoff
    pub delayed: usize,
    pub processing: usize,
    pub failed: usize,
    pub total_processed: u64,
}

/// Result of a queue health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub queue_sizes: Option<QueueStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What `fail` did with a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued with this retry count, ready after the delay
    Retrying { retry_count: u32, delay: Duration },
    /// Moved to the dead-letter list
    DeadLettered,
    /// The job was no longer in the processing set
    NotProcessing,
}

/// A processing entry reclaimed by the visibility sweep
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub job: DeploymentJob,
    pub outcome: FailOutcome,
}

/// Durable priority queue contract
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Validate and enqueue a new job, returning its id
    async fn enqueue(&self, data: JobData, priority: i64) -> DeployResult<String>;

    /// Wait up to `timeout` for the lowest-score ready job and move it to the
    /// processing set. Each job is handed to exactly one caller.
    async fn dequeue(&self, timeout: Duration) -> DeployResult<Option<DeploymentJob>>;

    /// Drop a finished job from the processing set; no-op if absent
    async fn complete(&self, job_id: &str) -> DeployResult<()>;

    /// Put a processing job back in the pending set with its retry count
    /// unchanged. Returns false if the job was no longer processing.
    async fn release(&self, job: &DeploymentJob) -> DeployResult<bool>;

    /// Requeue with backoff, or dead-letter once retries are exhausted
    async fn fail(&self, job: &DeploymentJob, error: &str) -> DeployResult<FailOutcome>;

    /// Dead-letter immediately, for failures a retry would only repeat
    async fn dead_letter(&self, job: &DeploymentJob, error: &str) -> DeployResult<FailOutcome>;

    async fn stats(&self) -> DeployResult<QueueStats>;

    /// Dead-letter entries in the order they failed
    async fn list_failed(&self, limit: usize) -> DeployResult<Vec<FailedJob>>;

    /// Reset a dead-lettered job and enqueue it again
    async fn retry_failed(&self, index: usize) -> DeployResult<Option<String>>;

    async fn clear_failed(&self) -> DeployResult<usize>;

    async fn health_check(&self) -> QueueHealth;

    /// Route processing entries older than `older_than` through `fail`
    async fn requeue_stale(&self, older_than: Duration) -> DeployResult<Vec<Reclaimed>>;

    /// Release backend resources
    async fn shutdown(&self) -> DeployResult<()> {
        Ok(())
    }
}
