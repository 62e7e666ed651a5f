//! In-process job queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{
    FailOutcome, JobQueue, QueueHealth, QueueStats, Reclaimed, PRIORITY_WEIGHT_MS, VISIBILITY_TIMEOUT_ERROR,
};
use crate::errors::DeployResult;
use crate::models::job::{DeploymentJob, FailedJob, JobData};
use crate::utils::{backoff_delay, Clock, SystemClock};

// Upper bound on a single wait so due delayed jobs are noticed
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct State {
    /// (score, seq) -> job id
    pending: BTreeMap<(i64, u64), String>,
    /// (ready_at_ms, seq) -> job id
    delayed: BTreeMap<(i64, u64), String>,
    /// job id -> dequeued at (ms)
    processing: HashMap<String, i64>,
    jobs: HashMap<String, DeploymentJob>,
    failed: Vec<FailedJob>,
    total_processed: u64,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_pending(&mut self, job: DeploymentJob, ready_at_ms: i64) {
        let seq = self.next_seq();
        let score = ready_at_ms - job.priority * PRIORITY_WEIGHT_MS;
        self.pending.insert((score, seq), job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    fn push_delayed(&mut self, job: DeploymentJob, ready_at_ms: i64) {
        let seq = self.next_seq();
        self.delayed.insert((ready_at_ms, seq), job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    /// Move due delayed jobs into the pending set
    fn promote(&mut self, now_ms: i64) {
        while let Some(entry) = self.delayed.first_entry() {
            let (ready_at, _) = *entry.key();
            if ready_at > now_ms {
                break;
            }
            let id = entry.remove();
            if let Some(job) = self.jobs.remove(&id) {
                self.push_pending(job, ready_at);
            }
        }
    }

    fn pop(&mut self, now_ms: i64) -> Option<DeploymentJob> {
        self.promote(now_ms);
        let (_, id) = self.pending.pop_first()?;
        let job = self.jobs.get(&id)?.clone();
        self.processing.insert(id, now_ms);
        Some(job)
    }

    fn bury(&mut self, job: DeploymentJob, error: &str) {
        self.jobs.remove(&job.id);
        self.failed.push(FailedJob {
            job,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }

    fn fail(&mut self, job: &DeploymentJob, error: &str, now_ms: i64) -> FailOutcome {
        if self.processing.remove(&job.id).is_none() {
            return FailOutcome::NotProcessing;
        }
        if job.can_retry() {
            let mut job = job.clone();
            job.retry_count += 1;
            let delay = backoff_delay(job.retry_count);
            let retry_count = job.retry_count;
            self.push_delayed(job, now_ms + delay.as_millis() as i64);
            FailOutcome::Retrying { retry_count, delay }
        } else {
            self.bury(job.clone(), error);
            FailOutcome::DeadLettered
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len() + self.delayed.len(),
            delayed: self.delayed.len(),
            processing: self.processing.len(),
            failed: self.failed.len(),
            total_processed: self.total_processed,
        }
    }
}

/// Job queue held in process memory
pub struct MemoryJobQueue {
    state: Mutex<State>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Queue reading time from `clock`, for driving backoff in tests
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            clock,
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, data: JobData, priority: i64) -> DeployResult<String> {
        let job = DeploymentJob::new(data, priority)?;
        let id = job.id.clone();
        let site_id = job.site_id().to_string();
        {
            let mut state = self.state.lock().await;
            state.push_pending(job, self.clock.now_ms());
        }
        self.notify.notify_one();
        info!(job_id = %id, site_id = %site_id, priority, "Job enqueued");
        Ok(id)
    }

    async fn dequeue(&self, timeout: Duration) -> DeployResult<Option<DeploymentJob>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(job) = state.pop(self.clock.now_ms()) {
                    debug!(job_id = %job.id, "Job dequeued");
                    return Ok(Some(job));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining.min(POLL_INTERVAL), self.notify.notified()).await;
        }
    }

    async fn complete(&self, job_id: &str) -> DeployResult<()> {
        let mut state = self.state.lock().await;
        if state.processing.remove(job_id).is_some() {
            state.jobs.remove(job_id);
            state.total_processed += 1;
            debug!(job_id = %job_id, "Job completed");
        }
        Ok(())
    }

    async fn release(&self, job: &DeploymentJob) -> DeployResult<bool> {
        let released = {
            let mut state = self.state.lock().await;
            if state.processing.remove(&job.id).is_some() {
                let job = state.jobs.get(&job.id).cloned().unwrap_or_else(|| job.clone());
                state.push_pending(job, self.clock.now_ms());
                true
            } else {
                false
            }
        };
        if released {
            self.notify.notify_one();
            debug!(job_id = %job.id, "Job released back to pending");
        }
        Ok(released)
    }

    async fn fail(&self, job: &DeploymentJob, error: &str) -> DeployResult<FailOutcome> {
        let outcome = {
            let mut state = self.state.lock().await;
            state.fail(job, error, self.clock.now_ms())
        };
        match &outcome {
            FailOutcome::Retrying { retry_count, delay } => {
                warn!(job_id = %job.id, retry_count, delay_secs = delay.as_secs(), error = %error, "Job failed, retrying");
            }
            FailOutcome::DeadLettered => {
                warn!(job_id = %job.id, error = %error, "Job moved to dead-letter list");
            }
            FailOutcome::NotProcessing => {
                debug!(job_id = %job.id, "Job was not processing, ignoring failure");
            }
        }
        Ok(outcome)
    }

    async fn dead_letter(&self, job: &DeploymentJob, error: &str) -> DeployResult<FailOutcome> {
        let mut state = self.state.lock().await;
        if state.processing.remove(&job.id).is_none() {
            return Ok(FailOutcome::NotProcessing);
        }
        state.bury(job.clone(), error);
        warn!(job_id = %job.id, error = %error, "Job moved to dead-letter list");
        Ok(FailOutcome::DeadLettered)
    }

    async fn stats(&self) -> DeployResult<QueueStats> {
        Ok(self.state.lock().await.stats())
    }

    async fn list_failed(&self, limit: usize) -> DeployResult<Vec<FailedJob>> {
        let state = self.state.lock().await;
        Ok(state.failed.iter().take(limit).cloned().collect())
    }

    async fn retry_failed(&self, index: usize) -> DeployResult<Option<String>> {
        let id = {
            let mut state = self.state.lock().await;
            if index >= state.failed.len() {
                return Ok(None);
            }
            let mut job = state.failed.remove(index).job;
            job.retry_count = 0;
            let id = job.id.clone();
            state.push_pending(job, self.clock.now_ms());
            id
        };
        self.notify.notify_one();
        info!(job_id = %id, "Dead-lettered job re-enqueued");
        Ok(Some(id))
    }

    async fn clear_failed(&self) -> DeployResult<usize> {
        let mut state = self.state.lock().await;
        let cleared = state.failed.len();
        state.failed.clear();
        Ok(cleared)
    }

    async fn health_check(&self) -> QueueHealth {
        let started = Instant::now();
        let stats = self.state.lock().await.stats();
        QueueHealth {
            healthy: true,
            latency_ms: started.elapsed().as_millis() as u64,
            queue_sizes: Some(stats),
            error: None,
        }
    }

    async fn requeue_stale(&self, older_than: Duration) -> DeployResult<Vec<Reclaimed>> {
        let now_ms = self.clock.now_ms();
        let cutoff = now_ms - older_than.as_millis() as i64;
        let mut state = self.state.lock().await;

        let stale: Vec<DeploymentJob> = state
            .processing
            .iter()
            .filter(|(_, started)| **started <= cutoff)
            .filter_map(|(id, _)| state.jobs.get(id).cloned())
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for job in stale {
            let outcome = state.fail(&job, VISIBILITY_TIMEOUT_ERROR, now_ms);
            warn!(job_id = %job.id, ?outcome, "Reclaimed stale job");
            reclaimed.push(Reclaimed { job, outcome });
        }
        Ok(reclaimed)
    }
}
