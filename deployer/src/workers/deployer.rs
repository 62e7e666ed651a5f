//! Deployment worker loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::orchestrator::Orchestrator;
use crate::errors::{DeployError, DeployResult};
use crate::models::job::DeploymentJob;
use crate::queue::{FailOutcome, JobQueue};

/// Deployment worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Worker index, for logs
    pub id: usize,
    /// How long one dequeue blocks
    pub dequeue_timeout: Duration,
    /// Pause after a queue or store error
    pub error_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            id: 0,
            dequeue_timeout: Duration::from_secs(5),
            error_delay: Duration::from_secs(5),
        }
    }
}

/// What happened to one dequeued job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing was ready
    Idle,
    Completed,
    Retrying { retry_count: u32 },
    DeadLettered,
    /// Site deleted mid-flight, or the job was reclaimed before we finished
    Discarded,
}

/// Pull one job and take it to completion, retry or dead-letter
pub async fn run_once(
    queue: &dyn JobQueue,
    orchestrator: &Orchestrator,
    timeout: Duration,
) -> DeployResult<JobOutcome> {
    match queue.dequeue(timeout).await? {
        Some(job) => handle_job(queue, orchestrator, job).await,
        None => Ok(JobOutcome::Idle),
    }
}

async fn handle_job(
    queue: &dyn JobQueue,
    orchestrator: &Orchestrator,
    job: DeploymentJob,
) -> DeployResult<JobOutcome> {
    match orchestrator.process_job(&job).await {
        Ok(result) if result.success => {
            queue.complete(&job.id).await?;
            Ok(JobOutcome::Completed)
        }
        Ok(result) => {
            let error = result.error.unwrap_or_else(|| "deployment failed".to_string());
            retry(queue, orchestrator, &job, &error).await
        }
        Err(DeployError::SiteDeleted(site_id)) => {
            info!(job_id = %job.id, site_id = %site_id, "Site deleted, dropping job");
            queue.complete(&job.id).await?;
            Ok(JobOutcome::Discarded)
        }
        Err(e) if e.is_infrastructure() => {
            // Retry count untouched; if the queue is down too the reaper
            // picks the job up later
            match queue.release(&job).await {
                Ok(_) => warn!(job_id = %job.id, error = %e, "Backend unavailable, job released"),
                Err(release_error) => {
                    warn!(job_id = %job.id, error = %release_error, "Job left in processing")
                }
            }
            Err(e)
        }
        Err(e) if !e.is_retryable() => {
            let error = e.to_string();
            let outcome = queue.dead_letter(&job, &error).await?;
            settle(orchestrator, &job, &error, outcome).await
        }
        Err(e) => retry(queue, orchestrator, &job, &e.to_string()).await,
    }
}

async fn retry(
    queue: &dyn JobQueue,
    orchestrator: &Orchestrator,
    job: &DeploymentJob,
    error: &str,
) -> DeployResult<JobOutcome> {
    let outcome = queue.fail(job, error).await?;
    settle(orchestrator, job, error, outcome).await
}

async fn settle(
    orchestrator: &Orchestrator,
    job: &DeploymentJob,
    error: &str,
    outcome: FailOutcome,
) -> DeployResult<JobOutcome> {
    match outcome {
        FailOutcome::Retrying { retry_count, .. } => Ok(JobOutcome::Retrying { retry_count }),
        FailOutcome::DeadLettered => {
            // The reaper reconciles the site if this write is lost
            orchestrator.mark_failed(job.site_id(), error).await?;
            Ok(JobOutcome::DeadLettered)
        }
        FailOutcome::NotProcessing => {
            warn!(job_id = %job.id, "Job already reclaimed, result dropped");
            Ok(JobOutcome::Discarded)
        }
    }
}

/// Run the deployment worker until shutdown. A job in flight is finished
/// before the shutdown signal is observed.
pub async fn run<S, F>(
    options: &Options,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(worker = options.id, "Deployment worker starting...");

    loop {
        let next = tokio::select! {
            _ = &mut shutdown_signal => {
                info!(worker = options.id, "Deployment worker shutting down...");
                return;
            }
            next = queue.dequeue(options.dequeue_timeout) => next,
        };

        let result = match next {
            Ok(Some(job)) => handle_job(queue.as_ref(), &orchestrator, job).await,
            Ok(None) => continue,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => debug!(worker = options.id, ?outcome, "Job handled"),
            Err(e) => {
                error!(worker = options.id, error = %e, "Deployment worker error");
                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!(worker = options.id, "Deployment worker shutting down...");
                        return;
                    }
                    _ = sleep_fn(options.error_delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::deploy::fsm::SiteEvent;
    use crate::deploy::orchestrator;
    use crate::models::job::{JobData, ProviderKind};
    use crate::models::site::{DeploymentLog, LogCompletion, Site, SiteStatus};
    use crate::providers::ProviderRegistry;
    use crate::queue::MemoryJobQueue;
    use crate::store::{MemorySiteStore, SiteStore};
    use crate::utils::ManualClock;
    use crate::workers::reaper;

    fn build_orchestrator(store: Arc<dyn SiteStore>) -> Orchestrator {
        Orchestrator::new(ProviderRegistry::new(), store, orchestrator::Options::default())
    }

    /// Memory store that can go fully down, or drop only `failed` writes
    #[derive(Default)]
    struct FlakyStore {
        inner: MemorySiteStore,
        down: AtomicBool,
        drop_failures: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> DeployResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DeployError::StoreError("unreachable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SiteStore for FlakyStore {
        async fn get_site(&self, site_id: &str) -> DeployResult<Option<Site>> {
            self.check()?;
            self.inner.get_site(site_id).await
        }

        async fn transition_site(&self, site_id: &str, event: SiteEvent) -> DeployResult<Site> {
            self.check()?;
            if self.drop_failures.load(Ordering::SeqCst) && matches!(event, SiteEvent::Fail { .. }) {
                return Err(DeployError::StoreError("connection reset".to_string()));
            }
            self.inner.transition_site(site_id, event).await
        }

        async fn insert_log(&self, log: &DeploymentLog) -> DeployResult<()> {
            self.check()?;
            self.inner.insert_log(log).await
        }

        async fn finish_log(&self, log_id: &str, completion: LogCompletion) -> DeployResult<()> {
            self.check()?;
            self.inner.finish_log(log_id, completion).await
        }

        async fn list_logs(&self, site_id: &str, limit: usize) -> DeployResult<Vec<DeploymentLog>> {
            self.check()?;
            self.inner.list_logs(site_id, limit).await
        }

        async fn ping(&self) -> DeployResult<()> {
            self.check()
        }
    }

    #[tokio::test]
    async fn test_idle_when_empty() {
        let queue = MemoryJobQueue::new();
        let store = Arc::new(MemorySiteStore::new());
        let outcome = run_once(&queue, &build_orchestrator(store), Duration::ZERO).await.unwrap();
        assert_eq!(outcome, JobOutcome::Idle);
    }

    #[tokio::test]
    async fn test_invalid_bundle_is_dead_lettered() {
        let queue = MemoryJobQueue::new();
        let store = Arc::new(MemorySiteStore::new());
        let empty = tempfile::tempdir().unwrap();
        queue
            .enqueue(
                JobData::new("s1", empty.path().to_string_lossy(), ProviderKind::Vercel),
                0,
            )
            .await
            .unwrap();

        let outcome = run_once(&queue, &build_orchestrator(store.clone()), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::DeadLettered);

        let failed = queue.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.retry_count, 0);
        assert!(failed[0].error.contains("index.html"));

        let site = store.get_site("s1").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::DeploymentFailed);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let store = Arc::new(MemorySiteStore::new());
        let orchestrator = Arc::new(build_orchestrator(store));
        let options = Options {
            dequeue_timeout: Duration::from_millis(10),
            ..Default::default()
        };

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            run(
                &options,
                queue,
                orchestrator,
                tokio::time::sleep,
                Box::pin(async move {
                    let _ = rx.await;
                }),
            )
            .await;
        });

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_outage_does_not_use_retries() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let queue = MemoryJobQueue::with_clock(clock.clone());
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::SeqCst);
        let orchestrator = build_orchestrator(store.clone());

        let bundle = tempfile::tempdir().unwrap();
        std::fs::write(bundle.path().join("index.html"), "<h1>ok</h1>").unwrap();
        let mut data = JobData::new("s1", bundle.path().to_string_lossy(), ProviderKind::Vercel);
        data.max_retries = Some(2);
        queue.enqueue(data, 0).await.unwrap();

        for _ in 0..3 {
            let err = run_once(&queue, &orchestrator, Duration::ZERO).await.unwrap_err();
            assert!(err.is_infrastructure());
            clock.advance(Duration::from_secs(60));
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delayed, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.failed, 0);

        let job = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_lost_failure_write_is_reconciled() {
        let queue = MemoryJobQueue::new();
        let store = Arc::new(FlakyStore::default());
        store.drop_failures.store(true, Ordering::SeqCst);
        let orchestrator = build_orchestrator(store.clone());

        let empty = tempfile::tempdir().unwrap();
        queue
            .enqueue(
                JobData::new("s1", empty.path().to_string_lossy(), ProviderKind::Vercel),
                0,
            )
            .await
            .unwrap();

        let err = run_once(&queue, &orchestrator, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DeployError::StoreError(_)));
        assert_eq!(queue.stats().await.unwrap().failed, 1);
        let site = store.get_site("s1").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Building);

        store.drop_failures.store(false, Ordering::SeqCst);
        let repaired = reaper::reconcile_dead_letters(&reaper::Options::default(), &queue, &orchestrator).await;
        assert_eq!(repaired, 1);

        let site = store.get_site("s1").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::DeploymentFailed);
        assert!(site.last_error.unwrap().contains("index.html"));

        // Already failed: nothing left to repair
        let repaired = reaper::reconcile_dead_letters(&reaper::Options::default(), &queue, &orchestrator).await;
        assert_eq!(repaired, 0);
    }
}
