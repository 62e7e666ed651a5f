//! Visibility-timeout sweep.
//!
//! A worker that dies mid-job leaves its entry in the processing set. The
//! reaper periodically routes entries older than the visibility timeout back
//! through the queue's failure path. It also marks sites failed for
//! dead-lettered jobs whose status write never landed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::deploy::orchestrator::Orchestrator;
use crate::queue::{FailOutcome, JobQueue, VISIBILITY_TIMEOUT_ERROR};

/// Reaper options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,
    /// Processing age after which a job counts as abandoned
    pub visibility_timeout: Duration,
    /// Dead-letter entries checked per sweep
    pub dead_letter_scan: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(15 * 60),
            dead_letter_scan: 1000,
        }
    }
}

/// One sweep; returns how many jobs were reclaimed
pub async fn sweep(options: &Options, queue: &dyn JobQueue, orchestrator: &Orchestrator) -> usize {
    let reclaimed = match queue.requeue_stale(options.visibility_timeout).await {
        Ok(reclaimed) => reclaimed,
        Err(e) => {
            error!("Visibility sweep failed: {}", e);
            return 0;
        }
    };

    for entry in &reclaimed {
        if entry.outcome == FailOutcome::DeadLettered {
            if let Err(e) = orchestrator
                .mark_failed(entry.job.site_id(), VISIBILITY_TIMEOUT_ERROR)
                .await
            {
                error!(job_id = %entry.job.id, "Failed to mark site failed: {}", e);
            }
        }
    }

    if reclaimed.is_empty() {
        debug!("Visibility sweep found no stale jobs");
    } else {
        info!(count = reclaimed.len(), "Visibility sweep reclaimed jobs");
    }

    reconcile_dead_letters(options, queue, orchestrator).await;
    reclaimed.len()
}

/// Mark sites failed whose dead-lettered job left them `building`
pub async fn reconcile_dead_letters(options: &Options, queue: &dyn JobQueue, orchestrator: &Orchestrator) -> usize {
    let failed = match queue.list_failed(options.dead_letter_scan).await {
        Ok(failed) => failed,
        Err(e) => {
            error!("Dead-letter scan failed: {}", e);
            return 0;
        }
    };

    let mut repaired = 0;
    for entry in &failed {
        match orchestrator.reconcile_dead_letter(entry).await {
            Ok(true) => repaired += 1,
            Ok(false) => {}
            Err(e) => {
                error!(job_id = %entry.job.id, "Failed to reconcile site: {}", e);
            }
        }
    }
    if repaired > 0 {
        info!(count = repaired, "Reconciled sites of dead-lettered jobs");
    }
    repaired
}

/// Run the reaper until shutdown
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
    info!(
        visibility_timeout_secs = options.visibility_timeout.as_secs(),
        "Reaper starting..."
    );

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reaper shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        sweep(options, queue.as_ref(), &orchestrator).await;
    }
}
