//! Redis-backed job queue.
//!
//! Layout under the key prefix `p`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `p:pending` | zset | `{seq:016}:{id}` scored by `readyAt - priority * K` |
//! | `p:delayed` | zset | `{seq:016}:{id}` scored by `readyAt` |
//! | `p:processing` | hash | id -> dequeued at (ms) |
//! | `p:jobs` | hash | id -> job JSON |
//! | `p:failed` | list | dead-letter entries (JSON) |
//! | `p:stats:processed` | string | completed job counter |
//! | `p:seq` | string | arrival counter |
//!
//! The sequence prefix makes equal scores pop in arrival order. Every
//! operation that touches more than one key runs as a Lua script so that
//! concurrent workers never observe a half-moved job.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use super::{
    FailOutcome, JobQueue, QueueHealth, QueueStats, Reclaimed, PRIORITY_WEIGHT_MS, VISIBILITY_TIMEOUT_ERROR,
};
use crate::errors::DeployResult;
use crate::models::job::{DeploymentJob, FailedJob, JobData};
use crate::utils::backoff_delay;

/// KEYS: pending, jobs, seq
/// ARGV: id, job json, score
const ENQUEUE_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[3], string.format('%016d:%s', seq, ARGV[1]))
return seq
"#;

/// Promote due delayed jobs, then pop the lowest score into processing.
///
/// KEYS: pending, delayed, processing, jobs, seq
/// ARGV: now (ms), priority weight
const DEQUEUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'WITHSCORES')
for i = 1, #due, 2 do
    local member = due[i]
    local ready_at = tonumber(due[i + 1])
    redis.call('ZREM', KEYS[2], member)
    local body = redis.call('HGET', KEYS[4], string.sub(member, 18))
    if body then
        local priority = tonumber(cjson.decode(body)['priority']) or 0
        local score = ready_at - priority * tonumber(ARGV[2])
        redis.call('ZADD', KEYS[1], string.format('%.0f', score), member)
    end
end

while true do
    local popped = redis.call('ZPOPMIN', KEYS[1])
    if #popped == 0 then
        return nil
    end
    local id = string.sub(popped[1], 18)
    local body = redis.call('HGET', KEYS[4], id)
    if body then
        redis.call('HSET', KEYS[3], id, ARGV[1])
        return body
    end
end
"#;

/// KEYS: processing, jobs, processed counter
/// ARGV: id
const COMPLETE_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('INCR', KEYS[3])
return 1
"#;

/// Only a job still in processing may move on, so a late failure from a
/// worker whose job was already reclaimed is dropped. When ARGV[5] is set,
/// the processing entry must still carry that dequeue time, so a sweep never
/// reclaims a newer attempt of the same job.
///
/// KEYS: processing, delayed, jobs, failed, seq
/// ARGV: id, 'retry' | 'bury', payload json, ready_at (ms), dequeued at (ms) or ''
/// Returns 0 (not processing), 1 (retrying), 2 (dead-lettered)
const FAIL_SCRIPT: &str = r#"
if ARGV[5] ~= '' and redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[5] then
    return 0
end
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
    return 0
end
if ARGV[2] == 'retry' then
    local seq = redis.call('INCR', KEYS[5])
    redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
    redis.call('ZADD', KEYS[2], ARGV[4], string.format('%016d:%s', seq, ARGV[1]))
    return 1
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('RPUSH', KEYS[4], ARGV[3])
return 2
"#;

/// KEYS: processing, pending, seq
/// ARGV: id, score
const RELEASE_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
    return 0
end
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[2], ARGV[2], string.format('%016d:%s', seq, ARGV[1]))
return 1
"#;

/// Remove a dead-letter entry if it is still at `index`, then enqueue the
/// reset job.
///
/// KEYS: failed, pending, jobs, seq
/// ARGV: index, expected entry, id, job json, score
const RETRY_FAILED_SCRIPT: &str = r#"
if redis.call('LINDEX', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('LSET', KEYS[1], ARGV[1], '__retried__')
redis.call('LREM', KEYS[1], 1, '__retried__')
local seq = redis.call('INCR', KEYS[4])
redis.call('HSET', KEYS[3], ARGV[3], ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[5], string.format('%016d:%s', seq, ARGV[3]))
return 1
"#;

/// Redis queue options
#[derive(Debug, Clone)]
pub struct RedisQueueOptions {
    pub key_prefix: String,
    /// Sleep between empty polls while a dequeue is blocking
    pub poll_interval: Duration,
}

impl Default for RedisQueueOptions {
    fn default() -> Self {
        Self {
            key_prefix: "deploy".to_string(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

struct Keys {
    pending: String,
    delayed: String,
    processing: String,
    jobs: String,
    failed: String,
    processed: String,
    seq: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            pending: format!("{}:pending", prefix),
            delayed: format!("{}:delayed", prefix),
            processing: format!("{}:processing", prefix),
            jobs: format!("{}:jobs", prefix),
            failed: format!("{}:failed", prefix),
            processed: format!("{}:stats:processed", prefix),
            seq: format!("{}:seq", prefix),
        }
    }
}

/// Job queue shared by every process pointed at the same Redis
pub struct RedisJobQueue {
    conn: ConnectionManager,
    keys: Keys,
    poll_interval: Duration,
    enqueue_script: Script,
    dequeue_script: Script,
    complete_script: Script,
    fail_script: Script,
    release_script: Script,
    retry_failed_script: Script,
}

impl RedisJobQueue {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str, options: RedisQueueOptions) -> DeployResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(prefix = %options.key_prefix, "Connected to Redis queue");

        Ok(Self {
            conn,
            keys: Keys::new(&options.key_prefix),
            poll_interval: options.poll_interval,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            fail_script: Script::new(FAIL_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            retry_failed_script: Script::new(RETRY_FAILED_SCRIPT),
        })
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn push_pending(&self, job: &DeploymentJob) -> DeployResult<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(job)?;
        let score = Self::now_ms() - job.priority * PRIORITY_WEIGHT_MS;
        let _: i64 = self
            .enqueue_script
            .key(&self.keys.pending)
            .key(&self.keys.jobs)
            .key(&self.keys.seq)
            .arg(&job.id)
            .arg(body)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_dequeue(&self) -> DeployResult<Option<DeploymentJob>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = self
            .dequeue_script
            .key(&self.keys.pending)
            .key(&self.keys.delayed)
            .key(&self.keys.processing)
            .key(&self.keys.jobs)
            .key(&self.keys.seq)
            .arg(Self::now_ms())
            .arg(PRIORITY_WEIGHT_MS)
            .invoke_async(&mut conn)
            .await?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn run_fail(
        &self,
        job: &DeploymentJob,
        mode: &str,
        payload: String,
        ready_at: i64,
        dequeued_at: Option<i64>,
    ) -> DeployResult<i64> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .fail_script
            .key(&self.keys.processing)
            .key(&self.keys.delayed)
            .key(&self.keys.jobs)
            .key(&self.keys.failed)
            .key(&self.keys.seq)
            .arg(&job.id)
            .arg(mode)
            .arg(payload)
            .arg(ready_at)
            .arg(dequeued_at.map(|t| t.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(code)
    }

    async fn bury(&self, job: &DeploymentJob, error: &str, dequeued_at: Option<i64>) -> DeployResult<FailOutcome> {
        let entry = FailedJob {
            job: job.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&entry)?;
        match self.run_fail(job, "bury", payload, 0, dequeued_at).await? {
            0 => Ok(FailOutcome::NotProcessing),
            _ => {
                warn!(job_id = %job.id, error = %error, "Job moved to dead-letter list");
                Ok(FailOutcome::DeadLettered)
            }
        }
    }

    /// Backoff or dead-letter `job`; with `dequeued_at`, only the attempt
    /// dequeued at that time is affected
    async fn fail_attempt(
        &self,
        job: &DeploymentJob,
        error: &str,
        dequeued_at: Option<i64>,
    ) -> DeployResult<FailOutcome> {
        if !job.can_retry() {
            return self.bury(job, error, dequeued_at).await;
        }

        let mut retried = job.clone();
        retried.retry_count += 1;
        let delay = backoff_delay(retried.retry_count);
        let ready_at = Self::now_ms() + delay.as_millis() as i64;
        let payload = serde_json::to_string(&retried)?;

        match self.run_fail(job, "retry", payload, ready_at, dequeued_at).await? {
            0 => {
                debug!(job_id = %job.id, "Job was not processing, ignoring failure");
                Ok(FailOutcome::NotProcessing)
            }
            _ => {
                warn!(job_id = %job.id, retry_count = retried.retry_count, delay_secs = delay.as_secs(), error = %error, "Job failed, retrying");
                Ok(FailOutcome::Retrying {
                    retry_count: retried.retry_count,
                    delay,
                })
            }
        }
    }

    async fn read_stats(&self) -> DeployResult<QueueStats> {
        let mut conn = self.conn.clone();
        let (pending, delayed, processing, failed, processed): (usize, usize, usize, usize, Option<u64>) =
            redis::pipe()
                .atomic()
                .zcard(&self.keys.pending)
                .zcard(&self.keys.delayed)
                .hlen(&self.keys.processing)
                .llen(&self.keys.failed)
                .get(&self.keys.processed)
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            pending: pending + delayed,
            delayed,
            processing,
            failed,
            total_processed: processed.unwrap_or(0),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, data: JobData, priority: i64) -> DeployResult<String> {
        let job = DeploymentJob::new(data, priority)?;
        self.push_pending(&job).await?;
        info!(job_id = %job.id, site_id = %job.site_id(), priority, "Job enqueued");
        Ok(job.id)
    }

    async fn dequeue(&self, timeout: Duration) -> DeployResult<Option<DeploymentJob>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_dequeue().await? {
                debug!(job_id = %job.id, "Job dequeued");
                return Ok(Some(job));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    async fn complete(&self, job_id: &str) -> DeployResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .complete_script
            .key(&self.keys.processing)
            .key(&self.keys.jobs)
            .key(&self.keys.processed)
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        if removed == 1 {
            debug!(job_id = %job_id, "Job completed");
        }
        Ok(())
    }

    async fn release(&self, job: &DeploymentJob) -> DeployResult<bool> {
        let mut conn = self.conn.clone();
        let score = Self::now_ms() - job.priority * PRIORITY_WEIGHT_MS;
        let released: i64 = self
            .release_script
            .key(&self.keys.processing)
            .key(&self.keys.pending)
            .key(&self.keys.seq)
            .arg(&job.id)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        if released == 1 {
            debug!(job_id = %job.id, "Job released back to pending");
        }
        Ok(released == 1)
    }

    async fn fail(&self, job: &DeploymentJob, error: &str) -> DeployResult<FailOutcome> {
        self.fail_attempt(job, error, None).await
    }

    async fn dead_letter(&self, job: &DeploymentJob, error: &str) -> DeployResult<FailOutcome> {
        self.bury(job, error, None).await
    }

    async fn stats(&self) -> DeployResult<QueueStats> {
        self.read_stats().await
    }

    async fn list_failed(&self, limit: usize) -> DeployResult<Vec<FailedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .lrange(&self.keys.failed, 0, limit as isize - 1)
            .await?;

        Ok(entries
            .iter()
            .filter_map(|raw| match serde_json::from_str::<FailedJob>(raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable dead-letter entry: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn retry_failed(&self, index: usize) -> DeployResult<Option<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lindex(&self.keys.failed, index as isize).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut job = serde_json::from_str::<FailedJob>(&raw)?.job;
        job.retry_count = 0;
        let score = Self::now_ms() - job.priority * PRIORITY_WEIGHT_MS;
        let body = serde_json::to_string(&job)?;

        let moved: i64 = self
            .retry_failed_script
            .key(&self.keys.failed)
            .key(&self.keys.pending)
            .key(&self.keys.jobs)
            .key(&self.keys.seq)
            .arg(index)
            .arg(raw)
            .arg(&job.id)
            .arg(body)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            // Entry moved under us (concurrent retry or clear)
            return Ok(None);
        }
        info!(job_id = %job.id, "Dead-lettered job re-enqueued");
        Ok(Some(job.id))
    }

    async fn clear_failed(&self) -> DeployResult<usize> {
        let mut conn = self.conn.clone();
        let (cleared, _): (usize, i64) = redis::pipe()
            .atomic()
            .llen(&self.keys.failed)
            .del(&self.keys.failed)
            .query_async(&mut conn)
            .await?;
        Ok(cleared)
    }

    async fn health_check(&self) -> QueueHealth {
        let started = Instant::now();
        let mut conn = self.conn.clone();
        let ping: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = ping {
            return QueueHealth {
                healthy: false,
                latency_ms,
                queue_sizes: None,
                error: Some(e.to_string()),
            };
        }

        match self.read_stats().await {
            Ok(stats) => QueueHealth {
                healthy: true,
                latency_ms,
                queue_sizes: Some(stats),
                error: None,
            },
            Err(e) => QueueHealth {
                healthy: false,
                latency_ms,
                queue_sizes: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn requeue_stale(&self, older_than: Duration) -> DeployResult<Vec<Reclaimed>> {
        let mut conn = self.conn.clone();
        let cutoff = Self::now_ms() - older_than.as_millis() as i64;
        let processing: HashMap<String, i64> = conn.hgetall(&self.keys.processing).await?;

        let mut reclaimed = Vec::new();
        for (id, started) in processing {
            if started > cutoff {
                continue;
            }
            let body: Option<String> = conn.hget(&self.keys.jobs, &id).await?;
            let Some(body) = body else {
                // Completed between the two reads
                continue;
            };
            let job: DeploymentJob = serde_json::from_str(&body)?;
            let outcome = self
                .fail_attempt(&job, VISIBILITY_TIMEOUT_ERROR, Some(started))
                .await?;
            if outcome != FailOutcome::NotProcessing {
                warn!(job_id = %id, ?outcome, "Reclaimed stale job");
                reclaimed.push(Reclaimed { job, outcome });
            }
        }
        Ok(reclaimed)
    }
}
