use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction, RedisResult};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{ExecutionResult, Job, JobState};

/// Redis queue semantics - defines only key shapes and claim/completion
/// rules, not runtime logic. Keeps the dispatcher and workers from
/// drifting apart and makes depth-based autoscaling predictable.

pub const KEY_PREFIX: &str = "sentinel";

/// Canonical queue name for a language.
pub fn queue_name(language: &str) -> String {
    format!("{language}-executor")
}

/// Legacy numbered-instance queue name.
pub fn instance_queue_name(language: &str, instance: u32) -> String {
    format!("{language}-executor-{instance}")
}

/// Every queue a language's jobs may land on under the configured topology.
pub fn queue_names(language: &str, instances: u32) -> Vec<String> {
    if instances <= 1 {
        vec![queue_name(language)]
    } else {
        (1..=instances)
            .map(|n| instance_queue_name(language, n))
            .collect()
    }
}

/// Language a queue serves, recovered from its name.
pub fn queue_language(queue: &str) -> &str {
    match queue.split_once("-executor") {
        Some((language, _)) => language,
        None => queue,
    }
}

/// Instance label of a queue; the un-numbered canonical queue is "1".
pub fn queue_instance_id(queue: &str) -> &str {
    match queue.rsplit_once("-executor-") {
        Some((_, n)) => n,
        None => "1",
    }
}

fn job_key(id: &str) -> String {
    format!("{KEY_PREFIX}:job:{id}")
}

fn wait_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:wait")
}

fn active_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:active")
}

fn delayed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:delayed")
}

fn completed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:completed")
}

fn failed_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:failed")
}

fn counts_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:queue:{queue}:counts")
}

/// Exponential backoff: `base * 2^(attempt-1)`, where `attempt` counts the
/// failures seen so far (1 after the first failure).
fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
}

fn json_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        e.to_string(),
    ))
}

/// Retry/retention policy attached to a job when it is enqueued.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub remove_on_complete: u64,
    pub remove_on_fail: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 2000,
            remove_on_complete: 50,
            remove_on_fail: 20,
        }
    }
}

/// A job record as stored on the broker, including claim metadata.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: Job,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub result: Option<ExecutionResult>,
    pub failed_reason: Option<String>,
}

/// Per-queue counter snapshot. `waiting` includes retry-delayed jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// One named broker queue. Cheap to clone; all cross-process state lives
/// in Redis so clones share the same queue.
#[derive(Clone)]
pub struct Queue {
    name: String,
    conn: ConnectionManager,
}

impl Queue {
    pub fn new(name: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job under its own id so it can be looked up directly.
    pub async fn add(&mut self, job: &Job, policy: &RetryPolicy) -> RedisResult<()> {
        let payload = serde_json::to_string(job).map_err(json_error)?;
        let id = job.id.to_string();
        let key = job_key(&id);
        let fields: Vec<(&str, String)> = vec![
            ("queue", self.name.clone()),
            ("state", JobState::Waiting.as_str().to_string()),
            ("progress", "0".to_string()),
            ("attemptsMade", "0".to_string()),
            ("maxAttempts", policy.attempts.to_string()),
            ("backoffMs", policy.backoff_ms.to_string()),
            ("removeOnComplete", policy.remove_on_complete.to_string()),
            ("removeOnFail", policy.remove_on_fail.to_string()),
            ("payload", payload),
            ("createdAt", job.created_at.to_rfc3339()),
        ];
        let _: () = redis::pipe()
            .hset_multiple(&key, &fields)
            .ignore()
            .lpush(wait_key(&self.name), &id)
            .ignore()
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Atomically claim the oldest waiting job, blocking up to
    /// `timeout_secs`. Due retries are promoted first.
    pub async fn claim(&mut self, timeout_secs: f64) -> RedisResult<Option<JobRecord>> {
        self.promote_due_retries().await?;
        let id: Option<String> = self
            .conn
            .blmove(
                wait_key(&self.name),
                active_key(&self.name),
                Direction::Right,
                Direction::Left,
                timeout_secs,
            )
            .await?;
        let Some(id) = id else { return Ok(None) };

        let _: () = self
            .conn
            .hset(job_key(&id), "state", JobState::Active.as_str())
            .await?;
        match self.fetch_record(&id).await? {
            Some(record) => Ok(Some(record)),
            None => {
                // Evicted or corrupt record; drop the dangling claim.
                let _: () = self.conn.lrem(active_key(&self.name), 1, &id).await?;
                Ok(None)
            }
        }
    }

    /// Move retry-delayed jobs whose backoff has elapsed back to the wait
    /// list. ZREM decides the winner if several claimers race.
    async fn promote_due_retries(&mut self) -> RedisResult<()> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = self
            .conn
            .zrangebyscore_limit(delayed_key(&self.name), "-inf", now, 0, 16)
            .await?;
        for id in due {
            let removed: i64 = self.conn.zrem(delayed_key(&self.name), &id).await?;
            if removed > 0 {
                let _: () = self.conn.lpush(wait_key(&self.name), &id).await?;
            }
        }
        Ok(())
    }

    pub async fn update_progress(&mut self, id: &Uuid, progress: u8) -> RedisResult<()> {
        let _: () = self
            .conn
            .hset(job_key(&id.to_string()), "progress", progress)
            .await?;
        Ok(())
    }

    /// Resolve a claim with its result and move the job to the completed
    /// retention list, evicting the oldest entries beyond the policy.
    pub async fn complete(&mut self, id: &Uuid, result: &ExecutionResult) -> RedisResult<()> {
        let id = id.to_string();
        let key = job_key(&id);
        let payload = serde_json::to_string(result).map_err(json_error)?;
        let keep: Option<u64> = self.conn.hget(&key, "removeOnComplete").await?;
        let _: () = redis::pipe()
            .hset(&key, "state", JobState::Completed.as_str())
            .ignore()
            .hset(&key, "result", payload)
            .ignore()
            .hset(&key, "progress", 100)
            .ignore()
            .hset(&key, "finishedAt", Utc::now().to_rfc3339())
            .ignore()
            .lrem(active_key(&self.name), 1, &id)
            .ignore()
            .lpush(completed_key(&self.name), &id)
            .ignore()
            .hincr(counts_key(&self.name), "completed", 1)
            .ignore()
            .query_async(&mut self.conn)
            .await?;
        self.trim_retention(&completed_key(&self.name), keep.unwrap_or(50))
            .await
    }

    /// Record a failed claim. Returns `true` when the job was re-scheduled
    /// for a retry, `false` when it failed permanently.
    pub async fn fail(&mut self, id: &Uuid, reason: &str) -> RedisResult<bool> {
        let id = id.to_string();
        let key = job_key(&id);
        let attempts: u32 = self.conn.hincr(&key, "attemptsMade", 1).await?;
        let max_attempts: Option<u32> = self.conn.hget(&key, "maxAttempts").await?;
        let _: () = self.conn.lrem(active_key(&self.name), 1, &id).await?;

        if attempts < max_attempts.unwrap_or(1) {
            let base: Option<u64> = self.conn.hget(&key, "backoffMs").await?;
            let due = Utc::now().timestamp_millis()
                + backoff_delay_ms(base.unwrap_or(2000), attempts) as i64;
            let _: () = redis::pipe()
                .hset(&key, "state", JobState::Waiting.as_str())
                .ignore()
                .hset(&key, "failedReason", reason)
                .ignore()
                .zadd(delayed_key(&self.name), &id, due)
                .ignore()
                .query_async(&mut self.conn)
                .await?;
            return Ok(true);
        }

        let keep: Option<u64> = self.conn.hget(&key, "removeOnFail").await?;
        let _: () = redis::pipe()
            .hset(&key, "state", JobState::Failed.as_str())
            .ignore()
            .hset(&key, "failedReason", reason)
            .ignore()
            .hset(&key, "finishedAt", Utc::now().to_rfc3339())
            .ignore()
            .lpush(failed_key(&self.name), &id)
            .ignore()
            .hincr(counts_key(&self.name), "failed", 1)
            .ignore()
            .query_async(&mut self.conn)
            .await?;
        self.trim_retention(&failed_key(&self.name), keep.unwrap_or(20))
            .await?;
        Ok(false)
    }

    /// Keep the newest `keep` entries of a retention list; evicted job
    /// records are deleted outright.
    async fn trim_retention(&mut self, list: &str, keep: u64) -> RedisResult<()> {
        loop {
            let len: u64 = self.conn.llen(list).await?;
            if len <= keep {
                return Ok(());
            }
            let evicted: Option<String> = self.conn.rpop(list, None).await?;
            match evicted {
                Some(id) => {
                    let _: () = self.conn.del(job_key(&id)).await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Look up a job by id. Only returns jobs that belong to this queue so
    /// the dispatcher can probe queues one by one.
    pub async fn get_by_id(&mut self, id: &Uuid) -> RedisResult<Option<JobRecord>> {
        let id = id.to_string();
        let owner: Option<String> = self.conn.hget(job_key(&id), "queue").await?;
        if owner.as_deref() != Some(self.name.as_str()) {
            return Ok(None);
        }
        self.fetch_record(&id).await
    }

    pub async fn get_state(&mut self, id: &Uuid) -> RedisResult<Option<JobState>> {
        let state: Option<String> = self.conn.hget(job_key(&id.to_string()), "state").await?;
        Ok(state.as_deref().and_then(JobState::parse))
    }

    async fn fetch_record(&mut self, id: &str) -> RedisResult<Option<JobRecord>> {
        let hash: HashMap<String, String> = self.conn.hgetall(job_key(id)).await?;
        let Some(payload) = hash.get("payload") else {
            return Ok(None);
        };
        let job: Job = serde_json::from_str(payload).map_err(json_error)?;
        let state = hash
            .get("state")
            .and_then(|s| JobState::parse(s))
            .unwrap_or(JobState::Waiting);
        let result = match hash.get("result") {
            Some(raw) => Some(serde_json::from_str(raw).map_err(json_error)?),
            None => None,
        };
        Ok(Some(JobRecord {
            job,
            state,
            progress: hash
                .get("progress")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            attempts_made: hash
                .get("attemptsMade")
                .and_then(|a| a.parse().ok())
                .unwrap_or(0),
            result,
            failed_reason: hash.get("failedReason").cloned(),
        }))
    }

    /// Fresh counter reads; never cached, so placement sees real depths.
    pub async fn counts(&mut self) -> RedisResult<QueueCounts> {
        let waiting: u64 = self.conn.llen(wait_key(&self.name)).await?;
        let delayed: u64 = self.conn.zcard(delayed_key(&self.name)).await?;
        let active: u64 = self.conn.llen(active_key(&self.name)).await?;
        let completed: Option<u64> = self.conn.hget(counts_key(&self.name), "completed").await?;
        let failed: Option<u64> = self.conn.hget(counts_key(&self.name), "failed").await?;
        Ok(QueueCounts {
            waiting: waiting + delayed,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    /// Readiness probe used by the health endpoint.
    pub async fn is_ready(&mut self) -> bool {
        let probe: RedisResult<u64> = self.conn.llen(wait_key(&self.name)).await;
        probe.is_ok()
    }
}

/// Broker liveness check.
pub async fn ping(conn: &mut ConnectionManager) -> RedisResult<String> {
    redis::cmd("PING").query_async(conn).await
}
