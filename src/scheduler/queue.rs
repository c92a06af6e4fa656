//! Durable job queue with visibility timeouts.
//!
//! The queue holds at most one outstanding task per episode. A dequeued task
//! stays invisible for the visibility timeout; if it is neither acknowledged
//! nor released in time it is handed back through `reclaim_expired` so the
//! orchestrator can treat the lost attempt as a transient failure.
//!
//! # Redis layout
//!
//! - `{queue_name}:tasks`: hash `episode_id → task JSON` (the outstanding task)
//! - `{queue_name}:pending`: sorted set of episode ids scored by ready-at (ms)
//! - `{queue_name}:inflight`: sorted set of episode ids scored by visibility deadline (ms)
//!
//! Multi-key transitions run as Lua scripts so they are atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::task::Task;

/// Shortest pause between polls while waiting for a task.
const MIN_POLL_BACKOFF: Duration = Duration::from_millis(10);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The episode already has an outstanding task.
    #[error("Episode {episode_id} already has an outstanding task")]
    DuplicateTask { episode_id: Uuid },

    /// The queue backend cannot be reached.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            QueueError::Unavailable(e.to_string())
        } else {
            QueueError::RedisError(e)
        }
    }
}

impl QueueError {
    /// Whether the error is an infrastructure outage worth retrying.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionFailed(_) | QueueError::Unavailable(_)
        )
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Tasks waiting to be dequeued (including delayed retries).
    pub pending_tasks: usize,
    /// Tasks dequeued and not yet acknowledged.
    pub in_flight_tasks: usize,
}

impl QueueStats {
    /// Total number of outstanding tasks.
    pub fn total_tasks(&self) -> usize {
        self.pending_tasks + self.in_flight_tasks
    }
}

/// Contract between the orchestrator, the workers and a queue backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds a task that becomes visible after `delay`.
    ///
    /// Fails with `QueueError::DuplicateTask` when the episode already has an
    /// outstanding task.
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), QueueError>;

    /// Takes the next visible task without waiting.
    async fn try_dequeue(&self) -> Result<Option<Task>, QueueError>;

    /// Waits up to `wait` for a task, polling with exponential backoff.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        let max_backoff = (wait / 4).max(MIN_POLL_BACKOFF);
        let mut backoff = MIN_POLL_BACKOFF;

        loop {
            if let Some(task) = self.try_dequeue().await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    /// Removes a completed task. Returns `false` if `task` is no longer the
    /// outstanding task for its episode.
    async fn ack(&self, task: &Task) -> Result<bool, QueueError>;

    /// Releases an in-flight task back to pending after `delay`.
    async fn fail(&self, task: &Task, delay: Duration) -> Result<bool, QueueError>;

    /// Pushes the visibility deadline of an in-flight task forward.
    async fn extend(&self, task: &Task) -> Result<bool, QueueError>;

    /// Removes and returns in-flight tasks whose visibility timeout elapsed.
    async fn reclaim_expired(&self) -> Result<Vec<Task>, QueueError>;

    /// Returns the outstanding task for an episode, if any.
    async fn outstanding(&self, episode_id: Uuid) -> Result<Option<Task>, QueueError>;

    /// Drops whatever task the episode has outstanding.
    async fn remove(&self, episode_id: Uuid) -> Result<bool, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    fn name(&self) -> &str;
}

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// Pops the first ready id that still has a task. Pending ids without a hash
/// entry are dropped and the scan continues in batches of `ARGV[3]`.
const DEQUEUE_SCRIPT: &str = r#"
while true do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
  if #ids == 0 then
    return false
  end
  for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[2], id)
    local task = redis.call('HGET', KEYS[1], id)
    if task then
      redis.call('ZADD', KEYS[3], ARGV[2], id)
      return task
    end
  end
end
"#;

/// Ready ids fetched per `ZRANGEBYSCORE` round in `DEQUEUE_SCRIPT`.
const DEQUEUE_BATCH: usize = 16;

const ACK_SCRIPT: &str = r#"
local task = redis.call('HGET', KEYS[1], ARGV[1])
if not task or cjson.decode(task)['id'] ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local task = redis.call('HGET', KEYS[1], ARGV[1])
if not task or cjson.decode(task)['id'] ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[3], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

const EXTEND_SCRIPT: &str = r#"
local task = redis.call('HGET', KEYS[1], ARGV[1])
if not task or cjson.decode(task)['id'] ~= ARGV[2] then
  return 0
end
if not redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

const RECLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
local expired = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[2], id)
  local task = redis.call('HGET', KEYS[1], id)
  if task then
    redis.call('HDEL', KEYS[1], id)
    table.insert(expired, task)
  end
end
return expired
"#;

/// Redis-backed job queue.
pub struct RedisJobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    tasks_key: String,
    pending_key: String,
    inflight_key: String,
    visibility_timeout: Duration,
}

impl RedisJobQueue {
    /// Connects to Redis and creates a new job queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name, visibility_timeout))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(
        redis: ConnectionManager,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            tasks_key: format!("{}:tasks", queue_name),
            pending_key: format!("{}:pending", queue_name),
            inflight_key: format!("{}:inflight", queue_name),
            visibility_timeout,
        }
    }

    fn deadline_ms(&self, from_ms: i64) -> i64 {
        from_ms + self.visibility_timeout.as_millis() as i64
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(&task)?;
        let ready_at = now_ms() + delay.as_millis() as i64;

        let added: i32 = Script::new(ENQUEUE_SCRIPT)
            .key(&self.tasks_key)
            .key(&self.pending_key)
            .arg(task.episode_id.to_string())
            .arg(serialized)
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            return Err(QueueError::DuplicateTask {
                episode_id: task.episode_id,
            });
        }
        Ok(())
    }

    async fn try_dequeue(&self) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let now = now_ms();

        let data: Option<String> = Script::new(DEQUEUE_SCRIPT)
            .key(&self.tasks_key)
            .key(&self.pending_key)
            .key(&self.inflight_key)
            .arg(now)
            .arg(self.deadline_ms(now))
            .arg(DEQUEUE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, task: &Task) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let removed: i32 = Script::new(ACK_SCRIPT)
            .key(&self.tasks_key)
            .key(&self.pending_key)
            .key(&self.inflight_key)
            .arg(task.episode_id.to_string())
            .arg(task.id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn fail(&self, task: &Task, delay: Duration) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let released: i32 = Script::new(RELEASE_SCRIPT)
            .key(&self.tasks_key)
            .key(&self.pending_key)
            .key(&self.inflight_key)
            .arg(task.episode_id.to_string())
            .arg(task.id.to_string())
            .arg(now_ms() + delay.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn extend(&self, task: &Task) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let extended: i32 = Script::new(EXTEND_SCRIPT)
            .key(&self.tasks_key)
            .key(&self.inflight_key)
            .arg(task.episode_id.to_string())
            .arg(task.id.to_string())
            .arg(self.deadline_ms(now_ms()))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn reclaim_expired(&self) -> Result<Vec<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let expired: Vec<String> = Script::new(RECLAIM_SCRIPT)
            .key(&self.tasks_key)
            .key(&self.inflight_key)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;

        let mut tasks = Vec::with_capacity(expired.len());
        for data in expired {
            match serde_json::from_str::<Task>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(error = %e, "Dropping unparsable expired task"),
            }
        }
        Ok(tasks)
    }

    async fn outstanding(&self, episode_id: Uuid) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.hget(&self.tasks_key, episode_id.to_string()).await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, episode_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let member = episode_id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(&self.tasks_key, &member)
            .zrem(&self.pending_key, &member)
            .zrem(&self.inflight_key, &member);
        let (removed, _, _): (i32, i32, i32) = pipe.query_async(&mut conn).await?;

        Ok(removed == 1)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let pending: usize = conn.zcard(&self.pending_key).await?;
        let in_flight: usize = conn.zcard(&self.inflight_key).await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_tasks: pending,
            in_flight_tasks: in_flight,
        })
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}
