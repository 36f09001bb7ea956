//! Dispatch task queue on a Redis list.
//!
//! Producers `LPUSH` job ids, the worker `BRPOP`s them. Delivery is
//! at-least-once; dispatching a job twice is harmless.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use relay_common::error::AppError;

const QUEUE_KEY: &str = "relay:dispatch:queue";

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule a dispatch of `job_id`.
    async fn enqueue(&self, job_id: Uuid) -> Result<(), AppError>;

    /// Wait up to `timeout_secs` for the next job id.
    async fn pop(&self, timeout_secs: u64) -> Result<Option<Uuid>, AppError>;
}

#[derive(Clone)]
pub struct RedisTaskQueue {
    redis: ConnectionManager,
}

impl RedisTaskQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Number of tasks waiting.
    pub async fn depth(&self) -> Result<u64, AppError> {
        let mut redis = self.redis.clone();
        let depth: u64 = redis.llen(QUEUE_KEY).await?;
        Ok(depth)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.lpush::<_, _, ()>(QUEUE_KEY, job_id.to_string()).await?;
        tracing::debug!(job_id = %job_id, "Dispatch task enqueued");
        Ok(())
    }

    /// Entries that are not valid ids are dropped with a warning.
    async fn pop(&self, timeout_secs: u64) -> Result<Option<Uuid>, AppError> {
        let mut redis = self.redis.clone();
        let entry: Option<(String, String)> = redis.brpop(QUEUE_KEY, timeout_secs as f64).await?;

        let Some((_, raw)) = entry else {
            return Ok(None);
        };

        match Uuid::parse_str(&raw) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                tracing::warn!(entry = %raw, error = %e, "Dropping malformed dispatch task");
                Ok(None)
            }
        }
    }
}
