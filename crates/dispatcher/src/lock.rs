//! Dispatch claims: Redis-backed per-job locks.
//!
//! A dispatch claims its job before sending anything so that two workers
//! picking up the same job id (direct submission plus a sweep, or a queue
//! redelivery) cannot both send. The claim expires on its own if the
//! worker dies mid-dispatch.
//!
//! Uses Redis `SET NX EX` for atomic check-and-set with automatic TTL expiry.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use relay_common::error::AppError;

#[async_trait]
pub trait DispatchLock: Send + Sync {
    /// Returns `true` if the claim was taken, `false` if another dispatch holds it.
    async fn try_claim(&self, job_id: Uuid, ttl_secs: u64) -> Result<bool, AppError>;

    async fn release(&self, job_id: Uuid) -> Result<(), AppError>;
}

pub struct RedisDispatchLock {
    redis: ConnectionManager,
}

impl RedisDispatchLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(job_id: Uuid) -> String {
        format!("relay:dispatch:claim:{}", job_id)
    }
}

#[async_trait]
impl DispatchLock for RedisDispatchLock {
    async fn try_claim(&self, job_id: Uuid, ttl_secs: u64) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();

        // SET key "1" NX EX ttl
        // Some("OK") when the key was set, None when it already exists
        let result: Option<String> = redis::cmd("SET")
            .arg(Self::key(job_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut redis)
            .await?;

        let claimed = result.is_some();
        if !claimed {
            tracing::debug!(job_id = %job_id, "Job already claimed by another dispatch");
        }

        Ok(claimed)
    }

    async fn release(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.del::<_, ()>(Self::key(job_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_key_is_namespaced_per_job() {
        let id = Uuid::nil();
        assert_eq!(
            RedisDispatchLock::key(id),
            "relay:dispatch:claim:00000000-0000-0000-0000-000000000000"
        );
    }
}
