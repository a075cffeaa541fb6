//! Optional Redis-backed rate limiter (spec.md §4.3 "optional Redis-backed
//! variant"), for deployments that run more than one gateway process
//! sharing the same window state. Falls back to fail-open (allow the call)
//! when Redis is unreachable, per spec.md §7's persistence-error policy:
//! a broken downstream dependency must never deny live traffic on its own.
//!
//! Implements the same sliding-window algorithm as
//! [`crate::core::rate_limiter::RateLimiter`] but backed by a Redis sorted
//! set per composite key: `ZREMRANGEBYSCORE` prunes entries older than the
//! window, `ZCARD` reads the current count, `ZADD` records the call.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const WINDOW_MS: i64 = 60_000;

pub struct RedisRateLimiter {
    manager: ConnectionManager,
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// Checks and records one call against `key` in a single round trip.
    /// Returns `true` (allow) on any Redis error — the caller should log
    /// and continue, never treat this as a deny.
    pub async fn check_and_record(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        match self.try_check_and_record(key, limit).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(error = %err, "redis rate limiter unreachable, failing open");
                true
            }
        }
    }

    async fn try_check_and_record(&self, key: &str, limit: u32) -> redis::RedisResult<bool> {
        let mut conn = self.manager.clone();
        let now = now_ms();
        let window_start = now - WINDOW_MS;

        let _: () = conn.zrembyscore(key, 0, window_start).await?;
        let count: u64 = conn.zcard(key).await?;

        if count >= limit as u64 {
            return Ok(false);
        }

        let member = format!("{}-{}", now, uuid::Uuid::new_v4());
        let _: () = conn.zadd(key, member, now).await?;
        let _: () = conn.expire(key, (WINDOW_MS / 1000) as i64).await?;
        Ok(true)
    }

    /// Mirrors a call into the composite key's sorted set without enforcing
    /// any limit itself — used when the in-process `RateLimiter` remains
    /// the sole decision authority and Redis exists only to give other
    /// gateway processes visibility into this process's window.
    pub async fn record(&self, key: &str) {
        if let Err(err) = self.try_record(key).await {
            tracing::warn!(error = %err, "redis rate limiter mirror write failed");
        }
    }

    async fn try_record(&self, key: &str) -> redis::RedisResult<()> {
        let mut conn = self.manager.clone();
        let now = now_ms();
        let window_start = now - WINDOW_MS;
        let member = format!("{}-{}", now, uuid::Uuid::new_v4());

        let _: () = conn.zrembyscore(key, 0, window_start).await?;
        let _: () = conn.zadd(key, member, now).await?;
        let _: () = conn.expire(key, (WINDOW_MS / 1000) as i64).await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}
