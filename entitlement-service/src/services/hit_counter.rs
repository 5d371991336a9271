//! Per-(subject, endpoint) fixed-window hit counters.

use crate::models::RateLimitWindow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client, Script};

#[async_trait]
pub trait HitCounter: Send + Sync {
    /// Count one hit and return the window it landed in. A window whose
    /// length has elapsed is replaced by a fresh one starting at `now`.
    async fn hit(
        &self,
        subject: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, anyhow::Error>;

    /// Drop windows that can no longer affect a decision. Returns how many remain.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

/// Process-local counters. Each key's read-modify-write runs under its
/// shard lock, so concurrent hits on one key never lose an increment.
#[derive(Default)]
pub struct InMemoryHitCounter {
    windows: DashMap<(String, String), RateLimitWindow>,
}

impl InMemoryHitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl HitCounter for InMemoryHitCounter {
    async fn hit(
        &self,
        subject: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, anyhow::Error> {
        let mut entry = self
            .windows
            .entry((subject.to_string(), endpoint.to_string()))
            .or_insert_with(|| RateLimitWindow::open(now, window));

        entry.window = window;
        if entry.is_expired(now) {
            *entry = RateLimitWindow::open(now, window);
        }
        entry.count += 1;

        Ok(entry.clone())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, anyhow::Error> {
        self.windows.retain(|_, w| !w.is_expired(now));
        Ok(self.windows.len())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

const HIT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// Counters shared by every replica. The key expires with its window.
#[derive(Clone)]
pub struct RedisHitCounter {
    _client: Client,
    manager: ConnectionManager,
    script: Script,
}

impl RedisHitCounter {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis for rate limit counters");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            script: Script::new(HIT_SCRIPT),
        })
    }

    /// The endpoint is length-prefixed so a `:` in either part cannot make
    /// two (subject, endpoint) pairs share a key.
    fn key(subject: &str, endpoint: &str) -> String {
        format!("ratelimit:{}:{}:{}", endpoint.len(), endpoint, subject)
    }
}

#[async_trait]
impl HitCounter for RedisHitCounter {
    async fn hit(
        &self,
        subject: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, anyhow::Error> {
        let mut conn = self.manager.clone();
        let window_ms = window.num_milliseconds().max(1);

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(Self::key(subject, endpoint))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to count hit: {}", e))?;

        let elapsed_ms = (window_ms - ttl_ms).clamp(0, window_ms);
        Ok(RateLimitWindow {
            count,
            window_start: now - Duration::milliseconds(elapsed_ms),
            window,
        })
    }

    async fn evict_expired(&self, _now: DateTime<Utc>) -> Result<usize, anyhow::Error> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn counts_within_window_and_resets_after() {
        let counter = InMemoryHitCounter::new();
        let start = Utc::now();
        let window = Duration::minutes(1);

        for expected in 1..=3 {
            let w = counter.hit("u1", "search", window, start).await.unwrap();
            assert_eq!(w.count, expected);
            assert_eq!(w.window_start, start);
        }

        let later = start + Duration::seconds(61);
        let w = counter.hit("u1", "search", window, later).await.unwrap();
        assert_eq!(w.count, 1);
        assert_eq!(w.window_start, later);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let counter = InMemoryHitCounter::new();
        let now = Utc::now();
        let window = Duration::minutes(1);

        counter.hit("u1", "search", window, now).await.unwrap();
        counter.hit("u1", "search", window, now).await.unwrap();
        let other = counter.hit("u1", "export", window, now).await.unwrap();
        let other_user = counter.hit("u2", "search", window, now).await.unwrap();

        assert_eq!(other.count, 1);
        assert_eq!(other_user.count, 1);
    }

    #[test]
    fn redis_keys_do_not_collide_across_separators() {
        let a = RedisHitCounter::key("c", "a:b");
        let b = RedisHitCounter::key("b:c", "a");
        assert_ne!(a, b);
        assert_eq!(a, "ratelimit:3:a:b:c");
        assert_eq!(RedisHitCounter::key("user@x.com", "search"), "ratelimit:6:search:user@x.com");
    }

    #[tokio::test]
    async fn concurrent_hits_are_all_counted() {
        let counter = Arc::new(InMemoryHitCounter::new());
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                counter
                    .hit("u1", "search", Duration::minutes(1), now)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let w = counter
            .hit("u1", "search", Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(w.count, 51);
    }

    #[tokio::test]
    async fn eviction_drops_only_expired_windows() {
        let counter = InMemoryHitCounter::new();
        let now = Utc::now();
        counter.hit("old", "search", Duration::minutes(1), now).await.unwrap();
        counter.hit("fresh", "search", Duration::minutes(10), now).await.unwrap();

        let remaining = counter
            .evict_expired(now + Duration::minutes(2))
            .await
            .unwrap();

        assert_eq!(remaining, 1);
        assert_eq!(counter.tracked_windows(), 1);
    }
}
