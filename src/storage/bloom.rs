//! Redis-backed membership filter and rate-limit counters
//!
//! The Bloom filter gives the lookup path its fast negative answer: a
//! `false` from `mexists` is authoritative, a `true` is only a hint that the
//! columnar index must confirm.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Serialize;

use crate::config::RedisConfig;
use crate::storage::Dependency;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Shape of `BF.INFO`, surfaced through `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BloomInfo {
    pub capacity: i64,
    pub size: i64,
    pub items_inserted: i64,
    pub expansion_rate: i64,
}

/// Handle over the membership store. Clone-cheap; the connection manager
/// multiplexes concurrent commands.
#[derive(Clone)]
pub struct BloomStore {
    conn: ConnectionManager,
    filter_name: String,
    rate_limit_script: Script,
}

impl BloomStore {
    /// Connect, verify liveness, and ensure the Bloom filter exists.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.db)
        } else {
            format!("redis://:{}@{}:{}/{}", cfg.password, cfg.host, cfg.port, cfg.db)
        };

        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to Redis")?;

        // INCR + EXPIRE must be atomic so the first request of a window
        // always arms the TTL.
        let rate_limit_script = Script::new(
            r#"
            local current = redis.call("INCR", KEYS[1])
            if current == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return current
            "#,
        );

        let store = Self {
            conn,
            filter_name: cfg.bloom_filter_name.clone(),
            rate_limit_script,
        };
        store.ping().await.context("failed to ping Redis")?;

        tracing::info!(host = %cfg.host, port = cfg.port, "connected to Redis");

        if let Err(e) = store.init_filter(cfg).await {
            tracing::warn!(error = %e, "failed to initialize Bloom filter (may already exist)");
        }

        Ok(store)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(
            PING_TIMEOUT,
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .context("Redis ping timed out")?
        .context("Redis ping failed")?;
        Ok(())
    }

    /// Reserve the filter; if it already exists, adopt it as-is. Capacity and
    /// error rate are immutable after creation.
    async fn init_filter(&self, cfg: &RedisConfig) -> Result<()> {
        let mut conn = self.conn.clone();
        let reserved = redis::cmd("BF.RESERVE")
            .arg(&self.filter_name)
            .arg(cfg.bloom_filter_error_rate)
            .arg(cfg.bloom_filter_capacity)
            .query_async::<()>(&mut conn)
            .await;

        match reserved {
            Ok(()) => {
                tracing::info!(
                    name = %self.filter_name,
                    error_rate = cfg.bloom_filter_error_rate,
                    capacity = cfg.bloom_filter_capacity,
                    "created new Bloom filter"
                );
                Ok(())
            }
            Err(reserve_err) => match self.info().await {
                Ok(info) => {
                    tracing::info!(
                        capacity = info.capacity,
                        size = info.size,
                        items = info.items_inserted,
                        "Bloom filter already exists"
                    );
                    Ok(())
                }
                Err(_) => Err(reserve_err).context("BF.RESERVE failed"),
            },
        }
    }

    /// Best-effort idempotent insert of a batch of values.
    pub async fn madd(&self, items: &[String]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("BF.MADD")
            .arg(&self.filter_name)
            .arg(items)
            .query_async::<Vec<bool>>(&mut conn)
            .await
            .context("BF.MADD failed")?;
        Ok(())
    }

    /// Positional membership verdicts. `false` guarantees the value was never
    /// added; `true` means it may be present.
    pub async fn mexists(&self, items: &[String]) -> Result<Vec<bool>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("BF.MEXISTS")
            .arg(&self.filter_name)
            .arg(items)
            .query_async::<Vec<bool>>(&mut conn)
            .await
            .context("BF.MEXISTS failed")
    }

    /// Filter observability counters.
    pub async fn info(&self) -> Result<BloomInfo> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, i64> = redis::cmd("BF.INFO")
            .arg(&self.filter_name)
            .query_async(&mut conn)
            .await
            .context("BF.INFO failed")?;

        Ok(BloomInfo {
            capacity: raw.get("Capacity").copied().unwrap_or_default(),
            size: raw.get("Size").copied().unwrap_or_default(),
            items_inserted: raw
                .get("Number of items inserted")
                .copied()
                .unwrap_or_default(),
            expansion_rate: raw.get("Expansion rate").copied().unwrap_or_default(),
        })
    }

    // ==================== Rate Limiting ====================

    /// Atomically bump the fixed-window counter for an API key hash.
    /// Returns the new count and whether the limit was exceeded.
    pub async fn incr_rate_limit(
        &self,
        api_key_hash: &str,
        limit: u64,
        window: Duration,
    ) -> Result<(u64, bool)> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .rate_limit_script
            .key(rate_limit_key(api_key_hash))
            .arg(window.as_secs())
            .invoke_async(&mut conn)
            .await
            .context("rate limit script failed")?;

        Ok((count, count > limit))
    }

    /// Remaining requests in the current window for an API key hash.
    pub async fn rate_limit_remaining(&self, api_key_hash: &str, limit: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let current: Option<u64> = redis::cmd("GET")
            .arg(rate_limit_key(api_key_hash))
            .query_async(&mut conn)
            .await
            .context("rate limit read failed")?;

        Ok(limit.saturating_sub(current.unwrap_or(0)))
    }
}

fn rate_limit_key(api_key_hash: &str) -> String {
    format!("rate_limit:{api_key_hash}")
}

#[async_trait]
impl Dependency for BloomStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        BloomStore::ping(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_keys_are_namespaced() {
        assert_eq!(rate_limit_key("abc"), "rate_limit:abc");
    }
}
