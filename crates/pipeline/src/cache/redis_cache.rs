//! External cache backend (Redis)
//!
//! Values live under a dedicated key prefix so `clear` cannot touch
//! unrelated data. TTLs are delegated to the server, so there is nothing
//! for `purge_expired` to do. Construction fails fast when the server is
//! unreachable; the factory falls back to the in-process backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, trace, warn};

use crate::cache::{CacheStats, CacheStatsSnapshot, CacheStore};
use crate::config::CacheConfig;
use crate::error::{PipelineError, PipelineResult};

const KEY_PREFIX: &str = "flowmetrics:cache:";

/// Redis-backed TTL cache
pub struct RedisCache {
    manager: ConnectionManager,
    config: CacheConfig,
    stats: CacheStats,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.config.redis_url)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to the configured server; errors propagate to the factory
    /// so it can fall back
    pub async fn connect(config: CacheConfig) -> PipelineResult<Self> {
        let url = config
            .redis_url
            .clone()
            .ok_or_else(|| PipelineError::configuration("external cache requires a redis URL"))?;

        let client = redis::Client::open(url.as_str())?;
        let manager = ConnectionManager::new(client).await?;
        debug!("Connected to external cache at {}", url);

        Ok(Self {
            manager,
            config,
            stats: CacheStats::default(),
        })
    }

    fn prefixed(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    fn effective_ttl_secs(&self, ttl: Option<Duration>) -> u64 {
        ttl.unwrap_or(self.config.default_ttl).as_secs().max(1)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn backend_name(&self) -> &'static str {
        "external-cache"
    }

    async fn get(&self, key: &str) -> PipelineResult<Option<serde_json::Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::prefixed(key))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => {
                self.stats.record_hit();
                trace!("Cache HIT for key: {}", key);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => {
                self.stats.record_miss();
                trace!("Cache MISS for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> PipelineResult<()> {
        let raw = serde_json::to_string(&value)?;
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::prefixed(key))
            .arg(raw)
            .arg("EX")
            .arg(self.effective_ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.stats.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> PipelineResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(Self::prefixed(key))
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            self.stats.record_delete();
        }
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        let mut conn = self.manager.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(Self::prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(found > 0)
    }

    async fn clear(&self) -> PipelineResult<()> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{KEY_PREFIX}*"))
            .query_async(&mut conn)
            .await?;
        if keys.is_empty() {
            return Ok(());
        }

        let mut del = redis::cmd("DEL");
        for key in &keys {
            del.arg(key);
        }
        del.query_async::<_, ()>(&mut conn).await?;
        debug!("Cleared {} cached keys", keys.len());
        Ok(())
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> PipelineResult<HashMap<String, serde_json::Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.manager.clone();
        let mut mget = redis::cmd("MGET");
        for key in keys {
            mget.arg(Self::prefixed(key));
        }
        let raw: Vec<Option<String>> = mget.query_async(&mut conn).await?;

        let mut found = HashMap::new();
        for (key, value) in keys.iter().zip(raw) {
            match value {
                Some(raw) => {
                    self.stats.record_hit();
                    found.insert(key.clone(), serde_json::from_str(&raw)?);
                }
                None => self.stats.record_miss(),
            }
        }
        Ok(found)
    }

    async fn set_many(
        &self,
        values: HashMap<String, serde_json::Value>,
        ttl: Option<Duration>,
    ) -> PipelineResult<()> {
        let ttl_secs = self.effective_ttl_secs(ttl);
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for (key, value) in &values {
            pipe.cmd("SET")
                .arg(Self::prefixed(key))
                .arg(serde_json::to_string(value)?)
                .arg("EX")
                .arg(ttl_secs)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        for _ in 0..values.len() {
            self.stats.record_set();
        }
        Ok(())
    }

    /// The server expires keys natively
    async fn purge_expired(&self) -> PipelineResult<usize> {
        Ok(0)
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.manager.clone();
        match redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("External cache health check failed: {}", e);
                false
            }
        }
    }
}
