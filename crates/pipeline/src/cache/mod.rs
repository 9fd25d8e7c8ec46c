//! Cache Store
//!
//! Uniform TTL cache contract over a selectable backend: an in-process map
//! with LRU eviction, an embedded SQLite file, or an external Redis cache
//! that falls back to the in-process map when unreachable at construction.
//! All backends expose identical hit/miss/set/delete/eviction counters.

pub mod memory_cache;
pub mod redis_cache;
pub mod sqlite_cache;

pub use memory_cache::MemoryCache;
pub use redis_cache::RedisCache;
pub use sqlite_cache::SqliteCache;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CacheBackend, CacheConfig};
use crate::error::PipelineResult;

/// Point-in-time view of cache counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Lookups that returned a live entry
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry)
    pub misses: u64,
    /// Successful writes
    pub sets: u64,
    /// Successful deletes
    pub deletes: u64,
    /// Entries removed by capacity eviction
    pub evictions: u64,
}

impl CacheStatsSnapshot {
    /// Hits as a fraction of all lookups
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared atomic counters, identical across backends
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot all counters
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Uniform cache contract over JSON values
///
/// `get` never returns an entry past its expiry, regardless of backend.
/// A `None` TTL on writes uses the configured default.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend identifier for logs and health reports
    fn backend_name(&self) -> &'static str;

    /// Look up a key
    async fn get(&self, key: &str) -> PipelineResult<Option<serde_json::Value>>;

    /// Write a key with an optional TTL override
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> PipelineResult<()>;

    /// Remove a key, returning whether it existed
    async fn delete(&self, key: &str) -> PipelineResult<bool>;

    /// Whether a live entry exists for the key
    async fn exists(&self, key: &str) -> PipelineResult<bool>;

    /// Remove every entry
    async fn clear(&self) -> PipelineResult<()>;

    /// Look up many keys; absent keys are omitted from the result
    async fn get_many(
        &self,
        keys: &[String],
    ) -> PipelineResult<HashMap<String, serde_json::Value>>;

    /// Write many keys with one TTL
    async fn set_many(
        &self,
        entries: HashMap<String, serde_json::Value>,
        ttl: Option<Duration>,
    ) -> PipelineResult<()>;

    /// Drop expired entries, returning the count removed
    async fn purge_expired(&self) -> PipelineResult<usize>;

    /// Counter snapshot
    fn stats(&self) -> CacheStatsSnapshot;

    /// Backend liveness
    async fn health_check(&self) -> bool;
}

/// Build the configured cache backend
///
/// The external backend degrades to the in-process map when the remote
/// cache is unreachable at construction.
pub async fn build_cache(config: &CacheConfig) -> PipelineResult<Arc<dyn CacheStore>> {
    match config.backend {
        CacheBackend::Memory => {
            info!("Cache backend: memory");
            Ok(Arc::new(MemoryCache::new(config.clone())))
        }
        CacheBackend::EmbeddedSql => {
            info!("Cache backend: embedded SQL");
            Ok(Arc::new(SqliteCache::new(config.clone())?))
        }
        CacheBackend::ExternalCache => match RedisCache::connect(config.clone()).await {
            Ok(cache) => {
                info!("Cache backend: external (redis)");
                Ok(Arc::new(cache))
            }
            Err(e) => {
                warn!("External cache unreachable ({}), falling back to memory", e);
                Ok(Arc::new(MemoryCache::new(config.clone())))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        let snapshot = stats.snapshot();
        assert!((snapshot.hit_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        assert!(CacheStatsSnapshot::default().hit_rate().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_factory_builds_memory_backend() {
        let config = CacheConfig {
            backend: CacheBackend::Memory,
            ..CacheConfig::default()
        };
        let cache = build_cache(&config).await.unwrap();
        assert_eq!(cache.backend_name(), "memory");
    }
}
