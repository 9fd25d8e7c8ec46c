//! In-process cache backend
//!
//! A map behind a mutex with TTL entries and least-recently-accessed
//! eviction. When at capacity, a write evicts the coldest 10% of entries
//! in one sweep. A lookup never returns an expired entry; it removes it
//! and counts a miss instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::{CacheStats, CacheStatsSnapshot, CacheStore};
use crate::config::CacheConfig;
use crate::error::PipelineResult;

/// One cached value with its bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
    expires_at: Instant,
    access_count: u64,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(value: serde_json::Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            last_accessed: now,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }
}

/// In-process TTL/LRU cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: CacheConfig,
    stats: CacheStats,
}

impl MemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            stats: CacheStats::default(),
        }
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.config.default_ttl)
    }

    /// Evict the least-recently-accessed 10% (at least one entry).
    /// Caller holds the map lock.
    fn evict_coldest(&self, entries: &mut HashMap<String, CacheEntry>) {
        let count = (entries.len() / 10).max(1);
        // Coldest first; ties broken toward less-used, then older entries
        let mut by_access: Vec<(String, Instant, u64, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed, e.access_count, e.created_at))
            .collect();
        by_access.sort_by_key(|(_, accessed, uses, created)| (*accessed, *uses, *created));

        for (key, ..) in by_access.into_iter().take(count) {
            entries.remove(&key);
        }
        self.stats.record_evictions(count as u64);
        debug!("Evicted {} cold cache entries", count);
    }

    fn insert(&self, entries: &mut HashMap<String, CacheEntry>, key: &str, entry: CacheEntry) {
        if !entries.contains_key(key) && entries.len() >= self.config.max_entries {
            self.evict_coldest(entries);
        }
        entries.insert(key.to_string(), entry);
        self.stats.record_set();
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> PipelineResult<Option<serde_json::Value>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.touch();
                self.stats.record_hit();
                trace!("Cache HIT for key: {}", key);
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                self.stats.record_miss();
                trace!("Cache MISS (expired) for key: {}", key);
                Ok(None)
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
        let entry = CacheEntry::new(value, self.effective_ttl(ttl));
        let mut entries = self.entries.lock();
        self.insert(&mut entries, key, entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> PipelineResult<bool> {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.stats.record_delete();
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        let entries = self.entries.lock();
        Ok(entries.get(key).is_some_and(|e| !e.is_expired()))
    }

    async fn clear(&self) -> PipelineResult<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> PipelineResult<HashMap<String, serde_json::Value>> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn set_many(
        &self,
        values: HashMap<String, serde_json::Value>,
        ttl: Option<Duration>,
    ) -> PipelineResult<()> {
        let ttl = self.effective_ttl(ttl);
        let mut entries = self.entries.lock();
        for (key, value) in values {
            let entry = CacheEntry::new(value, ttl);
            self.insert(&mut entries, &key, entry);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> PipelineResult<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        Ok(purged)
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    async fn health_check(&self) -> bool {
        true
    }
}
