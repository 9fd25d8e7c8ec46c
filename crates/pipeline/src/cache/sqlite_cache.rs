//! Embedded SQL cache backend
//!
//! Same TTL contract as the in-process map, persisted to a SQLite file.
//! Expiry is enforced by filtering on `expires_at > now` in every read;
//! `purge_expired` reclaims the dead rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::{CacheStats, CacheStatsSnapshot, CacheStore};
use crate::config::CacheConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::open_connection;

/// SQLite-backed TTL cache
#[derive(Debug)]
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
    config: CacheConfig,
    stats: CacheStats,
}

impl SqliteCache {
    /// Open the cache database and initialize its schema
    pub fn new(config: CacheConfig) -> PipelineResult<Self> {
        let conn = open_connection(config.database_path.as_deref())?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| PipelineError::cache("init", e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            stats: CacheStats::default(),
        })
    }

    fn effective_ttl_ms(&self, ttl: Option<Duration>) -> i64 {
        ttl.unwrap_or(self.config.default_ttl).as_millis() as i64
    }
}

fn upsert(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
    ttl_ms: i64,
) -> PipelineResult<()> {
    let now = Utc::now().timestamp_millis();
    let value_json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT OR REPLACE INTO cache
         (key, value_json, created_at, expires_at, access_count, last_accessed)
         VALUES (?1, ?2, ?3, ?4, 0, ?3)",
        params![key, value_json, now, now + ttl_ms],
    )
    .map_err(|e| PipelineError::cache("set", e.to_string()))?;
    Ok(())
}

#[async_trait]
impl CacheStore for SqliteCache {
    fn backend_name(&self) -> &'static str {
        "embedded-sql"
    }

    async fn get(&self, key: &str) -> PipelineResult<Option<serde_json::Value>> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;

        let value_json: Option<String> = conn
            .query_row(
                "SELECT value_json FROM cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| PipelineError::cache("get", e.to_string()))?;

        match value_json {
            Some(value_json) => {
                conn.execute(
                    "UPDATE cache SET access_count = access_count + 1, last_accessed = ?2
                     WHERE key = ?1",
                    params![key, now],
                )
                .map_err(|e| PipelineError::cache("get", e.to_string()))?;
                self.stats.record_hit();
                trace!("Cache HIT for key: {}", key);
                Ok(Some(serde_json::from_str(&value_json)?))
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
        let ttl_ms = self.effective_ttl_ms(ttl);
        let conn = self.conn.lock().await;
        upsert(&conn, key, &value, ttl_ms)?;
        self.stats.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> PipelineResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM cache WHERE key = ?1", params![key])
            .map_err(|e| PipelineError::cache("delete", e.to_string()))?;
        if removed > 0 {
            self.stats.record_delete();
        }
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> PipelineResult<bool> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::cache("exists", e.to_string()))?;
        Ok(count > 0)
    }

    async fn clear(&self) -> PipelineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM cache", [])
            .map_err(|e| PipelineError::cache("clear", e.to_string()))?;
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
        let ttl_ms = self.effective_ttl_ms(ttl);
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| PipelineError::cache("set_many", e.to_string()))?;
        for (key, value) in &values {
            upsert(&tx, key, value, ttl_ms)?;
            self.stats.record_set();
        }
        tx.commit()
            .map_err(|e| PipelineError::cache("set_many", e.to_string()))?;
        Ok(())
    }

    async fn purge_expired(&self) -> PipelineResult<usize> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        let purged = conn
            .execute("DELETE FROM cache WHERE expires_at <= ?1", params![now])
            .map_err(|e| PipelineError::cache("purge_expired", e.to_string()))?;
        if purged > 0 {
            debug!("Purged {} expired cache rows", purged);
        }
        Ok(purged)
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.lock().await;
        match conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => true,
            Err(e) => {
                warn!("Cache health check failed: {}", e);
                false
            }
        }
    }
}
