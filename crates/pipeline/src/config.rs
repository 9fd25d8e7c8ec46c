//! `FlowMetrics` Pipeline Configuration
//!
//! Configuration knobs consumed by the pipeline core. File loading and
//! validation live with the embedding application; this module only defines
//! the structures and their defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Scheduler / worker-pool configuration
    pub scheduler: SchedulerConfig,

    /// Time-series store configuration
    pub timeseries: TimeSeriesConfig,

    /// Metrics store configuration
    pub metrics_store: MetricsStoreConfig,

    /// Cache store configuration
    pub cache: CacheConfig,
}

/// Scheduler / worker-pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker loops
    pub num_workers: usize,

    /// Soft queue bound; exceeding it only produces a warning log
    pub max_queue_size: usize,

    /// Maximum points per ingested batch
    pub batch_size: usize,

    /// Idle worker poll interval
    pub processing_interval: Duration,

    /// Queue-size monitor cadence
    pub queue_monitor_interval: Duration,

    /// Statistics publisher cadence
    pub stats_interval: Duration,

    /// Retention cleanup cadence
    pub cleanup_interval: Duration,

    /// Days of raw point data to retain
    pub retention_days: i64,

    /// Completed jobs retained in the output queue
    pub output_queue_limit: usize,

    /// Processor names applied to every metrics job, in order
    pub default_processors: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            max_queue_size: 1000,
            batch_size: 500,
            processing_interval: Duration::from_millis(50),
            queue_monitor_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3_600),
            retention_days: 30,
            output_queue_limit: 100,
            default_processors: vec![
                "transformer".to_string(),
                "aggregator".to_string(),
                "analyzer".to_string(),
            ],
        }
    }
}

/// Time-series store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    /// Database file path (None for in-memory)
    pub database_path: Option<PathBuf>,

    /// Row cap applied to range queries
    pub query_row_limit: u32,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            database_path: Some(PathBuf::from("./data/flowmetrics_points.db")),
            query_row_limit: 1000,
        }
    }
}

/// Metrics store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsStoreConfig {
    /// Database file path (None for in-memory)
    pub database_path: Option<PathBuf>,

    /// TTL of the in-process summary memo keyed by (source, hours)
    pub summary_cache_ttl: Duration,
}

impl Default for MetricsStoreConfig {
    fn default() -> Self {
        Self {
            database_path: Some(PathBuf::from("./data/flowmetrics_metrics.db")),
            summary_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Backend selection for the cache store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackend {
    /// In-process map with LRU eviction
    Memory,
    /// Embedded SQLite-backed cache table
    EmbeddedSql,
    /// External Redis cache (falls back to memory if unreachable)
    ExternalCache,
}

/// Cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Selected backend
    pub backend: CacheBackend,

    /// Maximum in-process entries before eviction kicks in
    pub max_entries: usize,

    /// Default TTL applied when `set` is called without one
    pub default_ttl: Duration,

    /// Expired-entry purge cadence for in-process backends
    pub cleanup_interval: Duration,

    /// Database file path for the embedded-sql backend (None for in-memory)
    pub database_path: Option<PathBuf>,

    /// Redis connection URL for the external backend
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            max_entries: 10_000,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            database_path: None,
            redis_url: Some("redis://localhost:6379".to_string()),
        }
    }
}

impl PipelineConfig {
    /// Fully in-memory configuration used by tests and embedded callers
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            timeseries: TimeSeriesConfig {
                database_path: None,
                ..TimeSeriesConfig::default()
            },
            metrics_store: MetricsStoreConfig {
                database_path: None,
                ..MetricsStoreConfig::default()
            },
            cache: CacheConfig {
                backend: CacheBackend::Memory,
                ..CacheConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_knobs() {
        let config = SchedulerConfig::default();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.queue_monitor_interval, Duration::from_secs(30));
        assert_eq!(
            config.default_processors,
            vec!["transformer", "aggregator", "analyzer"]
        );
    }

    #[test]
    fn test_in_memory_config_has_no_paths() {
        let config = PipelineConfig::in_memory();
        assert!(config.timeseries.database_path.is_none());
        assert!(config.metrics_store.database_path.is_none());
        assert_eq!(config.cache.backend, CacheBackend::Memory);
    }
}
