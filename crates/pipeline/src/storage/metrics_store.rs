//! Metrics Store
//!
//! Persists post-aggregation summary rows and health-score snapshots, and
//! serves per-source summaries with an in-process TTL memo so hot dashboards
//! do not hammer the database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::MetricsStoreConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::open_connection;
use crate::types::{AggregationResult, HealthScore};

const RECENT_HEALTH_SCORES: u32 = 10;

/// Per-metric totals inside a summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricAggregate {
    /// Aggregated sample count
    pub count: u64,
    /// Mean of the stored batch averages
    pub avg: f64,
    /// Minimum across batches
    pub min: f64,
    /// Maximum across batches
    pub max: f64,
}

/// Summary of a source over a trailing window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Source the summary covers
    pub source: String,

    /// Trailing window in hours
    pub hours: u32,

    /// Per-metric aggregates
    pub metrics: HashMap<String, MetricAggregate>,

    /// Most recent health scores for the source
    pub health_scores: Vec<HealthScore>,

    /// Total aggregated sample count across all metrics
    pub total_count: u64,

    /// When the summary was computed
    pub generated_at: DateTime<Utc>,
}

/// Calendar-day trend classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReport {
    /// Source examined
    pub source: String,

    /// Metric examined
    pub metric_name: String,

    /// Trailing window in days
    pub days: u32,

    /// `increasing`, `decreasing`, `stable` or `insufficient_data`
    pub direction: String,

    /// Average of the first day with data
    pub first_day_avg: f64,

    /// Average of the last day with data
    pub last_day_avg: f64,

    /// Relative change between first and last day, percent
    pub change_pct: f64,

    /// Per-day averages keyed `YYYY-MM-DD`
    pub daily_averages: BTreeMap<String, f64>,
}

/// Store for aggregated metrics and health scores
#[derive(Debug)]
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
    config: MetricsStoreConfig,
    summary_cache: DashMap<(String, u32), (Instant, MetricsSummary)>,
}

impl MetricsStore {
    /// Open the store and initialize its schema
    pub fn new(config: MetricsStoreConfig) -> PipelineResult<Self> {
        let conn = open_connection(config.database_path.as_deref())?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS aggregated_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                time_period TEXT NOT NULL,
                aggregation_type TEXT NOT NULL,
                count INTEGER NOT NULL,
                sum REAL NOT NULL,
                min REAL NOT NULL,
                max REAL NOT NULL,
                avg REAL NOT NULL,
                first_ts INTEGER NOT NULL,
                last_ts INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| PipelineError::storage("init", e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agg_source_metric
             ON aggregated_metrics (source, metric_name, last_ts)",
            [],
        )
        .map_err(|e| PipelineError::storage("init", e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS health_scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                component TEXT NOT NULL,
                score REAL NOT NULL,
                grade TEXT NOT NULL,
                metrics_json TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| PipelineError::storage("init", e.to_string()))?;

        debug!(
            "Metrics store ready at {:?}",
            config.database_path.as_deref()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            summary_cache: DashMap::new(),
        })
    }

    /// Persist one batch worth of aggregation results
    pub async fn store_aggregation_results(
        &self,
        results: &HashMap<String, AggregationResult>,
    ) -> PipelineResult<usize> {
        if results.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| PipelineError::storage("store_aggregation", e.to_string()))?;
        for result in results.values() {
            let ts = result.timestamp.timestamp_millis();
            tx.execute(
                "INSERT INTO aggregated_metrics
                 (source, metric_name, time_period, aggregation_type,
                  count, sum, min, max, avg, first_ts, last_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    result.source,
                    result.metric_name,
                    "batch",
                    "summary",
                    result.count as i64,
                    result.sum,
                    result.min,
                    result.max,
                    result.avg,
                    ts,
                    ts,
                ],
            )
            .map_err(|e| PipelineError::storage("store_aggregation", e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| PipelineError::storage("store_aggregation", e.to_string()))?;

        Ok(results.len())
    }

    /// Persist a health-score snapshot
    pub async fn store_health_score(&self, score: &HealthScore) -> PipelineResult<()> {
        let metrics_json = serde_json::to_string(&score.metrics)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO health_scores
             (source, component, score, grade, metrics_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                score.source,
                score.component,
                score.score,
                score.grade,
                metrics_json,
                score.timestamp.timestamp_millis(),
            ],
        )
        .map_err(|e| PipelineError::storage("store_health_score", e.to_string()))?;

        Ok(())
    }

    /// Per-source summary over a trailing window, memoized in-process
    pub async fn get_summary(&self, source: &str, hours: u32) -> PipelineResult<MetricsSummary> {
        let key = (source.to_string(), hours);
        if let Some(entry) = self.summary_cache.get(&key) {
            let (cached_at, summary) = entry.value();
            if cached_at.elapsed() < self.config.summary_cache_ttl {
                debug!("Summary cache HIT for {}:{}h", source, hours);
                return Ok(summary.clone());
            }
        }

        let summary = self.compute_summary(source, hours).await?;
        self.summary_cache
            .insert(key, (Instant::now(), summary.clone()));
        Ok(summary)
    }

    async fn compute_summary(&self, source: &str, hours: u32) -> PipelineResult<MetricsSummary> {
        let cutoff =
            (Utc::now() - chrono::Duration::hours(i64::from(hours))).timestamp_millis();
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare(
                "SELECT metric_name, SUM(count), AVG(avg), MIN(min), MAX(max)
                 FROM aggregated_metrics
                 WHERE source = ?1 AND last_ts >= ?2
                 GROUP BY metric_name",
            )
            .map_err(|e| PipelineError::storage("get_summary", e.to_string()))?;
        let rows = stmt
            .query_map(params![source, cutoff], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    MetricAggregate {
                        count: row.get::<_, i64>(1)?.max(0) as u64,
                        avg: row.get(2)?,
                        min: row.get(3)?,
                        max: row.get(4)?,
                    },
                ))
            })
            .map_err(|e| PipelineError::storage("get_summary", e.to_string()))?;

        let mut metrics = HashMap::new();
        let mut total_count = 0_u64;
        for row in rows {
            let (name, aggregate) =
                row.map_err(|e| PipelineError::storage("get_summary", e.to_string()))?;
            total_count += aggregate.count;
            metrics.insert(name, aggregate);
        }

        let mut stmt = conn
            .prepare(
                "SELECT source, component, score, grade, metrics_json, timestamp
                 FROM health_scores
                 WHERE source = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC LIMIT ?3",
            )
            .map_err(|e| PipelineError::storage("get_summary", e.to_string()))?;
        let rows = stmt
            .query_map(params![source, cutoff, RECENT_HEALTH_SCORES], |row| {
                let metrics_json: String = row.get(4)?;
                let timestamp_ms: i64 = row.get(5)?;
                Ok(HealthScore {
                    source: row.get(0)?,
                    component: row.get(1)?,
                    score: row.get(2)?,
                    grade: row.get(3)?,
                    metrics: serde_json::from_str(&metrics_json)
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: DateTime::from_timestamp_millis(timestamp_ms)
                        .unwrap_or_else(Utc::now),
                })
            })
            .map_err(|e| PipelineError::storage("get_summary", e.to_string()))?;

        let mut health_scores = Vec::new();
        for row in rows {
            health_scores
                .push(row.map_err(|e| PipelineError::storage("get_summary", e.to_string()))?);
        }

        Ok(MetricsSummary {
            source: source.to_string(),
            hours,
            metrics,
            health_scores,
            total_count,
            generated_at: Utc::now(),
        })
    }

    /// Calendar-day trend over the trailing `days`
    ///
    /// Compares the first and last day averages; a relative change beyond
    /// 10% classifies the direction, otherwise the metric is stable.
    pub async fn get_trend_analysis(
        &self,
        source: &str,
        metric_name: &str,
        days: u32,
    ) -> PipelineResult<TrendReport> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days))).timestamp_millis();
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare(
                "SELECT last_ts, avg FROM aggregated_metrics
                 WHERE source = ?1 AND metric_name = ?2 AND last_ts >= ?3
                 ORDER BY last_ts",
            )
            .map_err(|e| PipelineError::storage("get_trend_analysis", e.to_string()))?;
        let rows = stmt
            .query_map(params![source, metric_name, cutoff], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| PipelineError::storage("get_trend_analysis", e.to_string()))?;

        let mut per_day: BTreeMap<String, (f64, u64)> = BTreeMap::new();
        for row in rows {
            let (ts_ms, avg) =
                row.map_err(|e| PipelineError::storage("get_trend_analysis", e.to_string()))?;
            let day = DateTime::from_timestamp_millis(ts_ms)
                .unwrap_or_else(Utc::now)
                .date_naive();
            let key = format!("{:04}-{:02}-{:02}", day.year(), day.month(), day.day());
            let entry = per_day.entry(key).or_insert((0.0, 0));
            entry.0 += avg;
            entry.1 += 1;
        }

        let daily_averages: BTreeMap<String, f64> = per_day
            .into_iter()
            .map(|(day, (sum, n))| (day, sum / n as f64))
            .collect();

        let (direction, first_day_avg, last_day_avg, change_pct) = if daily_averages.len() < 2 {
            ("insufficient_data".to_string(), 0.0, 0.0, 0.0)
        } else {
            let first = daily_averages.values().next().copied().unwrap_or(0.0);
            let last = daily_averages.values().next_back().copied().unwrap_or(0.0);
            let change = if first.abs() < f64::EPSILON {
                0.0_f64
            } else {
                (last - first) / first.abs() * 100.0_f64
            };
            let direction = if change > 10.0_f64 {
                "increasing"
            } else if change < -10.0_f64 {
                "decreasing"
            } else {
                "stable"
            };
            (direction.to_string(), first, last, change)
        };

        Ok(TrendReport {
            source: source.to_string(),
            metric_name: metric_name.to_string(),
            days,
            direction,
            first_day_avg,
            last_day_avg,
            change_pct,
            daily_averages,
        })
    }

    /// Checkpoint the write-ahead log to the main database file
    pub async fn flush(&self) -> PipelineResult<()> {
        let conn = self.conn.lock().await;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|e| PipelineError::storage("flush", e.to_string()))?;
        Ok(())
    }

    /// True when a trivial count query succeeds
    pub async fn health_check(&self) -> bool {
        let conn = self.conn.lock().await;
        match conn.query_row("SELECT COUNT(*) FROM aggregated_metrics", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(_) => true,
            Err(e) => {
                warn!("Metrics store health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrendLabel;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn memory_store() -> PipelineResult<MetricsStore> {
        MetricsStore::new(MetricsStoreConfig {
            database_path: None,
            ..MetricsStoreConfig::default()
        })
    }

    fn result(source: &str, metric: &str, avg: f64, timestamp: DateTime<Utc>) -> AggregationResult {
        AggregationResult {
            metric_name: metric.to_string(),
            source: source.to_string(),
            count: 10,
            sum: avg * 10.0,
            min: avg - 1.0,
            max: avg + 1.0,
            avg,
            median: avg,
            std_dev: 0.5,
            percentiles: BTreeMap::new(),
            trend: TrendLabel::Stable,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_store_and_summarize() -> TestResult {
        let store = memory_store()?;
        let mut results = HashMap::new();
        results.insert(
            "system:cpu".to_string(),
            result("system", "cpu", 42.0, Utc::now()),
        );
        results.insert(
            "system:memory".to_string(),
            result("system", "memory", 80.0, Utc::now()),
        );
        assert_eq!(store.store_aggregation_results(&results).await?, 2);

        let summary = store.get_summary("system", 24).await?;
        assert_eq!(summary.metrics.len(), 2);
        assert_eq!(summary.total_count, 20);
        let cpu = &summary.metrics["cpu"];
        assert!((cpu.avg - 42.0).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_summary_cache_serves_stale_window() -> TestResult {
        let store = memory_store()?;
        let mut results = HashMap::new();
        results.insert(
            "system:cpu".to_string(),
            result("system", "cpu", 10.0, Utc::now()),
        );
        store.store_aggregation_results(&results).await?;

        let first = store.get_summary("system", 24).await?;
        // A second write lands, but the memoized summary is still served
        store.store_aggregation_results(&results).await?;
        let second = store.get_summary("system", 24).await?;
        assert_eq!(first.total_count, second.total_count);
        Ok(())
    }

    #[tokio::test]
    async fn test_health_scores_in_summary() -> TestResult {
        let store = memory_store()?;
        store
            .store_health_score(&HealthScore {
                source: "system".to_string(),
                component: "scheduler".to_string(),
                score: 97.5,
                grade: "A".to_string(),
                metrics: serde_json::json!({"jobs_completed": 12}),
                timestamp: Utc::now(),
            })
            .await?;

        let summary = store.get_summary("system", 24).await?;
        assert_eq!(summary.health_scores.len(), 1);
        assert_eq!(summary.health_scores[0].grade, "A");
        Ok(())
    }

    #[tokio::test]
    async fn test_trend_analysis_detects_increase() -> TestResult {
        let store = memory_store()?;
        let now = Utc::now();
        let mut results = HashMap::new();
        results.insert(
            "d0".to_string(),
            result("system", "cpu", 10.0, now - chrono::Duration::days(2)),
        );
        store.store_aggregation_results(&results).await?;
        results.clear();
        results.insert("d1".to_string(), result("system", "cpu", 20.0, now));
        store.store_aggregation_results(&results).await?;

        let report = store.get_trend_analysis("system", "cpu", 7).await?;
        assert_eq!(report.direction, "increasing");
        assert!((report.change_pct - 100.0).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_trend_analysis_insufficient_data() -> TestResult {
        let store = memory_store()?;
        let report = store.get_trend_analysis("system", "cpu", 7).await?;
        assert_eq!(report.direction, "insufficient_data");
        Ok(())
    }
}
