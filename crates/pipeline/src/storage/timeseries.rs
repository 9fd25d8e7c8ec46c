//! Time-Series Store
//!
//! Append-only point storage on embedded SQLite. Points are keyed by their
//! identity, indexed on `(source, timestamp)`, and queried most-recent-first
//! with a configurable row cap. Values persist as tagged JSON text so every
//! `MetricValue` variant round-trips losslessly; a derived numeric column
//! backs server-side bucketed aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::TimeSeriesConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::open_connection;
use crate::types::{AggregateFunction, DataPoint, DataPointFilter, MetricValue};

/// Durable append-only store for data points
#[derive(Debug)]
pub struct TimeSeriesStore {
    conn: Arc<Mutex<Connection>>,
    config: TimeSeriesConfig,
}

impl TimeSeriesStore {
    /// Open the store and initialize its schema
    pub fn new(config: TimeSeriesConfig) -> PipelineResult<Self> {
        let conn = open_connection(config.database_path.as_deref())?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS data_points (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                source TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                value TEXT NOT NULL,
                numeric_value REAL,
                tags_json TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                quality_score REAL NOT NULL
            )",
            [],
        )
        .map_err(|e| PipelineError::storage("init", e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_points_source_ts
             ON data_points (source, timestamp)",
            [],
        )
        .map_err(|e| PipelineError::storage("init", e.to_string()))?;

        debug!(
            "Time-series store ready at {:?}",
            config.database_path.as_deref()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Store a single point
    pub async fn store(&self, point: &DataPoint) -> PipelineResult<()> {
        let conn = self.conn.lock().await;
        insert_point(&conn, point)?;
        Ok(())
    }

    /// Store many points in one transaction, returning the count written
    pub async fn store_many(&self, points: &[DataPoint]) -> PipelineResult<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| PipelineError::storage("store_many", e.to_string()))?;
        for point in points {
            insert_point(&tx, point)?;
        }
        tx.commit()
            .map_err(|e| PipelineError::storage("store_many", e.to_string()))?;

        Ok(points.len())
    }

    /// Fetch points for a source, most-recent-first, capped at the
    /// configured row limit
    pub async fn get_points(
        &self,
        source: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> PipelineResult<Vec<DataPoint>> {
        let filter = DataPointFilter {
            source: Some(source.to_string()),
            start_time: start,
            end_time: end,
            ..DataPointFilter::default()
        };
        self.query(&filter).await
    }

    /// Query points by an arbitrary filter combination
    ///
    /// Source, metric and time range are pushed into SQL; value-range and
    /// tag-equality predicates are applied on the decoded rows.
    pub async fn query(&self, filter: &DataPointFilter) -> PipelineResult<Vec<DataPoint>> {
        let mut sql = String::from(
            "SELECT id, timestamp, source, metric_name, value,
                    tags_json, metadata_json, quality_score
             FROM data_points WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(source) = &filter.source {
            sql.push_str(" AND source = ?");
            args.push(Box::new(source.clone()));
        }
        if let Some(metric) = &filter.metric_name {
            sql.push_str(" AND metric_name = ?");
            args.push(Box::new(metric.clone()));
        }
        if let Some(start) = filter.start_time {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(start.timestamp_millis()));
        }
        if let Some(end) = filter.end_time {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(end.timestamp_millis()));
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        let limit = i64::from(filter.limit.unwrap_or(self.config.query_row_limit));
        args.push(Box::new(limit));

        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::storage("query", e.to_string()))?;
        let params = rusqlite::params_from_iter(args.iter().map(AsRef::as_ref));
        let rows = stmt
            .query_map(params, row_to_point)
            .map_err(|e| PipelineError::storage("query", e.to_string()))?;

        let mut points = Vec::new();
        for row in rows {
            let point = row.map_err(|e| PipelineError::storage("query", e.to_string()))?;
            if matches_residual(&point, filter) {
                points.push(point);
            }
        }

        Ok(points)
    }

    /// Bucketed server-side aggregation over numeric values
    ///
    /// Returns `bucket_start_unix_seconds -> aggregate` for fixed windows of
    /// `interval_seconds`.
    pub async fn get_aggregated(
        &self,
        source: &str,
        metric_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        function: AggregateFunction,
        interval_seconds: i64,
    ) -> PipelineResult<BTreeMap<i64, f64>> {
        if interval_seconds <= 0 {
            return Err(PipelineError::storage(
                "get_aggregated",
                "interval must be positive",
            ));
        }

        let agg = match function {
            AggregateFunction::Avg => "AVG(numeric_value)",
            AggregateFunction::Sum => "SUM(numeric_value)",
            AggregateFunction::Min => "MIN(numeric_value)",
            AggregateFunction::Max => "MAX(numeric_value)",
            AggregateFunction::Count => "COUNT(*)",
        };
        let sql = format!(
            "SELECT (timestamp / 1000 / ?1) * ?1 AS bucket, {agg}
             FROM data_points
             WHERE source = ?2 AND metric_name = ?3
               AND timestamp >= ?4 AND timestamp <= ?5
               AND numeric_value IS NOT NULL
             GROUP BY bucket ORDER BY bucket"
        );

        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::storage("get_aggregated", e.to_string()))?;
        let rows = stmt
            .query_map(
                params![
                    interval_seconds,
                    source,
                    metric_name,
                    start.timestamp_millis(),
                    end.timestamp_millis()
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .map_err(|e| PipelineError::storage("get_aggregated", e.to_string()))?;

        let mut buckets = BTreeMap::new();
        for row in rows {
            let (bucket, value) =
                row.map_err(|e| PipelineError::storage("get_aggregated", e.to_string()))?;
            buckets.insert(bucket, value);
        }

        Ok(buckets)
    }

    /// Delete points older than `cutoff`, returning the number removed
    pub async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> PipelineResult<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM data_points WHERE timestamp < ?1",
                params![cutoff.timestamp_millis()],
            )
            .map_err(|e| PipelineError::storage("cleanup_expired", e.to_string()))?;

        if deleted > 0 {
            debug!("Retention cleanup removed {} expired points", deleted);
        }

        Ok(deleted)
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
        match conn.query_row("SELECT COUNT(*) FROM data_points", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(_) => true,
            Err(e) => {
                warn!("Time-series store health check failed: {}", e);
                false
            }
        }
    }
}

fn insert_point(conn: &Connection, point: &DataPoint) -> PipelineResult<()> {
    let value_json = serde_json::to_string(&point.value)?;
    let tags_json = serde_json::to_string(&point.tags)?;
    let metadata_json = serde_json::to_string(&point.metadata)?;

    conn.execute(
        "INSERT OR REPLACE INTO data_points
         (id, timestamp, source, metric_name, value, numeric_value,
          tags_json, metadata_json, quality_score)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            point.id.to_string(),
            point.timestamp.timestamp_millis(),
            point.source,
            point.metric_name,
            value_json,
            point.value.as_f64(),
            tags_json,
            metadata_json,
            point.quality_score,
        ],
    )
    .map_err(|e| PipelineError::storage("store", e.to_string()))?;

    Ok(())
}

fn row_to_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataPoint> {
    let id: String = row.get(0)?;
    let timestamp_ms: i64 = row.get(1)?;
    let source: String = row.get(2)?;
    let metric_name: String = row.get(3)?;
    let value_json: String = row.get(4)?;
    let tags_json: String = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    let quality_score: f64 = row.get(7)?;

    let value: MetricValue = serde_json::from_str(&value_json).unwrap_or_else(|_| {
        // Legacy rows may predate the tagged encoding
        MetricValue::Text(value_json.clone())
    });

    Ok(DataPoint {
        id: uuid::Uuid::parse_str(&id).unwrap_or_else(|_| uuid::Uuid::new_v4()),
        timestamp: DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now),
        source,
        metric_name,
        value,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        quality_score,
    })
}

/// Predicates not pushed into SQL: value range and tag equality
fn matches_residual(point: &DataPoint, filter: &DataPointFilter) -> bool {
    if filter.min_value.is_some() || filter.max_value.is_some() {
        let Some(numeric) = point.value.as_f64() else {
            return false;
        };
        if filter.min_value.is_some_and(|min| numeric < min) {
            return false;
        }
        if filter.max_value.is_some_and(|max| numeric > max) {
            return false;
        }
    }

    filter
        .tags
        .iter()
        .all(|(k, v)| point.tags.get(k) == Some(v))
}
