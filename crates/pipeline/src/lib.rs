//! `FlowMetrics` Pipeline
//!
//! Core metrics pipeline: ingestion, a worker-pool scheduler driving the
//! transformer/aggregator/analyzer stages, durable time-series and metrics
//! stores on embedded SQLite, and a TTL cache with swappable backends.
//!
//! The outer API surface (HTTP routes, webhooks, integration manager)
//! lives elsewhere and talks to this crate through [`MetricsPipeline`]:
//!
//! ```no_run
//! use flowmetrics_pipeline::{MetricsPipeline, PipelineConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = MetricsPipeline::new(PipelineConfig::in_memory()).await?;
//! pipeline.start()?;
//!
//! let mut metrics = std::collections::HashMap::new();
//! metrics.insert("cpu_usage".to_string(), serde_json::json!(42.5));
//! pipeline.store_system_metrics(metrics)?;
//!
//! pipeline.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod processors;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod types;

pub use config::{CacheBackend, CacheConfig, PipelineConfig, SchedulerConfig};
pub use error::{PipelineError, PipelineResult};
pub use types::{
    DataBatch, DataPoint, DataPointFilter, HealthStatus, MetricValue, PipelineStatus,
    ProcessingJob, StatusReport,
};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{build_cache, CacheStore};
use crate::scheduler::PipelineScheduler;
use crate::storage::{MetricsStore, MetricsSummary, TimeSeriesStore, TrendReport};
use crate::types::JobKind;

struct PipelineInner {
    config: PipelineConfig,
    scheduler: PipelineScheduler,
    timeseries: Arc<TimeSeriesStore>,
    metrics_store: Arc<MetricsStore>,
    cache: Arc<dyn CacheStore>,
    purge_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the metrics pipeline
///
/// Cheap to clone; every clone drives the same pipeline. Construct it once
/// and pass handles to the consumers that need it.
#[derive(Clone)]
pub struct MetricsPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for MetricsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsPipeline")
            .field("status", &self.inner.scheduler.status())
            .finish_non_exhaustive()
    }
}

impl MetricsPipeline {
    /// Build the pipeline and its stores; unsupported or unreachable
    /// backends surface here
    pub async fn new(config: PipelineConfig) -> PipelineResult<Self> {
        let timeseries = Arc::new(TimeSeriesStore::new(config.timeseries.clone())?);
        let metrics_store = Arc::new(MetricsStore::new(config.metrics_store.clone())?);
        let cache = build_cache(&config.cache).await?;

        let scheduler = PipelineScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&timeseries),
            Arc::clone(&metrics_store),
            Arc::clone(&cache),
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                scheduler,
                timeseries,
                metrics_store,
                cache,
                purge_task: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Start workers and background tasks; idempotent
    pub fn start(&self) -> PipelineResult<()> {
        if self.inner.scheduler.status() == PipelineStatus::Running {
            debug!("Pipeline already running, start() is a no-op");
            return Ok(());
        }

        self.inner.scheduler.start()?;

        let cache = Arc::clone(&self.inner.cache);
        let interval = self.inner.config.cache.cleanup_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = cache.purge_expired().await {
                    warn!("Cache purge failed: {}", e);
                }
            }
        });
        *self.inner.purge_task.lock() = Some(handle);

        info!("Metrics pipeline started");
        Ok(())
    }

    /// Drain in-flight jobs, checkpoint the stores and stop; a no-op when
    /// not running
    pub async fn stop(&self) {
        self.inner.scheduler.stop().await;
        if let Some(handle) = self.inner.purge_task.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.inner.timeseries.flush().await {
            warn!("Time-series checkpoint on stop failed: {}", e);
        }
        if let Err(e) = self.inner.metrics_store.flush().await {
            warn!("Metrics store checkpoint on stop failed: {}", e);
        }
        info!("Metrics pipeline stopped");
    }

    /// Pause processing without releasing workers; queued work waits
    pub fn pause(&self) -> PipelineResult<()> {
        self.inner.scheduler.pause()
    }

    /// Resume processing after a pause
    pub fn resume(&self) -> PipelineResult<()> {
        self.inner.scheduler.resume()
    }

    /// Accept points for processing; non-blocking, rejected when the
    /// pipeline is not running
    ///
    /// Point sets larger than the configured batch size are split into
    /// several batches; the returned id names the first of them.
    pub fn ingest(&self, points: Vec<DataPoint>, source: &str) -> PipelineResult<Uuid> {
        let batch_size = self.inner.config.scheduler.batch_size.max(1);
        if points.len() <= batch_size {
            let batch = DataBatch::new(source, points);
            return self.inner.scheduler.enqueue_batch(JobKind::Metrics, batch);
        }

        let mut first_id = None;
        let mut points = points;
        while !points.is_empty() {
            let rest = points.split_off(points.len().min(batch_size));
            let batch = DataBatch::new(source, points);
            let id = self.inner.scheduler.enqueue_batch(JobKind::Metrics, batch)?;
            first_id.get_or_insert(id);
            points = rest;
        }
        first_id.ok_or_else(|| PipelineError::ingestion("empty point set"))
    }

    /// Ingest a single point as a one-point batch
    pub fn ingest_one(&self, point: DataPoint) -> PipelineResult<Uuid> {
        let source = point.source.clone();
        self.ingest(vec![point], &source)
    }

    /// Convert a flat metric map into points and ingest them under the
    /// component's name
    pub fn store_component_metrics(
        &self,
        component: &str,
        metrics: HashMap<String, serde_json::Value>,
    ) -> PipelineResult<Uuid> {
        let points: Vec<DataPoint> = metrics
            .into_iter()
            .map(|(name, value)| DataPoint::new(component, name, metric_value_from_json(value)))
            .collect();
        self.ingest(points, component)
    }

    /// Ingest process-wide metrics under the `system` source
    pub fn store_system_metrics(
        &self,
        metrics: HashMap<String, serde_json::Value>,
    ) -> PipelineResult<Uuid> {
        self.store_component_metrics("system", metrics)
    }

    /// Ingest a report blob under the `reports` source
    ///
    /// Numeric top-level fields become individual points; the full report
    /// rides along in the metadata of a marker point so non-numeric content
    /// survives too.
    pub fn store_report(
        &self,
        report_type: &str,
        report_data: serde_json::Value,
    ) -> PipelineResult<Uuid> {
        let mut points = Vec::new();
        if let Some(fields) = report_data.as_object() {
            for (key, value) in fields {
                if let Some(n) = value.as_f64() {
                    points.push(DataPoint::new(
                        "reports",
                        format!("{report_type}_{key}"),
                        MetricValue::Number(n),
                    ));
                }
            }
        }
        points.push(
            DataPoint::new("reports", report_type, MetricValue::Number(1.0))
                .with_metadata("report", report_data),
        );

        let batch = DataBatch::new("reports", points);
        self.inner.scheduler.enqueue_batch(JobKind::Report, batch)
    }

    /// Query stored points by an arbitrary filter
    pub async fn query_data(&self, filter: &DataPointFilter) -> PipelineResult<Vec<DataPoint>> {
        self.inner.timeseries.query(filter).await
    }

    /// Memoized per-source metrics summary
    pub async fn get_metrics_summary(
        &self,
        source: &str,
        hours: u32,
    ) -> PipelineResult<MetricsSummary> {
        self.inner.metrics_store.get_summary(source, hours).await
    }

    /// Calendar-day trend for one metric
    pub async fn get_trend_analysis(
        &self,
        source: &str,
        metric_name: &str,
        days: u32,
    ) -> PipelineResult<TrendReport> {
        self.inner
            .metrics_store
            .get_trend_analysis(source, metric_name, days)
            .await
    }

    /// Composite health: per-store checks, queue depths and error rate
    pub async fn get_health_status(&self) -> HealthStatus {
        let timeseries_ok = self.inner.timeseries.health_check().await;
        let metrics_ok = self.inner.metrics_store.health_check().await;
        let cache_ok = self.inner.cache.health_check().await;

        let mut stores = HashMap::new();
        stores.insert("timeseries".to_string(), timeseries_ok);
        stores.insert("metrics".to_string(), metrics_ok);
        stores.insert(self.inner.cache.backend_name().to_string(), cache_ok);

        let stats = self.inner.scheduler.stats_snapshot();
        let finished = stats.jobs_completed + stats.jobs_failed;
        let error_rate = if finished == 0 {
            0.0
        } else {
            stats.jobs_failed as f64 / finished as f64
        };
        let uptime = self.inner.scheduler.uptime_seconds();
        let processing_rate = if uptime == 0 {
            0.0
        } else {
            stats.jobs_completed as f64 / uptime as f64
        };

        let healthy_stores = stores.values().filter(|ok| **ok).count();
        let store_score = healthy_stores as f64 / stores.len() as f64 * 70.0;
        let error_score = (1.0 - error_rate) * 30.0;
        let health_score = store_score + error_score;

        HealthStatus {
            healthy: healthy_stores == stores.len() && error_rate < 0.5,
            health_score,
            stores,
            cache: self.inner.cache.stats(),
            queue_sizes: self.inner.scheduler.queue_sizes(),
            processing_rate,
            error_rate,
        }
    }

    /// Status, uptime, counters and queue depths
    pub fn get_status(&self) -> StatusReport {
        StatusReport {
            status: self.inner.scheduler.status(),
            running: self.inner.scheduler.status() == PipelineStatus::Running,
            uptime_seconds: self.inner.scheduler.uptime_seconds(),
            stats: self.inner.scheduler.stats_snapshot(),
            queue_sizes: self.inner.scheduler.queue_sizes(),
        }
    }

    /// Terminal state of a finished job, while it is still retained
    #[must_use]
    pub fn finished_job(&self, job_id: Uuid) -> Option<ProcessingJob> {
        self.inner.scheduler.finished_job(job_id)
    }

    /// The time-series point store
    #[must_use]
    pub fn timeseries(&self) -> &TimeSeriesStore {
        &self.inner.timeseries
    }

    /// The aggregated-metrics store
    #[must_use]
    pub fn metrics_store(&self) -> &MetricsStore {
        &self.inner.metrics_store
    }

    /// The configured cache backend
    #[must_use]
    pub fn cache(&self) -> &dyn CacheStore {
        self.inner.cache.as_ref()
    }
}

/// Map a loose JSON value onto the typed metric value
fn metric_value_from_json(value: serde_json::Value) -> MetricValue {
    match value {
        serde_json::Value::Number(n) => MetricValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::Bool(b) => MetricValue::Flag(b),
        serde_json::Value::String(s) => MetricValue::Text(s),
        other => MetricValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_from_json() {
        assert_eq!(
            metric_value_from_json(serde_json::json!(1.5)),
            MetricValue::Number(1.5)
        );
        assert_eq!(
            metric_value_from_json(serde_json::json!(true)),
            MetricValue::Flag(true)
        );
        assert_eq!(
            metric_value_from_json(serde_json::json!("ok")),
            MetricValue::Text("ok".to_string())
        );
        assert_eq!(
            metric_value_from_json(serde_json::json!([1, 2])),
            MetricValue::Text("[1,2]".to_string())
        );
    }
}
