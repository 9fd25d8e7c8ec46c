//! `FlowMetrics` Pipeline Types
//!
//! Core data types shared by the scheduler, the processing stages and the
//! storage layer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value carried by a data point
///
/// Modeled as a proper sum type; conversions to `f64` happen explicitly at the
/// aggregation boundary via [`MetricValue::as_f64`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    /// Numeric sample
    Number(f64),
    /// Textual sample (status strings, labels)
    Text(String),
    /// Boolean sample (up/down flags)
    Flag(bool),
}

impl MetricValue {
    /// Numeric view of the value
    ///
    /// Numbers pass through, flags map to 1.0/0.0, text is parsed when it
    /// holds a number and is otherwise non-numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Flag(b) => Some(if *b { 1.0_f64 } else { 0.0_f64 }),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Whether the value participates in numeric aggregation
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A single metric sample produced by a health check, automation component,
/// webhook event or system monitor
///
/// Immutable once stored; only the transformer stage mutates points, and only
/// while the owning job holds the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unique point identifier
    pub id: Uuid,

    /// Sample timestamp
    pub timestamp: DateTime<Utc>,

    /// Producer name (e.g. "health_checker", "system")
    pub source: String,

    /// Metric name
    pub metric_name: String,

    /// Sample value
    pub value: MetricValue,

    /// Dimension tags
    pub tags: HashMap<String, String>,

    /// Free-form metadata
    pub metadata: HashMap<String, serde_json::Value>,

    /// Quality score in [0, 1]
    pub quality_score: f64,
}

impl DataPoint {
    /// Create a new data point with a fresh identity and the current time
    #[must_use]
    pub fn new(source: impl Into<String>, metric_name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            metric_name: metric_name.into(),
            value,
            tags: HashMap::new(),
            metadata: HashMap::new(),
            quality_score: 1.0_f64,
        }
    }

    /// Attach a tag (builder style)
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Attach a metadata entry (builder style)
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A group of data points ingested together and processed as one unit
///
/// Owned exclusively by its `ProcessingJob` until the job completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBatch {
    /// Unique batch identifier
    pub id: Uuid,

    /// Producer that ingested the batch
    pub source: String,

    /// Batch creation timestamp
    pub created_at: DateTime<Utc>,

    /// Ordered points in the batch
    pub points: Vec<DataPoint>,

    /// Whether processing finished
    pub processed: bool,

    /// Error recorded by a failed job
    pub error: Option<String>,

    /// Wall-clock processing duration
    pub processing_duration: Option<Duration>,
}

impl DataBatch {
    /// Create a new batch from ingested points
    #[must_use]
    pub fn new(source: impl Into<String>, points: Vec<DataPoint>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            created_at: Utc::now(),
            points,
            processed: false,
            error: None,
            processing_duration: None,
        }
    }
}

/// Kind of work a processing job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Regular metric batch
    Metrics,
    /// Report ingestion
    Report,
}

/// Lifecycle state of a processing job
///
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Enqueued, not yet claimed by a worker
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// All processor steps succeeded
    Completed,
    /// A processor step failed
    Failed,
}

/// Unit of work binding a batch to the processor steps to apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    /// Unique job identifier
    pub id: Uuid,

    /// Job kind
    pub kind: JobKind,

    /// The batch this job owns
    pub batch: DataBatch,

    /// Ordered processor names to apply
    pub processors: Vec<String>,

    /// When a worker claimed the job
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Per-processor result blobs
    pub results: HashMap<String, serde_json::Value>,

    /// Error recorded on failure
    pub error: Option<String>,
}

impl ProcessingJob {
    /// Create a pending job for a batch
    #[must_use]
    pub fn new(kind: JobKind, batch: DataBatch, processors: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            batch,
            processors,
            started_at: None,
            completed_at: None,
            status: JobStatus::Pending,
            results: HashMap::new(),
            error: None,
        }
    }
}

/// Process-wide pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// Pipeline is stopped
    Stopped,
    /// Start-up in progress
    Starting,
    /// Workers are running
    Running,
    /// Temporarily paused
    Paused,
    /// Start-up failed
    Error,
}

/// Trend label derived from an OLS slope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendLabel {
    /// |slope| < 0.01
    Stable,
    /// slope in (0.01, 0.05]
    IncreasingSlow,
    /// slope in (0.05, 0.1]
    Increasing,
    /// slope > 0.1
    IncreasingFast,
    /// slope in [-0.05, -0.01)
    DecreasingSlow,
    /// slope in [-0.1, -0.05)
    Decreasing,
    /// slope < -0.1
    DecreasingFast,
}

impl TrendLabel {
    /// Stable string form used in result maps
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::IncreasingSlow => "increasing_slow",
            Self::Increasing => "increasing",
            Self::IncreasingFast => "increasing_fast",
            Self::DecreasingSlow => "decreasing_slow",
            Self::Decreasing => "decreasing",
            Self::DecreasingFast => "decreasing_fast",
        }
    }
}

/// Summary statistics for one (metric, source) group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Metric name of the group
    pub metric_name: String,

    /// Source of the group
    pub source: String,

    /// Number of numeric samples
    pub count: usize,

    /// Sum of samples
    pub sum: f64,

    /// Minimum sample
    pub min: f64,

    /// Maximum sample
    pub max: f64,

    /// Arithmetic mean
    pub avg: f64,

    /// Median
    pub median: f64,

    /// Population standard deviation (0 when n <= 1)
    pub std_dev: f64,

    /// Percentiles {25, 50, 75, 90, 95, 99}
    pub percentiles: BTreeMap<u8, f64>,

    /// Trend label over the time-ordered series
    pub trend: TrendLabel,

    /// When the aggregation was computed
    pub timestamp: DateTime<Utc>,
}

/// Fixed time-window widths for bucketed aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeWindow {
    /// 1 minute
    Minute,
    /// 5 minutes
    FiveMinutes,
    /// 15 minutes
    FifteenMinutes,
    /// 1 hour
    Hour,
    /// 1 day
    Day,
    /// 1 week
    Week,
    /// 30 days
    Month,
}

impl TimeWindow {
    /// Window width in seconds
    #[must_use]
    pub const fn seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
            Self::Month => 2_592_000,
        }
    }

    /// Parse the documented window labels (`"1m"`, `"5m"`, `"15m"`, `"1h"`,
    /// `"1d"`, `"1w"`, `"1M"`)
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "1m" => Some(Self::Minute),
            "5m" => Some(Self::FiveMinutes),
            "15m" => Some(Self::FifteenMinutes),
            "1h" => Some(Self::Hour),
            "1d" => Some(Self::Day),
            "1w" => Some(Self::Week),
            "1M" => Some(Self::Month),
            _ => None,
        }
    }

    /// Label form of the window
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Minute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::Hour => "1h",
            Self::Day => "1d",
            Self::Week => "1w",
            Self::Month => "1M",
        }
    }
}

/// Aggregate function for server-side bucketed queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    /// Arithmetic mean per bucket
    Avg,
    /// Sum per bucket
    Sum,
    /// Minimum per bucket
    Min,
    /// Maximum per bucket
    Max,
    /// Sample count per bucket
    Count,
}

/// Query filter for stored data points
///
/// All predicates combine with AND; absent predicates match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPointFilter {
    /// Filter by source
    pub source: Option<String>,

    /// Filter by metric name
    pub metric_name: Option<String>,

    /// Inclusive range start
    pub start_time: Option<DateTime<Utc>>,

    /// Inclusive range end
    pub end_time: Option<DateTime<Utc>>,

    /// Minimum numeric value
    pub min_value: Option<f64>,

    /// Maximum numeric value
    pub max_value: Option<f64>,

    /// Tag equality predicates
    pub tags: HashMap<String, String>,

    /// Limit number of results (default 1000)
    pub limit: Option<u32>,
}

/// Health score snapshot persisted by the metrics store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthScore {
    /// Producing source
    pub source: String,

    /// Component the score describes
    pub component: String,

    /// Score in [0, 100]
    pub score: f64,

    /// Letter grade derived from the score
    pub grade: String,

    /// Arbitrary metrics blob backing the score
    pub metrics: serde_json::Value,

    /// Snapshot timestamp
    pub timestamp: DateTime<Utc>,
}

/// Pipeline health report returned by `get_health_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall verdict
    pub healthy: bool,

    /// Composite score in [0, 100]
    pub health_score: f64,

    /// Per-store health
    pub stores: HashMap<String, bool>,

    /// Cache counter snapshot
    pub cache: crate::cache::CacheStatsSnapshot,

    /// Queue sizes (input, processing, output)
    pub queue_sizes: QueueSizes,

    /// Jobs completed per second since start
    pub processing_rate: f64,

    /// Failed jobs as a fraction of all finished jobs
    pub error_rate: f64,
}

/// Sizes of the three scheduler queues
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueSizes {
    /// Batches awaiting job creation
    pub input: usize,

    /// Jobs awaiting a worker
    pub processing: usize,

    /// Completed jobs retained for inspection
    pub output: usize,
}

/// Counter snapshot exposed by `get_status`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    /// Batches accepted by `ingest`
    pub batches_ingested: u64,

    /// Jobs that reached `Completed`
    pub jobs_completed: u64,

    /// Jobs that reached `Failed`
    pub jobs_failed: u64,

    /// Data points that passed through the processors
    pub points_processed: u64,

    /// Expired rows removed by retention cleanup
    pub points_expired: u64,
}

/// Status report returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current pipeline status
    pub status: PipelineStatus,

    /// Convenience flag: status == Running
    pub running: bool,

    /// Seconds since `start()` succeeded
    pub uptime_seconds: u64,

    /// Counter snapshot
    pub stats: PipelineStatsSnapshot,

    /// Queue sizes
    pub queue_sizes: QueueSizes,
}
