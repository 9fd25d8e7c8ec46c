//! Processing Stages
//!
//! The three pipeline stages applied to every batch in order:
//! transform → aggregate → analyze.

pub mod aggregator;
pub mod analyzer;
pub mod transformer;

pub use aggregator::{Aggregator, HealthMetrics, RateMetrics};
pub use analyzer::Analyzer;
pub use transformer::Transformer;

use std::sync::Arc;

use crate::error::PipelineResult;
use crate::types::DataBatch;

/// A pipeline stage applied to a batch by a worker
///
/// Implementations mutate the batch points (transformer) or attach a result
/// blob to the job's result map via their return value.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    /// Stage name as referenced in a job's processor list
    fn name(&self) -> &'static str;

    /// Run the stage against a batch, returning its result blob
    async fn process(&self, batch: &mut DataBatch) -> PipelineResult<serde_json::Value>;

    /// Stage metrics snapshot
    fn metrics(&self) -> ProcessorMetrics;
}

/// Per-stage metrics
#[derive(Debug, Clone)]
pub struct ProcessorMetrics {
    /// Stage name
    pub stage_name: String,

    /// Batches processed
    pub batches_processed: u64,

    /// Batches that raised an error
    pub batches_failed: u64,

    /// Average processing time in microseconds
    pub avg_processing_time_us: u64,

    /// Total processing time in microseconds
    pub total_processing_time_us: u64,
}

impl ProcessorMetrics {
    /// Create zeroed metrics for a stage
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            batches_processed: 0,
            batches_failed: 0,
            avg_processing_time_us: 0,
            total_processing_time_us: 0,
        }
    }

    /// Record one processed batch
    pub fn record(&mut self, success: bool, duration: std::time::Duration) {
        self.batches_processed += 1;
        if !success {
            self.batches_failed += 1;
        }
        let duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_processing_time_us += duration_us;
        self.avg_processing_time_us = self.total_processing_time_us / self.batches_processed;
    }
}

/// Build the default stage set keyed by processor name
#[must_use]
pub fn default_processors() -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(Transformer::new()),
        Arc::new(Aggregator::new()),
        Arc::new(Analyzer::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_record_counts_failures() {
        let mut metrics = ProcessorMetrics::new("stage");
        metrics.record(true, Duration::from_micros(10));
        metrics.record(false, Duration::from_micros(30));
        assert_eq!(metrics.batches_processed, 2);
        assert_eq!(metrics.batches_failed, 1);
        assert_eq!(metrics.avg_processing_time_us, 20);
        assert_eq!(metrics.total_processing_time_us, 40);
    }

    #[test]
    fn test_default_processors_cover_all_stages() {
        let names: Vec<&str> = default_processors().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["transformer", "aggregator", "analyzer"]);
    }
}
