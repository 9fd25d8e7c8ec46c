//! Aggregator Stage
//!
//! Groups points by (metric name, source) and computes summary statistics,
//! plus time-window, tag-combination, rate and health aggregations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::PipelineResult;
use crate::processors::{Processor, ProcessorMetrics};
use crate::stats;
use crate::types::{AggregationResult, DataBatch, DataPoint, TimeWindow, TrendLabel};

const PERCENTILE_LEVELS: [u8; 6] = [25, 50, 75, 90, 95, 99];

/// Rate metrics over a point series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateMetrics {
    /// Events per second between first and last point
    pub events_per_second: f64,

    /// Events per minute
    pub events_per_minute: f64,

    /// Events per hour
    pub events_per_hour: f64,
}

/// Health metrics over a point series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Valid numeric samples as a percentage of all samples
    pub quality_score: f64,

    /// `100 − stddev/avg·100`, clamped at 0
    pub consistency_score: f64,

    /// Minutes since the latest sample
    pub data_freshness_minutes: f64,
}

/// Aggregator stage
#[derive(Debug)]
pub struct Aggregator {
    metrics: Arc<parking_lot::Mutex<ProcessorMetrics>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Create a new aggregator
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(parking_lot::Mutex::new(ProcessorMetrics::new("aggregator"))),
        }
    }

    /// Aggregate points grouped by (metric name, source)
    ///
    /// Groups without a single numeric value are skipped.
    #[must_use]
    pub fn aggregate(&self, points: &[DataPoint]) -> HashMap<String, AggregationResult> {
        let mut results = HashMap::new();

        for (key, group) in group_by_metric_source(points) {
            if let Some(result) = Self::summarize_group(&group) {
                results.insert(key, result);
            }
        }

        results
    }

    fn summarize_group(group: &[&DataPoint]) -> Option<AggregationResult> {
        // Time-ordered numeric series for the trend fit
        let mut ordered: Vec<&DataPoint> = group.to_vec();
        ordered.sort_by_key(|p| p.timestamp);
        let values: Vec<f64> = ordered.iter().filter_map(|p| p.value.as_f64()).collect();
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut percentiles = BTreeMap::new();
        for p in PERCENTILE_LEVELS {
            percentiles.insert(p, stats::percentile_sorted(&sorted, f64::from(p)));
        }

        let first = ordered.first()?;
        Some(AggregationResult {
            metric_name: first.metric_name.clone(),
            source: first.source.clone(),
            count: values.len(),
            sum: values.iter().sum(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: stats::mean(&values),
            median: stats::median_sorted(&sorted),
            std_dev: stats::std_dev(&values),
            percentiles,
            trend: trend_label(&values),
            timestamp: Utc::now(),
        })
    }

    /// Bucket points into fixed time windows by epoch floor-division
    ///
    /// Returns per-bucket summaries keyed by the bucket's start epoch second.
    #[must_use]
    pub fn aggregate_windows(
        &self,
        points: &[DataPoint],
        window: TimeWindow,
    ) -> BTreeMap<i64, AggregationResult> {
        let width = window.seconds();
        let mut buckets: HashMap<i64, Vec<&DataPoint>> = HashMap::new();
        for point in points {
            let bucket = point.timestamp.timestamp().div_euclid(width) * width;
            buckets.entry(bucket).or_default().push(point);
        }

        buckets
            .into_iter()
            .filter_map(|(bucket, group)| {
                Self::summarize_group(&group).map(|result| (bucket, result))
            })
            .collect()
    }

    /// Aggregate by distinct combinations of the given tag keys
    ///
    /// The map key is the joined tag values, `"-"` standing in for a missing
    /// tag.
    #[must_use]
    pub fn aggregate_by_tags(
        &self,
        points: &[DataPoint],
        tag_keys: &[&str],
    ) -> HashMap<String, AggregationResult> {
        let mut groups: HashMap<String, Vec<&DataPoint>> = HashMap::new();
        for point in points {
            let combination: Vec<String> = tag_keys
                .iter()
                .map(|key| point.tags.get(*key).cloned().unwrap_or_else(|| "-".to_string()))
                .collect();
            groups.entry(combination.join(":")).or_default().push(point);
        }

        groups
            .into_iter()
            .filter_map(|(key, group)| Self::summarize_group(&group).map(|r| (key, r)))
            .collect()
    }

    /// Event rates from first to last point; None for fewer than 2 points or
    /// a zero time spread
    #[must_use]
    pub fn rate_metrics(&self, points: &[DataPoint]) -> Option<RateMetrics> {
        if points.len() < 2 {
            return None;
        }

        let mut ordered: Vec<&DataPoint> = points.iter().collect();
        ordered.sort_by_key(|p| p.timestamp);
        let elapsed = (ordered[ordered.len() - 1].timestamp - ordered[0].timestamp)
            .num_milliseconds() as f64
            / 1000.0_f64;
        if elapsed <= 0.0_f64 {
            return None;
        }

        let per_second = points.len() as f64 / elapsed;
        Some(RateMetrics {
            events_per_second: per_second,
            events_per_minute: per_second * 60.0_f64,
            events_per_hour: per_second * 3_600.0_f64,
        })
    }

    /// Data-health view of a point series; None for an empty series
    #[must_use]
    pub fn health_metrics(&self, points: &[DataPoint]) -> Option<HealthMetrics> {
        if points.is_empty() {
            return None;
        }

        let values: Vec<f64> = points.iter().filter_map(|p| p.value.as_f64()).collect();
        let quality_score = values.len() as f64 / points.len() as f64 * 100.0_f64;

        let consistency_score = if values.is_empty() {
            0.0_f64
        } else {
            let avg = stats::mean(&values);
            if avg.abs() < f64::EPSILON {
                0.0_f64
            } else {
                (100.0_f64 - stats::std_dev(&values) / avg * 100.0_f64).max(0.0_f64)
            }
        };

        let latest = points.iter().map(|p| p.timestamp).max()?;
        let data_freshness_minutes =
            (Utc::now() - latest).num_milliseconds() as f64 / 60_000.0_f64;

        Some(HealthMetrics {
            quality_score,
            consistency_score,
            data_freshness_minutes,
        })
    }
}

/// Group points by `(metric_name, source)` keyed as `"source:metric"`
fn group_by_metric_source(points: &[DataPoint]) -> HashMap<String, Vec<&DataPoint>> {
    let mut groups: HashMap<String, Vec<&DataPoint>> = HashMap::new();
    for point in points {
        let key = format!("{}:{}", point.source, point.metric_name);
        groups.entry(key).or_default().push(point);
    }
    groups
}

/// Trend label from the OLS slope over (index, value) pairs
fn trend_label(values: &[f64]) -> TrendLabel {
    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    let Some(fit) = stats::linear_regression(&xs, values) else {
        return TrendLabel::Stable;
    };

    let slope = fit.slope;
    if slope.abs() < 0.01_f64 {
        TrendLabel::Stable
    } else if slope > 0.0_f64 {
        if slope <= 0.05_f64 {
            TrendLabel::IncreasingSlow
        } else if slope <= 0.1_f64 {
            TrendLabel::Increasing
        } else {
            TrendLabel::IncreasingFast
        }
    } else if slope >= -0.05_f64 {
        TrendLabel::DecreasingSlow
    } else if slope >= -0.1_f64 {
        TrendLabel::Decreasing
    } else {
        TrendLabel::DecreasingFast
    }
}

#[async_trait::async_trait]
impl Processor for Aggregator {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    async fn process(&self, batch: &mut DataBatch) -> PipelineResult<serde_json::Value> {
        let start = Instant::now();
        let results = self.aggregate(&batch.points);
        let encoded = serde_json::to_value(&results);

        self.metrics.lock().record(encoded.is_ok(), start.elapsed());
        tracing::debug!(
            "Aggregated batch {} into {} groups in {:?}",
            batch.id,
            results.len(),
            start.elapsed()
        );

        Ok(json!({
            "groups": results.len(),
            "results": encoded?,
        }))
    }

    fn metrics(&self) -> ProcessorMetrics {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricValue;
    use chrono::Duration as ChronoDuration;

    fn numeric_points(values: &[f64]) -> Vec<DataPoint> {
        let base = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut p = DataPoint::new("system", "cpu_usage", MetricValue::Number(*v));
                p.timestamp = base + ChronoDuration::seconds(i as i64);
                p
            })
            .collect()
    }

    #[test]
    fn test_percentiles_for_one_to_hundred() {
        let aggregator = Aggregator::new();
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let points = numeric_points(&values);
        let results = aggregator.aggregate(&points);

        let result = results.get("system:cpu_usage").unwrap();
        assert!((result.percentiles[&50] - 50.5).abs() < 1e-9);
        assert!((result.percentiles[&25] - 25.75).abs() < 1e-9);
        assert!((result.median - 50.5).abs() < 1e-9);
        assert_eq!(result.count, 100);
        assert!((result.sum - 5050.0).abs() < 1e-9);
    }

    #[test]
    fn test_stddev_zero_for_single_sample() {
        let aggregator = Aggregator::new();
        let points = numeric_points(&[42.0]);
        let results = aggregator.aggregate(&points);
        let result = results.get("system:cpu_usage").unwrap();
        assert!(result.std_dev.abs() < f64::EPSILON);
    }

    #[test]
    fn test_trend_labels() {
        assert_eq!(trend_label(&[5.0, 5.0, 5.0, 5.0]), TrendLabel::Stable);
        // slope 0.03 per step
        let slow: Vec<f64> = (0..20).map(|i| f64::from(i) * 0.03).collect();
        assert_eq!(trend_label(&slow), TrendLabel::IncreasingSlow);
        // slope 1.0 per step
        let fast: Vec<f64> = (0..20).map(f64::from).collect();
        assert_eq!(trend_label(&fast), TrendLabel::IncreasingFast);
        let falling: Vec<f64> = (0..20).map(|i| -f64::from(i)).collect();
        assert_eq!(trend_label(&falling), TrendLabel::DecreasingFast);
    }

    #[test]
    fn test_non_numeric_groups_skipped() {
        let aggregator = Aggregator::new();
        let points = vec![DataPoint::new(
            "system",
            "status",
            MetricValue::Text("degraded".to_string()),
        )];
        assert!(aggregator.aggregate(&points).is_empty());
    }

    #[test]
    fn test_window_bucketing_floor_divides_epochs() {
        let aggregator = Aggregator::new();
        let mut points = numeric_points(&[1.0, 2.0, 3.0]);
        // Spread the points over three distinct minutes
        for (i, p) in points.iter_mut().enumerate() {
            p.timestamp = chrono::DateTime::from_timestamp(60 * i as i64 + 30, 0).unwrap();
        }
        let buckets = aggregator.aggregate_windows(&points, TimeWindow::Minute);
        assert_eq!(buckets.len(), 3);
        assert!(buckets.contains_key(&0));
        assert!(buckets.contains_key(&60));
        assert!(buckets.contains_key(&120));
    }

    #[test]
    fn test_rate_metrics() {
        let aggregator = Aggregator::new();
        let base = Utc::now();
        let points: Vec<DataPoint> = (0..10)
            .map(|i| {
                let mut p = DataPoint::new("system", "events", MetricValue::Number(1.0));
                p.timestamp = base + ChronoDuration::seconds(i);
                p
            })
            .collect();

        // 10 events over 9 seconds
        let rates = aggregator.rate_metrics(&points).unwrap();
        assert!((rates.events_per_second - 10.0 / 9.0).abs() < 1e-9);
        assert!((rates.events_per_minute - rates.events_per_second * 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_metrics_quality_score() {
        let aggregator = Aggregator::new();
        let mut points = numeric_points(&[10.0, 10.0, 10.0]);
        points.push(DataPoint::new(
            "system",
            "cpu_usage",
            MetricValue::Text("unknown".to_string()),
        ));

        let health = aggregator.health_metrics(&points).unwrap();
        assert!((health.quality_score - 75.0).abs() < 1e-9);
        // Identical samples: perfectly consistent
        assert!((health.consistency_score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_by_tags_uses_placeholder_for_missing() {
        let aggregator = Aggregator::new();
        let tagged = DataPoint::new("system", "cpu", MetricValue::Number(1.0))
            .with_tag("host", "web1");
        let untagged = DataPoint::new("system", "cpu", MetricValue::Number(2.0));
        let results = aggregator.aggregate_by_tags(&[tagged, untagged], &["host"]);
        assert!(results.contains_key("web1"));
        assert!(results.contains_key("-"));
    }
}
