//! Transformer Stage
//!
//! Per-point cleaning, normalization and enrichment. A failure while
//! transforming a single point keeps the original point unmodified rather
//! than dropping it; the batch as a whole never fails here.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Timelike, Weekday};
use regex::Regex;
use serde_json::json;

use crate::error::PipelineResult;
use crate::processors::{Processor, ProcessorMetrics};
use crate::types::{DataBatch, DataPoint, MetricValue};

/// Transformer stage: clean → normalize → enrich, per point
#[derive(Debug)]
pub struct Transformer {
    /// Matches runs of non-word characters in metric names
    non_word: Regex,

    /// Matches runs of underscores left after substitution
    repeated_underscores: Regex,

    metrics: Arc<parking_lot::Mutex<ProcessorMetrics>>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    /// Create a new transformer
    ///
    /// # Panics
    ///
    /// Never panics; the patterns are literals known to compile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            non_word: Regex::new(r"[^\w]+").unwrap_or_else(|_| unreachable!("literal pattern")),
            repeated_underscores: Regex::new(r"_+")
                .unwrap_or_else(|_| unreachable!("literal pattern")),
            metrics: Arc::new(parking_lot::Mutex::new(ProcessorMetrics::new("transformer"))),
        }
    }

    /// Transform a set of points, keeping originals on per-point failure
    #[must_use]
    pub fn transform(&self, points: Vec<DataPoint>) -> Vec<DataPoint> {
        points
            .into_iter()
            .map(|point| {
                let original = point.clone();
                match self.transform_point(point) {
                    Ok(transformed) => transformed,
                    Err(e) => {
                        tracing::warn!(
                            "Transform failed for point {} ({}), keeping original: {}",
                            original.id,
                            original.metric_name,
                            e
                        );
                        original
                    }
                }
            })
            .collect()
    }

    fn transform_point(&self, mut point: DataPoint) -> PipelineResult<DataPoint> {
        self.clean(&mut point);
        self.normalize(&mut point);
        self.enrich(&mut point)?;
        Ok(point)
    }

    /// Replace non-finite numeric values with 0 and drop empty tag/metadata
    /// entries
    fn clean(&self, point: &mut DataPoint) {
        if let MetricValue::Number(v) = point.value {
            if !v.is_finite() {
                point.value = MetricValue::Number(0.0_f64);
            }
        }

        point
            .tags
            .retain(|key, value| !key.trim().is_empty() && !value.trim().is_empty());
        point
            .metadata
            .retain(|key, value| !key.trim().is_empty() && !value.is_null());
    }

    /// Snake-case the metric name, lower-case the source, normalize tags
    fn normalize(&self, point: &mut DataPoint) {
        point.metric_name = self.normalize_name(&point.metric_name);
        point.source = point.source.trim().to_lowercase();

        let tags = std::mem::take(&mut point.tags);
        point.tags = tags
            .into_iter()
            .map(|(key, value)| {
                (
                    self.normalize_name(&key),
                    value.trim().to_lowercase(),
                )
            })
            .collect();
    }

    fn normalize_name(&self, name: &str) -> String {
        let lowered = name.trim().to_lowercase();
        let replaced = self.non_word.replace_all(&lowered, "_");
        let collapsed = self.repeated_underscores.replace_all(&replaced, "_");
        collapsed.trim_matches('_').to_string()
    }

    /// Attach derived metadata: timestamps, calendar info, value buckets and
    /// the source-type/component split
    fn enrich(&self, point: &mut DataPoint) -> PipelineResult<()> {
        let ts = point.timestamp;
        point
            .metadata
            .insert("iso_timestamp".to_string(), json!(ts.to_rfc3339()));
        point
            .metadata
            .insert("epoch_seconds".to_string(), json!(ts.timestamp()));
        point
            .metadata
            .insert("hour_of_day".to_string(), json!(ts.hour()));
        point.metadata.insert(
            "day_of_week".to_string(),
            json!(ts.weekday().to_string().to_lowercase()),
        );
        point.metadata.insert(
            "is_weekend".to_string(),
            json!(matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)),
        );

        if let Some(v) = point.value.as_f64() {
            point
                .metadata
                .insert("value_magnitude".to_string(), json!(magnitude_bucket(v)));
            point
                .metadata
                .insert("value_sign".to_string(), json!(sign_label(v)));
        }

        // source_type / component split on the first underscore
        let (source_type, component) = match point.source.split_once('_') {
            Some((kind, rest)) => (kind.to_string(), rest.to_string()),
            None => (point.source.clone(), String::new()),
        };
        point
            .metadata
            .insert("source_type".to_string(), json!(source_type));
        if !component.is_empty() {
            point
                .metadata
                .insert("source_component".to_string(), json!(component));
        }

        Ok(())
    }
}

/// Magnitude bucket for a numeric value, by absolute magnitude
fn magnitude_bucket(value: f64) -> &'static str {
    let magnitude = value.abs();
    if magnitude < 1.0_f64 {
        "very_low"
    } else if magnitude < 10.0_f64 {
        "low"
    } else if magnitude < 100.0_f64 {
        "medium"
    } else if magnitude < 1_000.0_f64 {
        "high"
    } else {
        "very_high"
    }
}

fn sign_label(value: f64) -> &'static str {
    if value > 0.0_f64 {
        "positive"
    } else if value < 0.0_f64 {
        "negative"
    } else {
        "zero"
    }
}

#[async_trait::async_trait]
impl Processor for Transformer {
    fn name(&self) -> &'static str {
        "transformer"
    }

    async fn process(&self, batch: &mut DataBatch) -> PipelineResult<serde_json::Value> {
        let start = Instant::now();
        let count = batch.points.len();

        let points = std::mem::take(&mut batch.points);
        batch.points = self.transform(points);

        self.metrics.lock().record(true, start.elapsed());
        tracing::debug!(
            "Transformed batch {} ({} points) in {:?}",
            batch.id,
            count,
            start.elapsed()
        );

        Ok(json!({ "points_transformed": count }))
    }

    fn metrics(&self) -> ProcessorMetrics {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn point(metric: &str, source: &str, value: MetricValue) -> DataPoint {
        DataPoint::new(source, metric, value)
    }

    #[test]
    fn test_clean_replaces_non_finite_values() {
        let transformer = Transformer::new();
        let points = vec![
            point("cpu", "system", MetricValue::Number(f64::NAN)),
            point("cpu", "system", MetricValue::Number(f64::INFINITY)),
        ];
        let cleaned = transformer.transform(points);
        for p in cleaned {
            assert_eq!(p.value, MetricValue::Number(0.0));
        }
    }

    #[test]
    fn test_clean_drops_empty_tag_entries() {
        let transformer = Transformer::new();
        let p = point("cpu", "system", MetricValue::Number(1.0))
            .with_tag("host", "web1")
            .with_tag("", "orphan")
            .with_tag("region", "  ");
        let transformed = transformer.transform(vec![p]);
        assert_eq!(transformed[0].tags.len(), 1);
        assert_eq!(transformed[0].tags.get("host").map(String::as_str), Some("web1"));
    }

    #[test]
    fn test_normalize_snake_cases_metric_names() {
        let transformer = Transformer::new();
        let p = point("CPU Usage (%)", "System", MetricValue::Number(42.0));
        let transformed = transformer.transform(vec![p]);
        assert_eq!(transformed[0].metric_name, "cpu_usage");
        assert_eq!(transformed[0].source, "system");
    }

    #[test]
    fn test_enrich_attaches_calendar_metadata() {
        let transformer = Transformer::new();
        let mut p = point("latency", "health_checker", MetricValue::Number(250.0));
        // Saturday 2024-06-01 14:30:00 UTC
        p.timestamp = Utc.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap();
        let transformed = transformer.transform(vec![p]);
        let meta = &transformed[0].metadata;
        assert_eq!(meta.get("hour_of_day"), Some(&json!(14)));
        assert_eq!(meta.get("is_weekend"), Some(&json!(true)));
        assert_eq!(meta.get("value_magnitude"), Some(&json!("high")));
        assert_eq!(meta.get("value_sign"), Some(&json!("positive")));
        assert_eq!(meta.get("source_type"), Some(&json!("health")));
        assert_eq!(meta.get("source_component"), Some(&json!("checker")));
    }

    #[test]
    fn test_transform_is_idempotent() {
        let transformer = Transformer::new();
        let p = point("Disk IO / sec", "Webhook_GitHub", MetricValue::Number(12.0))
            .with_tag("Env", "Prod");
        let once = transformer.transform(vec![p]);
        let twice = transformer.transform(once.clone());
        assert_eq!(once, twice);
    }
}
