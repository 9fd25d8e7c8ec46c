//! Analyzer Stage
//!
//! Statistical analysis per (metric name, source) group: trend regression,
//! anomaly detection (z-score, IQR, rolling window), pattern findings, a full
//! statistical summary and a performance composite. Each sub-analysis is
//! computed independently and omitted when its input is insufficient.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::PipelineResult;
use crate::processors::{Processor, ProcessorMetrics};
use crate::stats;
use crate::types::{DataBatch, DataPoint};

const Z_SCORE_THRESHOLD: f64 = 3.0;
const IQR_MULTIPLIER: f64 = 1.5;
const ROLLING_WINDOW: usize = 10;
const CANDIDATE_PERIODS: [usize; 4] = [4, 8, 12, 24];
const MIN_TREND_POINTS: usize = 3;
const MIN_ANOMALY_POINTS: usize = 5;
const MIN_PATTERN_POINTS: usize = 5;
const MIN_PERIODIC_POINTS: usize = 24;

/// Direction of a fitted trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// Positive slope beyond the stability band
    Increasing,
    /// Negative slope beyond the stability band
    Decreasing,
    /// |slope| < 0.01
    Stable,
}

/// Strength tier of a fitted trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStrength {
    /// |slope| <= 0.05
    Weak,
    /// |slope| <= 0.1
    Moderate,
    /// |slope| > 0.1
    Strong,
}

/// Trend regression over a time-ordered series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalysis {
    /// Trend direction
    pub direction: TrendDirection,

    /// Trend strength tier
    pub strength: TrendStrength,

    /// OLS slope over (index, value)
    pub slope: f64,

    /// OLS intercept
    pub intercept: f64,

    /// Coefficient of determination
    pub r_squared: f64,

    /// `(last − first) / first · 100`
    pub change_rate_pct: f64,

    /// `min(1, R² · n/10)`
    pub confidence: f64,
}

/// One flagged anomaly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// Index of the flagged point in the time-ordered series
    pub index: usize,

    /// Flagged value
    pub value: f64,

    /// Detection methods that flagged this index
    pub methods: Vec<String>,
}

/// Union of the three anomaly detectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Flagged anomalies, ordered by index
    pub anomalies: Vec<Anomaly>,

    /// Flagged indices as a fraction of the series length
    pub anomaly_rate: f64,
}

/// Detected periodic pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicPattern {
    /// Candidate period that correlated best
    pub period: usize,

    /// Correlation at that period
    pub correlation: f64,

    /// |correlation| > 0.8
    pub strong: bool,
}

/// Pattern findings over a series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternFindings {
    /// Best periodic correlation, when one clears the 0.5 bar
    pub periodic: Option<PeriodicPattern>,

    /// Monotonic label when >80% of successive deltas share a sign
    pub monotonic: Option<String>,

    /// Distribution shape from the mean/median skew comparison
    pub distribution_shape: String,
}

/// Full statistical summary of a numeric series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticalSummary {
    /// Sample count
    pub count: usize,
    /// Minimum
    pub min: f64,
    /// Maximum
    pub max: f64,
    /// Sum
    pub sum: f64,
    /// Mean
    pub mean: f64,
    /// Median
    pub median: f64,
    /// Mode
    pub mode: f64,
    /// Population standard deviation
    pub std_dev: f64,
    /// Population variance
    pub variance: f64,
    /// Percentiles {25, 50, 75, 90, 95, 99}
    pub percentiles: BTreeMap<u8, f64>,
    /// max − min
    pub range: f64,
    /// `stddev / mean · 100` (0 for a zero mean)
    pub coefficient_of_variation: f64,
    /// Skew-based distribution label
    pub distribution: String,
}

/// Qualitative rating used by the performance composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    /// Best tier
    High,
    /// Middle tier
    Medium,
    /// Worst tier
    Low,
}

/// Composite performance assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAssessment {
    /// Stability rating from the coefficient of variation
    pub stability: Rating,

    /// Coefficient of variation backing the stability rating
    pub coefficient_of_variation: f64,

    /// Reliability rating from the anomaly rate
    pub reliability: Rating,

    /// Anomaly rate backing the reliability rating
    pub anomaly_rate: f64,

    /// Direction of the fitted trend, when available
    pub trend_direction: Option<TrendDirection>,

    /// Textual recommendations
    pub recommendations: Vec<String>,
}

/// Analysis of one (metric, source) group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Metric name of the group
    pub metric_name: String,

    /// Source of the group
    pub source: String,

    /// Trend regression (needs >= 3 points)
    pub trend: Option<TrendAnalysis>,

    /// Anomaly union (needs >= 5 points)
    pub anomalies: Option<AnomalyReport>,

    /// Pattern findings (needs >= 5 points)
    pub patterns: Option<PatternFindings>,

    /// Statistical summary (needs >= 1 numeric point)
    pub statistics: Option<StatisticalSummary>,

    /// Performance composite (needs statistics + anomalies)
    pub performance: Option<PerformanceAssessment>,
}

/// Analyzer stage
#[derive(Debug)]
pub struct Analyzer {
    metrics: Arc<parking_lot::Mutex<ProcessorMetrics>>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    /// Create a new analyzer
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(parking_lot::Mutex::new(ProcessorMetrics::new("analyzer"))),
        }
    }

    /// Analyze points grouped by (metric name, source)
    #[must_use]
    pub fn analyze(&self, points: &[DataPoint]) -> HashMap<String, AnalysisResult> {
        let mut groups: HashMap<String, Vec<&DataPoint>> = HashMap::new();
        for point in points {
            let key = format!("{}:{}", point.source, point.metric_name);
            groups.entry(key).or_default().push(point);
        }

        let mut results = HashMap::new();
        for (key, mut group) in groups {
            group.sort_by_key(|p| p.timestamp);
            let values: Vec<f64> = group.iter().filter_map(|p| p.value.as_f64()).collect();
            if values.is_empty() {
                continue;
            }

            let trend = analyze_trend(&values);
            let anomalies = detect_anomalies(&values);
            let patterns = detect_patterns(&values);
            let statistics = Some(statistical_summary(&values));
            let performance = match (&statistics, &anomalies) {
                (Some(summary), Some(report)) => {
                    Some(assess_performance(summary, report, trend.as_ref()))
                }
                _ => None,
            };

            results.insert(
                key,
                AnalysisResult {
                    metric_name: group[0].metric_name.clone(),
                    source: group[0].source.clone(),
                    trend,
                    anomalies,
                    patterns,
                    statistics,
                    performance,
                },
            );
        }

        results
    }
}

/// OLS trend over a time-ordered series; None for fewer than 3 points
fn analyze_trend(values: &[f64]) -> Option<TrendAnalysis> {
    if values.len() < MIN_TREND_POINTS {
        return None;
    }

    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    let fit = stats::linear_regression(&xs, values)?;

    let direction = if fit.slope.abs() < 0.01_f64 {
        TrendDirection::Stable
    } else if fit.slope > 0.0_f64 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };

    let strength = if fit.slope.abs() <= 0.05_f64 {
        TrendStrength::Weak
    } else if fit.slope.abs() <= 0.1_f64 {
        TrendStrength::Moderate
    } else {
        TrendStrength::Strong
    };

    let first = values[0];
    let last = values[values.len() - 1];
    let change_rate_pct = if first.abs() < f64::EPSILON {
        0.0_f64
    } else {
        (last - first) / first * 100.0_f64
    };

    let confidence = (fit.r_squared * values.len() as f64 / 10.0_f64).min(1.0_f64);

    Some(TrendAnalysis {
        direction,
        strength,
        slope: fit.slope,
        intercept: fit.intercept,
        r_squared: fit.r_squared,
        change_rate_pct,
        confidence,
    })
}

/// Union of the z-score, IQR and rolling-window detectors; None for fewer
/// than 5 points
fn detect_anomalies(values: &[f64]) -> Option<AnomalyReport> {
    if values.len() < MIN_ANOMALY_POINTS {
        return None;
    }

    let mut flagged: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut flag = |index: usize, method: &str| {
        flagged.entry(index).or_default().push(method.to_string());
    };

    // z-score against the whole series (population stddev; the >= keeps
    // exact-threshold deviations flagged)
    let mean = stats::mean(values);
    let std_dev = stats::std_dev(values);
    if std_dev > f64::EPSILON {
        for (i, v) in values.iter().enumerate() {
            if (v - mean).abs() / std_dev >= Z_SCORE_THRESHOLD {
                flag(i, "z_score");
            }
        }
    }

    // IQR fence with quartiles at the 25th/75th ordinal positions
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let q1 = sorted[(n / 4).min(n - 1)];
    let q3 = sorted[(3 * n / 4).min(n - 1)];
    let iqr = q3 - q1;
    if iqr > f64::EPSILON {
        let lower = q1 - IQR_MULTIPLIER * iqr;
        let upper = q3 + IQR_MULTIPLIER * iqr;
        for (i, v) in values.iter().enumerate() {
            if *v < lower || *v > upper {
                flag(i, "iqr");
            }
        }
    }

    // Rolling-window local z-score
    for i in ROLLING_WINDOW..values.len() {
        let window = &values[i - ROLLING_WINDOW..i];
        let local_mean = stats::mean(window);
        let local_std = stats::std_dev(window);
        if local_std > f64::EPSILON
            && (values[i] - local_mean).abs() / local_std >= Z_SCORE_THRESHOLD
        {
            flag(i, "rolling_window");
        }
    }

    let anomalies: Vec<Anomaly> = flagged
        .into_iter()
        .map(|(index, methods)| Anomaly {
            index,
            value: values[index],
            methods,
        })
        .collect();

    let anomaly_rate = anomalies.len() as f64 / values.len() as f64;
    Some(AnomalyReport {
        anomalies,
        anomaly_rate,
    })
}

/// Periodic / monotonic / distribution-shape findings; None for fewer than
/// 5 points
fn detect_patterns(values: &[f64]) -> Option<PatternFindings> {
    if values.len() < MIN_PATTERN_POINTS {
        return None;
    }

    let periodic = if values.len() >= MIN_PERIODIC_POINTS {
        detect_periodicity(values)
    } else {
        None
    };

    let monotonic = detect_monotonic(values);

    let mean = stats::mean(values);
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = stats::median_sorted(&sorted);
    let std_dev = stats::std_dev(values);
    let distribution_shape = if std_dev < f64::EPSILON || (mean - median).abs() <= 0.1_f64 * std_dev
    {
        "symmetric".to_string()
    } else if mean > median {
        "right_skewed".to_string()
    } else {
        "left_skewed".to_string()
    };

    Some(PatternFindings {
        periodic,
        monotonic,
        distribution_shape,
    })
}

/// Best periodic correlation across the candidate periods
fn detect_periodicity(values: &[f64]) -> Option<PeriodicPattern> {
    let half = values.len() / 2;
    let mut best: Option<PeriodicPattern> = None;

    for period in CANDIDATE_PERIODS {
        if period + half > values.len() {
            continue;
        }
        let Some(corr) = stats::correlation(&values[..half], &values[period..period + half])
        else {
            continue;
        };
        if corr.abs() > 0.5_f64 {
            let candidate = PeriodicPattern {
                period,
                correlation: corr,
                strong: corr.abs() > 0.8_f64,
            };
            let replace = best
                .as_ref()
                .map_or(true, |b| corr.abs() > b.correlation.abs());
            if replace {
                best = Some(candidate);
            }
        }
    }

    best
}

/// Monotonic label when >80% of successive deltas share a sign
fn detect_monotonic(values: &[f64]) -> Option<String> {
    let deltas = values.len() - 1;
    if deltas == 0 {
        return None;
    }

    let rising = values.windows(2).filter(|w| w[1] > w[0]).count();
    let falling = values.windows(2).filter(|w| w[1] < w[0]).count();

    if rising as f64 / deltas as f64 > 0.8_f64 {
        Some("strong_monotonic_increasing".to_string())
    } else if falling as f64 / deltas as f64 > 0.8_f64 {
        Some("strong_monotonic_decreasing".to_string())
    } else {
        None
    }
}

/// Full statistical summary of a numeric series
fn statistical_summary(values: &[f64]) -> StatisticalSummary {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mean = stats::mean(values);
    let median = stats::median_sorted(&sorted);
    let std_dev = stats::std_dev(values);

    let mut percentiles = BTreeMap::new();
    for p in [25_u8, 50, 75, 90, 95, 99] {
        percentiles.insert(p, stats::percentile_sorted(&sorted, f64::from(p)));
    }

    let coefficient_of_variation = if mean.abs() < f64::EPSILON {
        0.0_f64
    } else {
        std_dev / mean.abs() * 100.0_f64
    };

    let skew = stats::skewness(values);
    let distribution = if skew.abs() < 0.5_f64 {
        "approximately_normal".to_string()
    } else if skew > 0.0_f64 {
        "right_skewed".to_string()
    } else {
        "left_skewed".to_string()
    };

    StatisticalSummary {
        count: values.len(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        sum: values.iter().sum(),
        mean,
        median,
        mode: stats::mode(values).unwrap_or(0.0_f64),
        std_dev,
        variance: stats::variance(values),
        percentiles,
        range: sorted[sorted.len() - 1] - sorted[0],
        coefficient_of_variation,
        distribution,
    }
}

/// Performance composite from stability, reliability and trend
fn assess_performance(
    summary: &StatisticalSummary,
    report: &AnomalyReport,
    trend: Option<&TrendAnalysis>,
) -> PerformanceAssessment {
    let cv = summary.coefficient_of_variation;
    let stability = if cv < 10.0_f64 {
        Rating::High
    } else if cv < 25.0_f64 {
        Rating::Medium
    } else {
        Rating::Low
    };

    let reliability = if report.anomaly_rate < 0.05_f64 {
        Rating::High
    } else if report.anomaly_rate < 0.15_f64 {
        Rating::Medium
    } else {
        Rating::Low
    };

    let mut recommendations = Vec::new();
    if stability == Rating::Low {
        recommendations.push(
            "High variance detected; investigate noisy producers or smooth upstream sampling"
                .to_string(),
        );
    }
    if reliability == Rating::Low {
        recommendations.push(
            "Frequent anomalies detected; review alert thresholds and recent deployments"
                .to_string(),
        );
    }
    if let Some(t) = trend {
        if t.direction == TrendDirection::Increasing && t.strength == TrendStrength::Strong {
            recommendations
                .push("Strong upward trend; verify capacity headroom".to_string());
        }
        if t.direction == TrendDirection::Decreasing && t.strength == TrendStrength::Strong {
            recommendations
                .push("Strong downward trend; confirm the drop is expected".to_string());
        }
    }
    if recommendations.is_empty() {
        recommendations.push("No action required".to_string());
    }

    PerformanceAssessment {
        stability,
        coefficient_of_variation: cv,
        reliability,
        anomaly_rate: report.anomaly_rate,
        trend_direction: trend.map(|t| t.direction),
        recommendations,
    }
}

#[async_trait::async_trait]
impl Processor for Analyzer {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    async fn process(&self, batch: &mut DataBatch) -> PipelineResult<serde_json::Value> {
        let start = Instant::now();
        let results = self.analyze(&batch.points);
        let encoded = serde_json::to_value(&results);

        self.metrics.lock().record(encoded.is_ok(), start.elapsed());
        tracing::debug!(
            "Analyzed batch {} into {} groups in {:?}",
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
