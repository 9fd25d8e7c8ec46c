//! Shared numeric helpers for the aggregation and analysis stages
//!
//! All functions operate on plain `f64` slices; callers extract numeric views
//! from [`crate::types::MetricValue`] first.

/// Arithmetic mean; 0 for an empty slice
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0_f64;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Exact median over a pre-sorted slice; 0 for an empty slice
#[must_use]
pub fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0_f64;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0_f64
    } else {
        sorted[n / 2]
    }
}

/// Population standard deviation; 0 when n <= 1
#[must_use]
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0_f64;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Population variance; 0 when n <= 1
#[must_use]
pub fn variance(values: &[f64]) -> f64 {
    let sd = std_dev(values);
    sd * sd
}

/// Percentile by linear interpolation over a pre-sorted slice
///
/// p50 is computed as the exact median; other percentiles interpolate between
/// the two sorted values bracketing index `(p/100)·(n−1)`.
#[must_use]
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0_f64;
    }
    if n == 1 {
        return sorted[0];
    }
    if (p - 50.0_f64).abs() < f64::EPSILON {
        return median_sorted(sorted);
    }

    let rank = (p / 100.0_f64) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0_f64 - weight) + sorted[upper] * weight
}

/// Most frequent value, ties broken by first occurrence; None for empty input
#[must_use]
pub fn mode(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut best_value = values[0];
    let mut best_count = 0_usize;
    for (i, candidate) in values.iter().enumerate() {
        let count = values.iter().filter(|v| (*v - candidate).abs() < f64::EPSILON).count();
        if count > best_count {
            best_count = count;
            best_value = values[i];
        }
    }
    Some(best_value)
}

/// Ordinary-least-squares fit over (x, y) pairs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    /// Slope of the fitted line
    pub slope: f64,

    /// Intercept of the fitted line
    pub intercept: f64,

    /// Coefficient of determination in [0, 1]
    pub r_squared: f64,
}

/// OLS regression over index/value pairs; None when fewer than 2 points or a
/// degenerate x spread
#[must_use]
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    let n = xs.len();
    if n < 2 || n != ys.len() {
        return None;
    }

    let mean_x = mean(xs);
    let mean_y = mean(ys);

    let mut ss_xy = 0.0_f64;
    let mut ss_xx = 0.0_f64;
    for i in 0..n {
        ss_xy += (xs[i] - mean_x) * (ys[i] - mean_y);
        ss_xx += (xs[i] - mean_x).powi(2);
    }

    if ss_xx.abs() < f64::EPSILON {
        return None;
    }

    let slope = ss_xy / ss_xx;
    let intercept = mean_y - slope * mean_x;

    // R^2 from residual and total sums of squares
    let mut ss_res = 0.0_f64;
    let mut ss_tot = 0.0_f64;
    for i in 0..n {
        let predicted = slope * xs[i] + intercept;
        ss_res += (ys[i] - predicted).powi(2);
        ss_tot += (ys[i] - mean_y).powi(2);
    }

    let r_squared = if ss_tot.abs() < f64::EPSILON {
        1.0_f64
    } else {
        (1.0_f64 - ss_res / ss_tot).clamp(0.0_f64, 1.0_f64)
    };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

/// Pearson correlation between two equal-length series; None for degenerate
/// input
#[must_use]
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len();
    if n < 2 || n != b.len() {
        return None;
    }

    let mean_a = mean(a);
    let mean_b = mean(b);

    let mut cov = 0.0_f64;
    let mut var_a = 0.0_f64;
    let mut var_b = 0.0_f64;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a.abs() < f64::EPSILON || var_b.abs() < f64::EPSILON {
        return None;
    }

    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Pearson's second skewness coefficient: `3·(mean − median) / stddev`;
/// 0 when the spread is degenerate
#[must_use]
pub fn skewness(values: &[f64]) -> f64 {
    let sd = std_dev(values);
    if sd.abs() < f64::EPSILON {
        return 0.0_f64;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    3.0_f64 * (mean(values) - median_sorted(&sorted)) / sd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_one_to_hundred() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((percentile_sorted(&sorted, 50.0) - 50.5).abs() < 1e-9);
        assert!((percentile_sorted(&sorted, 25.0) - 25.75).abs() < 1e-9);
        assert!((percentile_sorted(&sorted, 99.0) - 99.01).abs() < 1e-9);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert!((median_sorted(&[1.0, 2.0, 3.0]) - 2.0).abs() < f64::EPSILON);
        assert!((median_sorted(&[1.0, 2.0, 3.0, 4.0]) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_std_dev_degenerate() {
        assert!(std_dev(&[]).abs() < f64::EPSILON);
        assert!(std_dev(&[5.0]).abs() < f64::EPSILON);
        // Population stddev of {2, 4} is 1
        assert!((std_dev(&[2.0, 4.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_regression_perfect_line() {
        let xs: Vec<f64> = (0..10).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let fit = linear_regression(&xs, &ys).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_sign() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        let c = [8.0, 6.0, 4.0, 2.0];
        assert!((correlation(&a, &b).unwrap() - 1.0).abs() < 1e-9);
        assert!((correlation(&a, &c).unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mode_prefers_most_frequent() {
        assert_eq!(mode(&[1.0, 2.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(mode(&[]), None);
    }
}
