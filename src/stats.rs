//! Shared numeric helpers for the grid and the robust statistics of the fitter.

use ndarray::Array1;
use statrs::statistics::{Data, OrderStatistics, Statistics};

/// Scale factor turning a median absolute deviation into a normal-consistent spread.
pub const MAD_SCALE: f64 = 1.4826;

/// `ln(Σ exp(x))` without overflow; `-inf` for an empty or all `-inf` input.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Turn log weights into probabilities summing to one.
///
/// Returns `None` if no entry is finite, which callers treat as a numeric underflow.
pub fn normalize_log_weights(log_weights: &Array1<f64>) -> Option<Array1<f64>> {
    if log_weights.iter().any(|v| v.is_nan()) {
        return None;
    }
    let lse = log_sum_exp(log_weights.as_slice()?);
    if !lse.is_finite() {
        return None;
    }
    let probs = log_weights.mapv(|v| (v - lse).exp());
    let total = probs.sum();
    if !(total > 0.0) || !total.is_finite() {
        return None;
    }
    Some(probs / total)
}

/// Rescale non-negative weights to sum to one, `None` if they carry no mass.
pub fn normalize_weights(weights: &Array1<f64>) -> Option<Array1<f64>> {
    let total = weights.sum();
    if !(total > 0.0) || !total.is_finite() || weights.iter().any(|&w| w < 0.0) {
        return None;
    }
    Some(weights / total)
}

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().cloned().filter(|v| !v.is_nan()).collect()
}

pub fn median(values: &[f64]) -> Option<f64> {
    let values = finite(values);
    if values.is_empty() {
        return None;
    }
    Some(OrderStatistics::median(&mut Data::new(values)))
}

/// Median absolute deviation around `center`, unscaled.
pub fn mad(values: &[f64], center: f64) -> Option<f64> {
    let deviations: Vec<f64> = values.iter().map(|&v| (v - center).abs()).collect();
    median(&deviations)
}

/// Approximately median-unbiased sample quantile (R type 8).
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let values = finite(values);
    if values.is_empty() {
        return None;
    }
    Some(Data::new(values).quantile(q.clamp(0.0, 1.0)))
}

/// Sample mean and standard deviation (n - 1 denominator).
pub fn mean_and_sd(values: &[f64]) -> (f64, f64) {
    match values.len() {
        0 => (f64::NAN, f64::NAN),
        1 => (values[0], 0.0),
        _ => (values.mean(), values.std_dev()),
    }
}

pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Smooth equally spaced bins with a truncated Gaussian kernel, `bandwidth` in bins.
pub fn gaussian_smooth(bins: &Array1<f64>, bandwidth: f64) -> Array1<f64> {
    if bandwidth <= 0.0 {
        return bins.clone();
    }
    let reach = (4.0 * bandwidth).ceil() as isize;
    let kernel: Vec<f64> = (-reach..=reach)
        .map(|k| (-0.5 * (k as f64 / bandwidth).powi(2)).exp())
        .collect();
    let n = bins.len() as isize;

    Array1::from_shape_fn(bins.len(), |i| {
        let mut acc = 0.0;
        let mut norm = 0.0;
        for (offset, &w) in (-reach..=reach).zip(kernel.iter()) {
            let j = i as isize + offset;
            if j >= 0 && j < n {
                acc += w * bins[j as usize];
                norm += w;
            }
        }
        if norm > 0.0 { acc / norm } else { 0.0 }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_log_sum_exp() {
        assert_abs_diff_eq!(log_sum_exp(&[0.0, 0.0]), 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(log_sum_exp(&[-1000.0, -1000.0]), -1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_normalize_log_weights() {
        let probs = normalize_log_weights(&array![-2000.0, -2000.0 + 3f64.ln()]).unwrap();
        assert_abs_diff_eq!(probs[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(probs[1], 0.75, epsilon = 1e-12);
        assert!(normalize_log_weights(&array![f64::NEG_INFINITY, f64::NEG_INFINITY]).is_none());
        assert!(normalize_log_weights(&array![0.0, f64::NAN]).is_none());
    }

    #[test]
    fn test_robust_location() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        assert_eq!(mad(&[1.0, 2.0, 3.0, 4.0, 100.0], 3.0), Some(1.0));
        assert_abs_diff_eq!(quantile(&[0.0, 10.0, 20.0, 30.0, 40.0], 0.5).unwrap(), 20.0, epsilon = 1e-12);
        assert_eq!(quantile(&[5.0, 1.0, 3.0], 1.0), Some(5.0));
        assert_eq!(quantile(&[f64::NAN], 0.5), None);
    }

    #[test]
    fn test_mean_and_sd() {
        let (mean, sd) = mean_and_sd(&[1.0, 2.0, 3.0, 4.0]);
        assert_abs_diff_eq!(mean, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(sd, (5.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(mean_and_sd(&[7.0]), (7.0, 0.0));
        assert!(mean_and_sd(&[]).0.is_nan());
    }

    #[test]
    fn test_gaussian_smooth_preserves_flat_profile() {
        let bins = Array1::from_elem(20, 0.5);
        let smoothed = gaussian_smooth(&bins, 2.0);
        for v in smoothed.iter() {
            assert_abs_diff_eq!(*v, 0.5, epsilon = 1e-12);
        }
    }
}
