//! Fold-change posteriors and their batch marginalization.
//!
//! The fold-change axis has `2G - 1` points `d_k = k · Δ · log2(10)`, `k = -(G-1)..(G-1)`,
//! where `Δ` is the prior grid step in log10 units. Index `G - 1` is the zero difference.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{MagnitudePosterior, first_max};
use crate::error::ScdeError;
use crate::prior::ExpressionPrior;
use crate::stats::normalize_weights;

/// Kernel entries below this fraction of the kernel maximum are skipped in convolutions.
const KERNEL_CUTOFF: f64 = 1e-14;

/// Posterior over log2 fold changes of group A relative to group B.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldChangePosterior {
    values: Array1<f64>,
    weights: Array1<f64>,
}

impl FoldChangePosterior {
    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Log2 fold change of the first maximum.
    pub fn mode(&self) -> f64 {
        self.values[first_max(&self.weights)]
    }

    pub fn mean(&self) -> f64 {
        self.weights.dot(&self.values)
    }

    pub fn sd(&self) -> f64 {
        let mean = self.mean();
        self.weights
            .iter()
            .zip(self.values.iter())
            .map(|(&w, &d)| w * (d - mean).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Highest-density interval: the narrowest contiguous run of axis points holding at least
    /// `mass`, the lowest such run on ties. Returns `(lower, upper)` in log2 units.
    pub fn hdi(&self, mass: f64) -> (f64, f64) {
        let n = self.weights.len();
        let target = mass - 1e-12;
        let mut best = (0, n - 1);
        let mut end = 0;
        let mut acc = 0.0;
        for start in 0..n {
            while end < n && acc < target {
                acc += self.weights[end];
                end += 1;
            }
            if acc < target {
                break;
            }
            if end - 1 - start < best.1 - best.0 {
                best = (start, end - 1);
            }
            acc -= self.weights[start];
        }
        (self.values[best.0], self.values[best.1])
    }

    /// The fold change of B relative to A.
    pub fn mirrored(&self) -> Self {
        FoldChangePosterior {
            values: self.values.clone(),
            weights: self.weights.iter().rev().cloned().collect(),
        }
    }

    /// `(P(d) + P(-d)) / 2`
    pub fn symmetrized(&self) -> Self {
        let mirrored = self.mirrored();
        FoldChangePosterior {
            values: self.values.clone(),
            weights: (&self.weights + &mirrored.weights) * 0.5,
        }
    }
}

/// `lower` when the interval lies above zero, `upper` when it lies below, otherwise 0.
pub fn conservative_estimate(lower: f64, upper: f64) -> f64 {
    if lower > 0.0 {
        lower
    } else if upper < 0.0 {
        upper
    } else {
        0.0
    }
}

/// Log2 fold-change axis for a prior grid.
pub fn fold_change_axis(prior: &ExpressionPrior) -> Array1<f64> {
    let g = prior.len() as isize;
    let step = prior.log2_step();
    Array1::from_iter((-(g - 1)..g).map(|k| k as f64 * step))
}

/// Fold change of A relative to B: `P(k) = Σ_i A(i + k) · B(i)`.
pub fn fold_change_posterior(
    a: &MagnitudePosterior,
    b: &MagnitudePosterior,
    prior: &ExpressionPrior,
) -> Result<FoldChangePosterior, ScdeError> {
    let g = prior.len();
    if a.len() != g || b.len() != g {
        return Err(ScdeError::invalid_input(format!(
            "posteriors of length {} and {} do not match a grid of {} points",
            a.len(),
            b.len(),
            g
        )));
    }
    let (wa, wb) = (a.weights(), b.weights());
    let mut weights = Array1::<f64>::zeros(2 * g - 1);
    for (i, &bi) in wb.iter().enumerate() {
        if bi == 0.0 {
            continue;
        }
        // A at j contributes to k = j - i, stored at j - i + g - 1
        for (j, &aj) in wa.iter().enumerate() {
            weights[j + g - 1 - i] += aj * bi;
        }
    }
    let weights = normalize_weights(&weights).ok_or_else(|| ScdeError::NumericUnderflow {
        context: "fold-change posterior".to_string(),
    })?;
    Ok(FoldChangePosterior {
        values: fold_change_axis(prior),
        weights,
    })
}

/// Posterior mean log2 fold change without building the full posterior.
///
/// The mean of the cross-correlation is the difference of the two group means.
pub fn mean_fold_change(a: &MagnitudePosterior, b: &MagnitudePosterior, prior: &ExpressionPrior) -> f64 {
    (a.mean_log10(prior) - b.mean_log10(prior)) * std::f64::consts::LOG2_10
}

/// Mean of the batch-marginalized fold change, shrunk by the spread the marginalization added.
///
/// Symmetric kernels leave the mean in place, so the mean alone cannot tell a confounded design
/// from a balanced one. Scaling by `sd(uncorrected) / sd(corrected)` keeps the statistic equal to
/// the plain mean when nothing was added and pulls it towards 0 as batch uncertainty grows.
pub fn batch_adjusted_mean(uncorrected: &FoldChangePosterior, corrected: &FoldChangePosterior) -> f64 {
    let (sd_u, sd_c) = (uncorrected.sd(), corrected.sd());
    if !(sd_u > 0.0) || !(sd_c > 0.0) {
        return corrected.mean();
    }
    corrected.mean() * (sd_u / sd_c).min(1.0)
}

/// No-difference kernel of one batch level.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLevel {
    pub level: usize,
    /// Share of the compared cells in this level
    pub share: f64,
    /// Symmetrized fold change of the level against all other compared cells
    pub kernel: FoldChangePosterior,
}

/// Total-variation distance between the batch compositions of two cell sets.
pub fn composition_imbalance(batches_a: &[usize], batches_b: &[usize]) -> f64 {
    if batches_a.is_empty() || batches_b.is_empty() {
        return 0.0;
    }
    let levels = batches_a.iter().chain(batches_b.iter()).copied().max().unwrap_or(0) + 1;
    let mut share_a = vec![0.0; levels];
    let mut share_b = vec![0.0; levels];
    for &b in batches_a {
        share_a[b] += 1.0 / batches_a.len() as f64;
    }
    for &b in batches_b {
        share_b[b] += 1.0 / batches_b.len() as f64;
    }
    0.5 * share_a.iter().zip(share_b.iter()).map(|(a, b)| (a - b).abs()).sum::<f64>()
}

/// Combined kernel `(1 - ρ)·δ₀ + ρ·Σ π_b K_b` with the shares renormalized over `levels`.
fn combined_kernel(levels: &[BatchLevel], imbalance: f64, len: usize) -> Array1<f64> {
    let center = len / 2;
    let mut kernel = Array1::<f64>::zeros(len);
    let total_share: f64 = levels.iter().map(|l| l.share).sum();
    let rho = if total_share > 0.0 { imbalance.clamp(0.0, 1.0) } else { 0.0 };
    kernel[center] = 1.0 - rho;
    if rho > 0.0 {
        for level in levels {
            kernel.scaled_add(rho * level.share / total_share, level.kernel.weights());
        }
    }
    kernel
}

/// Fold change convolved with the batch no-difference kernels, truncated to the axis and
/// renormalized.
///
/// With `imbalance` 0 (identical batch compositions) the input comes back unchanged. The
/// kernels are symmetric, so the correction widens the posterior without shifting it.
pub fn batch_marginalized(
    fold_change: &FoldChangePosterior,
    levels: &[BatchLevel],
    imbalance: f64,
) -> Result<FoldChangePosterior, ScdeError> {
    let len = fold_change.len();
    if let Some(level) = levels.iter().find(|l| l.kernel.len() != len) {
        return Err(ScdeError::invalid_input(format!(
            "batch kernel of level {} has {} points, expected {}",
            level.level,
            level.kernel.len(),
            len
        )));
    }
    if levels.is_empty() || imbalance <= 0.0 {
        return Ok(fold_change.clone());
    }

    let kernel = combined_kernel(levels, imbalance, len);
    let center = (len / 2) as isize;
    let cutoff = kernel.iter().cloned().fold(0.0, f64::max) * KERNEL_CUTOFF;
    let source = fold_change.weights();
    let mut weights = Array1::<f64>::zeros(len);
    for (m, &km) in kernel.iter().enumerate() {
        if km <= cutoff {
            continue;
        }
        let offset = m as isize - center;
        for j in 0..len as isize {
            let from = j - offset;
            if from >= 0 && (from as usize) < len {
                weights[j as usize] += km * source[from as usize];
            }
        }
    }
    let weights = normalize_weights(&weights).ok_or_else(|| ScdeError::NumericUnderflow {
        context: "batch-marginalized fold-change posterior".to_string(),
    })?;
    Ok(FoldChangePosterior {
        values: fold_change.values.clone(),
        weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitting::{ErrorModel, ErrorModelTable};
    use crate::posterior::group_posterior;
    use approx::assert_abs_diff_eq;

    fn posteriors() -> (MagnitudePosterior, MagnitudePosterior, ExpressionPrior) {
        let prior = ExpressionPrior::uniform(3.0, 40).unwrap();
        let models = ErrorModelTable::new(
            (0..6)
                .map(|c| ErrorModel::new(format!("c{}", c), 1.0, 0.0, -3.0, 0.0, 0.1, 0.05))
                .collect(),
        );
        let counts = [40u64, 55, 38, 9, 12, 7];
        let a = group_posterior(&counts, &[0, 1, 2], &models, &prior).unwrap();
        let b = group_posterior(&counts, &[3, 4, 5], &models, &prior).unwrap();
        (a, b, prior)
    }

    #[test]
    fn test_fold_change_is_normalized_and_positive() {
        let (a, b, prior) = posteriors();
        let fc = fold_change_posterior(&a, &b, &prior).unwrap();
        assert_eq!(fc.len(), 2 * prior.len() - 1);
        assert_abs_diff_eq!(fc.weights().sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fc.values()[prior.len() - 1], 0.0, epsilon = 1e-12);
        assert!(fc.mode() > 0.0);
        assert!(fc.mean() > 0.0);
    }

    #[test]
    fn test_antisymmetry() {
        let (a, b, prior) = posteriors();
        let ab = fold_change_posterior(&a, &b, &prior).unwrap();
        let ba = fold_change_posterior(&b, &a, &prior).unwrap();
        let n = ab.len();
        for k in 0..n {
            assert_abs_diff_eq!(ab.weights()[k], ba.weights()[n - 1 - k], epsilon = 1e-12);
        }
        assert_abs_diff_eq!(ab.mean(), -ba.mean(), epsilon = 1e-10);
        assert_abs_diff_eq!(ab.mirrored().mode(), ba.mode(), epsilon = 1e-12);
    }

    #[test]
    fn test_mean_shortcut_matches_full_posterior() {
        let (a, b, prior) = posteriors();
        let fc = fold_change_posterior(&a, &b, &prior).unwrap();
        assert_abs_diff_eq!(mean_fold_change(&a, &b, &prior), fc.mean(), epsilon = 1e-10);
    }

    #[test]
    fn test_hdi_and_conservative_estimate() {
        let fc = FoldChangePosterior {
            values: Array1::from_vec(vec![-2.0, -1.0, 0.0, 1.0, 2.0, 3.0]),
            weights: Array1::from_vec(vec![0.0, 0.01, 0.02, 0.5, 0.45, 0.02]),
        };
        let (lower, upper) = fc.hdi(0.95);
        assert_eq!((lower, upper), (1.0, 2.0));
        assert_eq!(conservative_estimate(lower, upper), 1.0);
        assert_eq!(conservative_estimate(-3.0, -0.5), -0.5);
        assert_eq!(conservative_estimate(-0.5, 0.5), 0.0);

        // equal widths resolve to the lowest start
        let flat = FoldChangePosterior {
            values: Array1::from_vec(vec![0.0, 1.0, 2.0, 3.0]),
            weights: Array1::from_vec(vec![0.25, 0.25, 0.25, 0.25]),
        };
        assert_eq!(flat.hdi(0.5), (0.0, 1.0));
    }

    #[test]
    fn test_composition_imbalance() {
        assert_abs_diff_eq!(composition_imbalance(&[0, 1, 0, 1], &[1, 0]), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(composition_imbalance(&[0, 0], &[1, 1, 1]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(composition_imbalance(&[0, 0, 0, 1], &[0, 1]), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_batch_marginalization_widens_without_shifting() {
        let (a, b, prior) = posteriors();
        let fc = fold_change_posterior(&a, &b, &prior).unwrap();
        let kernel = fold_change_posterior(&a, &a, &prior).unwrap().symmetrized();
        let levels = vec![
            BatchLevel {
                level: 0,
                share: 0.5,
                kernel: kernel.clone(),
            },
            BatchLevel {
                level: 1,
                share: 0.5,
                kernel,
            },
        ];

        let unchanged = batch_marginalized(&fc, &levels, 0.0).unwrap();
        assert_eq!(unchanged, fc);

        let corrected = batch_marginalized(&fc, &levels, 1.0).unwrap();
        assert_abs_diff_eq!(corrected.weights().sum(), 1.0, epsilon = 1e-12);
        assert!(corrected.sd() > fc.sd());
        assert!(corrected.mode() > 0.0);
        assert_abs_diff_eq!(corrected.mean(), fc.mean(), epsilon = 1e-3);
    }

    #[test]
    fn test_batch_adjusted_mean_tracks_added_spread() {
        let (a, b, prior) = posteriors();
        let fc = fold_change_posterior(&a, &b, &prior).unwrap();
        let kernel = fold_change_posterior(&a, &b, &prior).unwrap().symmetrized();
        let levels = vec![BatchLevel {
            level: 0,
            share: 1.0,
            kernel,
        }];

        assert_eq!(batch_adjusted_mean(&fc, &fc), fc.mean());

        let mut previous = fc.mean();
        for imbalance in [0.25, 0.5, 1.0] {
            let corrected = batch_marginalized(&fc, &levels, imbalance).unwrap();
            let adjusted = batch_adjusted_mean(&fc, &corrected);
            assert!(adjusted > 0.0);
            assert!(adjusted < previous);
            assert_abs_diff_eq!(adjusted, corrected.mean() * fc.sd() / corrected.sd(), epsilon = 1e-12);
            previous = adjusted;
        }
    }
}
