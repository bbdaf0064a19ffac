//! Discretized expression-magnitude prior.
//!
//! The grid runs from 0 (not expressed) to an upper bound in equally spaced log10 steps.
//! Magnitudes are kept in both scales: `log_magnitudes` (log10 units, used for fold changes)
//! and `magnitudes` (natural-log units, the scale of the error models).

use std::f64::consts::LN_10;

use log::{debug, info};
use nalgebra_sparse::CsrMatrix;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use crate::config::ScdeConfig;
use crate::counts::validate_counts;
use crate::error::ScdeError;
use crate::fitting::ErrorModelTable;
use crate::stats::{gaussian_smooth, normalize_weights, quantile};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
const SPACING_TOLERANCE: f64 = 1e-9;

/// Immutable prior over the expression grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PriorRecord", into = "PriorRecord")]
pub struct ExpressionPrior {
    log_magnitudes: Array1<f64>,
    magnitudes: Array1<f64>,
    weights: Array1<f64>,
    step: f64,
}

#[derive(Serialize, Deserialize)]
struct PriorRecord {
    log_magnitudes: Vec<f64>,
    weights: Vec<f64>,
}

impl TryFrom<PriorRecord> for ExpressionPrior {
    type Error = ScdeError;

    fn try_from(record: PriorRecord) -> Result<Self, Self::Error> {
        ExpressionPrior::new(
            Array1::from_vec(record.log_magnitudes),
            Array1::from_vec(record.weights),
        )
    }
}

impl From<ExpressionPrior> for PriorRecord {
    fn from(prior: ExpressionPrior) -> Self {
        PriorRecord {
            log_magnitudes: prior.log_magnitudes.to_vec(),
            weights: prior.weights.to_vec(),
        }
    }
}

impl ExpressionPrior {
    /// Build a prior from a log10 grid and its weights, checking the invariants.
    ///
    /// The grid must hold at least two strictly increasing, equally spaced points; weights
    /// must be finite, non-negative and sum to one (small rounding is renormalized away).
    pub fn new(log_magnitudes: Array1<f64>, weights: Array1<f64>) -> Result<Self, ScdeError> {
        let n = log_magnitudes.len();
        if n < 2 {
            return Err(ScdeError::degenerate_grid(format!("grid has {} points, need at least 2", n)));
        }
        if weights.len() != n {
            return Err(ScdeError::invalid_input(format!(
                "prior has {} grid points but {} weights",
                n,
                weights.len()
            )));
        }
        if log_magnitudes.iter().any(|v| !v.is_finite()) {
            return Err(ScdeError::degenerate_grid("grid contains non-finite magnitudes"));
        }
        let step = (log_magnitudes[n - 1] - log_magnitudes[0]) / (n - 1) as f64;
        if !(step > 0.0) {
            return Err(ScdeError::degenerate_grid("grid span is not positive"));
        }
        for i in 1..n {
            let gap = log_magnitudes[i] - log_magnitudes[i - 1];
            if (gap - step).abs() > SPACING_TOLERANCE * step.max(1.0) {
                return Err(ScdeError::degenerate_grid(format!(
                    "grid is not equally spaced at point {}",
                    i
                )));
            }
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ScdeError::invalid_input("prior weights must be finite and non-negative"));
        }
        let total = weights.sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ScdeError::invalid_input(format!("prior weights sum to {}, not 1", total)));
        }
        let weights = weights / total;

        Ok(ExpressionPrior {
            magnitudes: log_magnitudes.mapv(|u| u * LN_10),
            log_magnitudes,
            weights,
            step,
        })
    }

    /// Flat prior on `length_out` points from 0 to `max_log10`.
    pub fn uniform(max_log10: f64, length_out: usize) -> Result<Self, ScdeError> {
        if length_out < 2 {
            return Err(ScdeError::degenerate_grid(format!(
                "grid has {} points, need at least 2",
                length_out
            )));
        }
        let grid = Array1::linspace(0.0, max_log10, length_out);
        let weights = Array1::from_elem(length_out, 1.0 / length_out as f64);
        ExpressionPrior::new(grid, weights)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Grid points in log10 units.
    pub fn log_magnitudes(&self) -> &Array1<f64> {
        &self.log_magnitudes
    }

    /// Grid points in natural-log units, as seen by the error models.
    pub fn magnitudes(&self) -> &Array1<f64> {
        &self.magnitudes
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn ln_weights(&self) -> Array1<f64> {
        self.weights.mapv(f64::ln)
    }

    /// Grid step in log10 units.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Grid step expressed as a log2 ratio, the spacing of the fold-change axis.
    pub fn log2_step(&self) -> f64 {
        self.step * std::f64::consts::LOG2_10
    }
}

/// Magnitudes (log10 units) implied by inverting every valid model on its nonzero counts.
pub fn implied_magnitudes<T>(matrix: &CsrMatrix<T>, models: &ErrorModelTable) -> Vec<f64>
where
    T: FloatOpsTS,
{
    matrix
        .triplet_iter()
        .filter_map(|(_, cell, value)| {
            let y = value.to_f64()?.round();
            if y < 1.0 {
                return None;
            }
            models.get(cell).implied_magnitude(y as u64)
        })
        .map(|x| x / LN_10)
        .collect()
}

/// Build the expression prior from the fitted error models.
///
/// # Arguments
///
/// * `matrix` - Count matrix (genes × cells)
/// * `models` - Error models in column order; invalid models contribute nothing
/// * `config` - Uses `max_value`, `length_out`, `prior_quantile`, `prior_bandwidth` and
///   `prior_pseudocount`
pub fn build_prior<T>(
    matrix: &CsrMatrix<T>,
    models: &ErrorModelTable,
    config: &ScdeConfig,
) -> anyhow::Result<ExpressionPrior>
where
    T: FloatOpsTS,
{
    config.validate()?;
    validate_counts(matrix)?;
    models.check_cells(matrix.ncols())?;
    if models.n_valid() == 0 {
        return Err(ScdeError::degenerate_grid("no cell has a valid error model").into());
    }

    let implied = implied_magnitudes(matrix, models);
    let mut distinct = implied.clone();
    distinct.sort_by(|a, b| a.total_cmp(b));
    distinct.dedup();
    if distinct.len() < 2 {
        return Err(ScdeError::degenerate_grid(format!(
            "{} distinct implied magnitudes, need at least 2",
            distinct.len()
        ))
        .into());
    }

    let upper = match config.max_value {
        Some(max_value) => (max_value + 1.0).log10(),
        None => quantile(&implied, config.prior_quantile).unwrap_or(0.0),
    };
    if !(upper > 0.0) || !upper.is_finite() {
        return Err(ScdeError::degenerate_grid(format!("grid upper bound {} is not positive", upper)).into());
    }

    let length = config.length_out;
    let step = upper / (length - 1) as f64;
    let mut histogram = Array1::<f64>::zeros(length);
    let mut outside = 0usize;
    for &u in implied.iter() {
        let bin = (u / step).round() as usize;
        if bin < length {
            histogram[bin] += 1.0;
        } else {
            outside += 1;
        }
    }
    if outside > 0 {
        debug!("{} implied magnitudes lie above the grid and are ignored", outside);
    }

    let mut smoothed = gaussian_smooth(&histogram, config.prior_bandwidth);
    let mean_mass = smoothed.mean().unwrap_or(0.0);
    let pseudocount = if mean_mass > 0.0 {
        config.prior_pseudocount * mean_mass
    } else {
        1.0
    };
    smoothed.mapv_inplace(|w| w + pseudocount);
    let weights = normalize_weights(&smoothed)
        .ok_or_else(|| ScdeError::degenerate_grid("prior weights carry no mass"))?;

    let grid = Array1::linspace(0.0, upper, length);
    let prior = ExpressionPrior::new(grid, weights)?;
    if config.logs_progress() {
        info!(
            "Prior over {} points up to log10 magnitude {:.3} from {} implied magnitudes",
            prior.len(),
            upper,
            implied.len()
        );
    }
    Ok(prior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitting::ErrorModel;
    use approx::assert_abs_diff_eq;
    use nalgebra_sparse::CooMatrix;

    fn matrix(values: &[[f64; 3]]) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(values.len(), 3);
        for (gene, row) in values.iter().enumerate() {
            for (cell, &v) in row.iter().enumerate() {
                if v > 0.0 {
                    coo.push(gene, cell, v);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    fn identity_models() -> ErrorModelTable {
        ErrorModelTable::new(
            (0..3)
                .map(|c| ErrorModel::new(format!("c{}", c), 1.0, 0.0, -1.0, 0.0, 0.1, 0.05))
                .collect(),
        )
    }

    #[test]
    fn test_prior_is_normalized() {
        let counts = matrix(&[[1.0, 5.0, 20.0], [100.0, 3.0, 0.0], [7.0, 0.0, 50.0]]);
        let config = ScdeConfig::default().with_length_out(50);
        let prior = build_prior(&counts, &identity_models(), &config).unwrap();

        assert_eq!(prior.len(), 50);
        assert_abs_diff_eq!(prior.weights().sum(), 1.0, epsilon = 1e-12);
        assert!(prior.weights().iter().all(|&w| w > 0.0));
        assert_eq!(prior.log_magnitudes()[0], 0.0);
        assert_abs_diff_eq!(prior.magnitudes()[49], prior.log_magnitudes()[49] * LN_10, epsilon = 1e-12);
    }

    #[test]
    fn test_max_value_sets_upper_bound() {
        let counts = matrix(&[[1.0, 5.0, 20.0], [100.0, 3.0, 0.0], [7.0, 0.0, 50.0]]);
        let config = ScdeConfig::default().with_length_out(11).with_max_value(999.0);
        let prior = build_prior(&counts, &identity_models(), &config).unwrap();
        assert_abs_diff_eq!(prior.log_magnitudes()[10], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prior.step(), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_magnitudes() {
        let counts = matrix(&[[4.0, 4.0, 4.0], [0.0, 0.0, 0.0]]);
        let err = build_prior(&counts, &identity_models(), &ScdeConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScdeError>(),
            Some(ScdeError::DegenerateGrid { .. })
        ));

        let invalid = ErrorModelTable::new((0..3).map(|c| ErrorModel::failed(format!("c{}", c), None, "x")).collect());
        let counts = matrix(&[[1.0, 5.0, 20.0]]);
        assert!(build_prior(&counts, &invalid, &ScdeConfig::default()).is_err());
    }

    #[test]
    fn test_new_checks_invariants() {
        assert!(ExpressionPrior::new(Array1::from_vec(vec![0.0]), Array1::from_vec(vec![1.0])).is_err());
        assert!(ExpressionPrior::new(
            Array1::from_vec(vec![0.0, 0.1, 0.3]),
            Array1::from_vec(vec![0.2, 0.3, 0.5])
        )
        .is_err());
        assert!(ExpressionPrior::new(
            Array1::from_vec(vec![0.0, 0.1, 0.2]),
            Array1::from_vec(vec![0.2, 0.3, 0.6])
        )
        .is_err());
        let prior = ExpressionPrior::uniform(2.0, 5).unwrap();
        assert_abs_diff_eq!(prior.step(), 0.5, epsilon = 1e-12);
    }
}
