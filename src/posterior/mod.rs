//! Expression-magnitude posteriors over the prior grid.
//!
//! Cells are conditionally independent given the magnitude, so the joint posterior of a group
//! is the prior times the product of the cells' likelihoods. Everything is accumulated in log
//! space and only exponentiated once at the end.

pub mod foldchange;
pub mod likelihood;

use log::warn;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::ScdeError;
use crate::fitting::{ErrorModel, ErrorModelTable};
use crate::prior::ExpressionPrior;
use crate::stats::normalize_log_weights;

/// Normalized posterior over the grid points of an [`ExpressionPrior`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudePosterior {
    weights: Array1<f64>,
    /// Every likelihood underflowed and the prior was returned instead
    prior_only: bool,
}

impl MagnitudePosterior {
    fn from_prior(prior: &ExpressionPrior) -> Self {
        MagnitudePosterior {
            weights: prior.weights().clone(),
            prior_only: true,
        }
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

    pub fn is_prior_only(&self) -> bool {
        self.prior_only
    }

    /// Posterior mean in log10 units.
    pub fn mean_log10(&self, prior: &ExpressionPrior) -> f64 {
        self.weights.dot(prior.log_magnitudes())
    }

    /// Grid index of the (first) maximum.
    pub fn mode_index(&self) -> usize {
        first_max(&self.weights)
    }
}

pub(crate) fn first_max(weights: &Array1<f64>) -> usize {
    let mut best = 0;
    for (i, &w) in weights.iter().enumerate() {
        if w > weights[best] {
            best = i;
        }
    }
    best
}

/// Add log-likelihood rows onto the log prior, renormalizing after every row.
///
/// Returns `None` when nothing finite is left.
pub(crate) fn accumulate<'a, I>(ln_prior: &Array1<f64>, rows: I) -> Option<Array1<f64>>
where
    I: IntoIterator<Item = ArrayView1<'a, f64>>,
{
    let mut log_post = ln_prior.clone();
    for row in rows {
        log_post += &row;
        let max = log_post.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return None;
        }
        log_post.mapv_inplace(|v| v - max);
    }
    normalize_log_weights(&log_post)
}

/// Posterior of one cell's magnitude given its count of one gene.
///
/// When every grid likelihood underflows the prior is returned, flagged as `prior_only`.
pub fn cell_posterior(
    count: u64,
    model: &ErrorModel,
    prior: &ExpressionPrior,
) -> Result<MagnitudePosterior, ScdeError> {
    if let Some(failure) = model.failure() {
        return Err(ScdeError::invalid_input(format!(
            "Cell posterior requested for an invalid model: {}",
            failure
        )));
    }
    let row = model.ln_likelihood_profile(count, prior.magnitudes());
    match accumulate(&prior.ln_weights(), std::iter::once(row.view())) {
        Some(weights) => Ok(MagnitudePosterior {
            weights,
            prior_only: false,
        }),
        None => {
            warn!(
                "{}; falling back to the prior",
                ScdeError::NumericUnderflow {
                    context: format!("cell {} at count {}", model.cell, count),
                }
            );
            Ok(MagnitudePosterior::from_prior(prior))
        }
    }
}

/// Joint posterior of a set of cells sharing one magnitude.
///
/// # Arguments
///
/// * `counts` - Counts of the gene in every cell (column order)
/// * `cells` - Cells to combine; cells with an invalid model are skipped
/// * `models` - Error models in column order
/// * `prior` - Expression prior
pub fn group_posterior(
    counts: &[u64],
    cells: &[usize],
    models: &ErrorModelTable,
    prior: &ExpressionPrior,
) -> Result<MagnitudePosterior, ScdeError> {
    let likelihoods = GeneLikelihoods::new(counts, cells, models, prior)?;
    let all: Vec<usize> = (0..likelihoods.n_cells()).collect();
    likelihoods.joint(&all, prior)
}

/// Log-likelihood profiles of one gene for a fixed set of cells.
///
/// Computed once per gene and reused by every joint posterior over a subset of the cells,
/// which is what makes the randomization loop affordable.
#[derive(Debug, Clone)]
pub struct GeneLikelihoods {
    cells: Vec<usize>,
    rows: Array2<f64>,
}

impl GeneLikelihoods {
    /// Profiles of the given cells; cells without a valid model are left out.
    pub fn new(
        counts: &[u64],
        cells: &[usize],
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
    ) -> Result<Self, ScdeError> {
        if let Some(&c) = cells.iter().find(|&&c| c >= counts.len() || c >= models.len()) {
            return Err(ScdeError::invalid_input(format!("cell index {} is out of range", c)));
        }
        let kept: Vec<usize> = cells.iter().copied().filter(|&c| models.is_valid(c)).collect();
        if kept.is_empty() {
            return Err(ScdeError::invalid_input("No cell with a valid error model in the cell set"));
        }

        let mut rows = Array2::<f64>::zeros((kept.len(), prior.len()));
        for (k, &cell) in kept.iter().enumerate() {
            let profile = models.get(cell).ln_likelihood_profile(counts[cell], prior.magnitudes());
            rows.row_mut(k).assign(&profile);
        }
        Ok(GeneLikelihoods { cells: kept, rows })
    }

    /// Column indices of the retained cells.
    pub fn cells(&self) -> &[usize] {
        &self.cells
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Joint posterior over the retained cells at the given positions.
    pub fn joint(&self, positions: &[usize], prior: &ExpressionPrior) -> Result<MagnitudePosterior, ScdeError> {
        if positions.is_empty() {
            return Err(ScdeError::invalid_input("Joint posterior of an empty cell set"));
        }
        let rows = positions.iter().map(|&p| self.rows.row(p));
        match accumulate(&prior.ln_weights(), rows) {
            Some(weights) => Ok(MagnitudePosterior {
                weights,
                prior_only: false,
            }),
            None => {
                warn!(
                    "{}; falling back to the prior",
                    ScdeError::NumericUnderflow {
                        context: format!("joint posterior of {} cells", positions.len()),
                    }
                );
                Ok(MagnitudePosterior::from_prior(prior))
            }
        }
    }

    /// Per-cell posteriors of the retained cells.
    pub fn cell_posteriors(&self, prior: &ExpressionPrior) -> Result<Vec<MagnitudePosterior>, ScdeError> {
        (0..self.n_cells()).map(|p| self.joint(&[p], prior)).collect()
    }
}
