//! Per-cell error models.
//!
//! Every cell gets a negative binomial + Poisson background mixture describing how its
//! observed counts relate to the latent expression magnitude `x` (natural-log scale,
//! `x = ln(1 + expression)`):
//!
//! - the **corr** relation `ln μ(x) = corr_intercept + corr_slope · x` gives the NB mean,
//! - the **conc** relation `logit π(x) = conc_intercept + conc_slope · x` gives the
//!   probability that the observation comes from the background (dropout) component,
//! - `nb_overdispersion` is `φ` in `Var = μ + φ μ²`,
//! - `poisson_fail_rate` is the rate of the background Poisson component.
//!
//! Models are fitted per fitting group against the group's robust genes (see [`robust`]),
//! using a peer consensus for the reference magnitudes (see [`consensus`]) and EM for the
//! mixture (see [`mixture`]).

pub mod consensus;
pub mod mixture;
pub mod robust;

use log::{debug, info, warn};
use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use crate::config::ScdeConfig;
use crate::counts::{dense_rows, library_sizes, validate_counts};
use crate::error::ScdeError;
use crate::labels::CellLabels;
use crate::posterior::likelihood::ln_mixture_pmf;
use crate::stats::logistic;
use consensus::GroupBlock;
use mixture::{MixtureFit, MixtureOptions, fit_mixture};
use robust::robust_genes_for_group;

/// Outcome of a cell's fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitStatus {
    Valid,
    Failed { reason: String },
}

/// Non-finite parameters of failed fits are written as `null` and read back as NaN.
mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Error model of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorModel {
    pub cell: String,
    #[serde(with = "nullable_f64")]
    pub corr_slope: f64,
    #[serde(with = "nullable_f64")]
    pub corr_intercept: f64,
    #[serde(with = "nullable_f64")]
    pub conc_slope: f64,
    #[serde(with = "nullable_f64")]
    pub conc_intercept: f64,
    #[serde(with = "nullable_f64")]
    pub nb_overdispersion: f64,
    #[serde(with = "nullable_f64")]
    pub poisson_fail_rate: f64,
    /// Fitting group the model was estimated in
    pub fit_group: Option<String>,
    pub iterations: usize,
    pub converged: bool,
    pub status: FitStatus,
}

impl ErrorModel {
    /// A valid model with the given parameters, e.g. for simulation or externally fitted values.
    pub fn new(
        cell: impl Into<String>,
        corr_slope: f64,
        corr_intercept: f64,
        conc_slope: f64,
        conc_intercept: f64,
        nb_overdispersion: f64,
        poisson_fail_rate: f64,
    ) -> Self {
        ErrorModel {
            cell: cell.into(),
            corr_slope,
            corr_intercept,
            conc_slope,
            conc_intercept,
            nb_overdispersion,
            poisson_fail_rate,
            fit_group: None,
            iterations: 0,
            converged: true,
            status: FitStatus::Valid,
        }
    }

    /// An invalid record; parameters are NaN so they can never be used by accident.
    pub fn failed(cell: impl Into<String>, fit_group: Option<String>, reason: impl Into<String>) -> Self {
        ErrorModel {
            cell: cell.into(),
            corr_slope: f64::NAN,
            corr_intercept: f64::NAN,
            conc_slope: f64::NAN,
            conc_intercept: f64::NAN,
            nb_overdispersion: f64::NAN,
            poisson_fail_rate: f64::NAN,
            fit_group,
            iterations: 0,
            converged: false,
            status: FitStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    fn from_fit(cell: &str, fit_group: &str, fit: &MixtureFit) -> Self {
        let p = &fit.params;
        let mut model = ErrorModel::new(
            cell,
            p.corr_slope,
            p.corr_intercept,
            p.conc_slope,
            p.conc_intercept,
            p.nb_overdispersion,
            p.poisson_fail_rate,
        );
        model.fit_group = Some(fit_group.to_string());
        model.iterations = fit.iterations;
        model.converged = fit.converged;
        if !fit.converged {
            model.status = FitStatus::Failed {
                reason: format!("EM did not converge within {} iterations", fit.iterations),
            };
        } else if !(p.corr_slope > 0.0) {
            model.status = FitStatus::Failed {
                reason: format!("non-positive corr_slope {}", p.corr_slope),
            };
        }
        model
    }

    /// Usable downstream: fitted, converged, finite and with `corr_slope > 0`.
    pub fn is_valid(&self) -> bool {
        self.status == FitStatus::Valid
            && self.converged
            && self.corr_slope > 0.0
            && [
                self.corr_intercept,
                self.corr_slope,
                self.conc_intercept,
                self.conc_slope,
            ]
            .iter()
            .all(|v| v.is_finite())
            && self.nb_overdispersion > 0.0
            && self.nb_overdispersion.is_finite()
            && self.poisson_fail_rate > 0.0
            && self.poisson_fail_rate.is_finite()
    }

    /// The failure as an error value, `None` for valid models.
    pub fn failure(&self) -> Option<ScdeError> {
        if self.is_valid() {
            return None;
        }
        let reason = match &self.status {
            FitStatus::Failed { reason } => reason.clone(),
            FitStatus::Valid => "parameters outside the valid range".to_string(),
        };
        Some(ScdeError::ModelFitFailure {
            cell: self.cell.clone(),
            reason,
        })
    }

    pub fn nb_mean(&self, x: f64) -> f64 {
        (self.corr_intercept + self.corr_slope * x).exp()
    }

    pub fn fail_probability(&self, x: f64) -> f64 {
        logistic(self.conc_intercept + self.conc_slope * x)
    }

    /// Log-likelihood of observing `y` at magnitude `x`.
    pub fn ln_likelihood(&self, y: u64, x: f64) -> f64 {
        ln_mixture_pmf(
            y,
            self.nb_mean(x),
            self.nb_overdispersion,
            self.fail_probability(x),
            self.poisson_fail_rate,
        )
    }

    /// Log-likelihood of `y` at every grid magnitude.
    pub fn ln_likelihood_profile(&self, y: u64, grid: &Array1<f64>) -> Array1<f64> {
        grid.mapv(|x| self.ln_likelihood(y, x))
    }

    /// Magnitude whose NB mean equals a nonzero count, floored at zero.
    pub fn implied_magnitude(&self, y: u64) -> Option<f64> {
        if y == 0 || !self.is_valid() {
            return None;
        }
        Some(((y as f64).ln() - self.corr_intercept) / self.corr_slope).map(|x| x.max(0.0))
    }
}

/// Error models of all cells, in count matrix column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorModelTable {
    models: Vec<ErrorModel>,
}

impl ErrorModelTable {
    pub fn new(models: Vec<ErrorModel>) -> Self {
        ErrorModelTable { models }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, cell: usize) -> &ErrorModel {
        &self.models[cell]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ErrorModel> {
        self.models.iter()
    }

    pub fn is_valid(&self, cell: usize) -> bool {
        self.models[cell].is_valid()
    }

    /// Indices of the cells with a usable model.
    pub fn valid_cells(&self) -> Vec<usize> {
        (0..self.models.len()).filter(|&c| self.models[c].is_valid()).collect()
    }

    pub fn n_valid(&self) -> usize {
        self.models.iter().filter(|m| m.is_valid()).count()
    }

    /// One `ModelFitFailure` per invalid cell, for auditing.
    pub fn failures(&self) -> Vec<ScdeError> {
        self.models.iter().filter_map(|m| m.failure()).collect()
    }

    pub(crate) fn check_cells(&self, n_cells: usize) -> Result<(), ScdeError> {
        if self.models.len() != n_cells {
            return Err(ScdeError::invalid_input(format!(
                "Error model table has {} entries but the count matrix has {} cells",
                self.models.len(),
                n_cells
            )));
        }
        Ok(())
    }
}

/// Fit one error model per cell.
///
/// Run-level problems (bad configuration, malformed input, a fitting group without enough
/// robust genes) abort before any cell is fitted. Individual cells that cannot be fitted
/// are returned as invalid records.
///
/// # Arguments
///
/// * `matrix` - Count matrix (genes × cells)
/// * `labels` - Cell names and group assignments
/// * `config` - Run configuration; `groups`, `threshold_segmentation`, `n_cores` and the
///   robust gene and fit tuning options are used
///
/// # Returns
///
/// `ErrorModelTable` with one entry per cell in column order.
pub fn fit_error_models<T>(
    matrix: &CsrMatrix<T>,
    labels: &CellLabels,
    config: &ScdeConfig,
) -> anyhow::Result<ErrorModelTable>
where
    T: FloatOpsTS,
{
    config.validate()?;
    validate_counts(matrix)?;
    labels.check_cells(matrix.ncols())?;

    let sizes = library_sizes(matrix);
    let groups = labels.fitting_groups(config.groups);
    if groups.is_empty() {
        return Err(ScdeError::invalid_input("No cell is assigned to a fitting group").into());
    }

    // Robust genes for every group first, so a failing group aborts before any fit
    let mut blocks = Vec::with_capacity(groups.len());
    for group in groups.iter() {
        let genes = robust_genes_for_group(matrix, group, &sizes, config)?;
        if config.logs_progress() {
            info!(
                "{}: {} cells, {} robust genes",
                group.label,
                group.cells.len(),
                genes.len()
            );
        }
        let rows = dense_rows(matrix, &genes);
        let block: Array2<f64> = rows.select(Axis(1), &group.cells);
        blocks.push(GroupBlock::new(block));
    }

    let options = MixtureOptions {
        max_iterations: config.max_fit_iterations,
        tolerance: config.fit_tolerance,
        fixed_rate: config.fixed_poisson_rate,
        segmentation_threshold: if config.threshold_segmentation {
            Some(config.segmentation_threshold)
        } else {
            None
        },
    };

    let jobs: Vec<(usize, usize)> = groups
        .iter()
        .enumerate()
        .flat_map(|(g, group)| (0..group.cells.len()).map(move |local| (g, local)))
        .collect();

    let pool = config.thread_pool()?;
    let fitted: Vec<(usize, ErrorModel)> = pool.install(|| {
        jobs.par_iter()
            .map(|&(g, local)| {
                let cell = groups[g].cells[local];
                let model = fit_cell(
                    &blocks[g],
                    local,
                    labels.name(cell),
                    &groups[g].label,
                    &options,
                    config.consensus_spread_floor,
                );
                (cell, model)
            })
            .collect()
    });

    // Reassemble by column index; cells outside every group stay unfitted
    let mut models: Vec<Option<ErrorModel>> = vec![None; matrix.ncols()];
    for (cell, model) in fitted {
        models[cell] = Some(model);
    }
    let models: Vec<ErrorModel> = models
        .into_iter()
        .enumerate()
        .map(|(cell, model)| {
            model.unwrap_or_else(|| ErrorModel::failed(labels.name(cell), None, "no fitting group"))
        })
        .collect();

    let table = ErrorModelTable::new(models);
    for failure in table.failures() {
        if config.logs_details() {
            warn!("{}", failure);
        } else {
            debug!("{}", failure);
        }
    }
    if config.logs_progress() {
        info!("{} of {} cells have valid error models", table.n_valid(), table.len());
    }
    Ok(table)
}

fn fit_cell(
    block: &GroupBlock,
    local: usize,
    cell: &str,
    group: &str,
    options: &MixtureOptions,
    spread_floor: f64,
) -> ErrorModel {
    let Some(reference) = block.reference_magnitudes(local, spread_floor) else {
        return ErrorModel::failed(cell, Some(group.to_string()), "no informative peer cells");
    };
    let observed = block.cell_counts(local);
    if observed.iter().all(|&y| y == 0.0) {
        return ErrorModel::failed(cell, Some(group.to_string()), "no counts on robust genes");
    }
    match fit_mixture(&observed, &reference, options) {
        Some(fit) => ErrorModel::from_fit(cell, group, &fit),
        None => ErrorModel::failed(cell, Some(group.to_string()), "singular regression in mixture fit"),
    }
}
