//! Randomization-calibrated differential expression across genes.
//!
//! For each gene the observed statistic is the posterior mean log2 fold change of group A
//! versus group B. The null comes from `n_randomizations` size-preserving relabelings of the
//! compared cells; `Z` standardizes the observed statistic against that gene's null only.
//! With batches, the same relabelings give the null of the batch-adjusted statistic: the mean of
//! the batch-marginalized fold change shrunk by the spread the marginalization added.

use log::{debug, info};
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use single_utilities::traits::FloatOpsTS;

use super::randomization::{NullSampler, randomization_z};
use super::{CancellationToken, DiffExpResult, DiffExpRow, DiffExpTable, GeneFailure, GenePosteriors};
use crate::config::ScdeConfig;
use crate::counts::{gene_counts, validate_counts};
use crate::error::ScdeError;
use crate::fitting::ErrorModelTable;
use crate::labels::CellLabels;
use crate::posterior::foldchange::{
    BatchLevel, FoldChangePosterior, batch_adjusted_mean, batch_marginalized, composition_imbalance,
    conservative_estimate, fold_change_posterior, mean_fold_change,
};
use crate::posterior::{GeneLikelihoods, MagnitudePosterior};
use crate::prior::ExpressionPrior;

/// Compared cells of a run, restricted to cells with a valid error model.
///
/// Positions `0..n_a` are group A, the rest group B.
#[derive(Debug, Clone)]
pub(crate) struct ComparisonPlan {
    pub group_a: usize,
    pub group_b: usize,
    pub cells: Vec<usize>,
    pub n_a: usize,
    /// Batch of every compared cell, when batch correction is requested
    pub batches: Option<Vec<usize>>,
}

impl ComparisonPlan {
    pub fn new(labels: &CellLabels, models: &ErrorModelTable) -> Result<Self, ScdeError> {
        let comparison = labels.comparison()?;
        let valid_a: Vec<usize> = comparison.cells_a.iter().copied().filter(|&c| models.is_valid(c)).collect();
        let valid_b: Vec<usize> = comparison.cells_b.iter().copied().filter(|&c| models.is_valid(c)).collect();
        for (group, valid) in [(comparison.group_a, &valid_a), (comparison.group_b, &valid_b)] {
            if valid.is_empty() {
                return Err(ScdeError::invalid_input(format!(
                    "Group {} has no cell with a valid error model",
                    group
                )));
            }
        }

        let n_a = valid_a.len();
        let cells: Vec<usize> = valid_a.into_iter().chain(valid_b).collect();
        let batches = labels
            .batches()
            .map(|batches| cells.iter().map(|&c| batches[c]).collect());
        Ok(ComparisonPlan {
            group_a: comparison.group_a,
            group_b: comparison.group_b,
            cells,
            n_a,
            batches,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn positions_a(&self) -> Vec<usize> {
        (0..self.n_a).collect()
    }

    pub fn positions_b(&self) -> Vec<usize> {
        (self.n_a..self.n_cells()).collect()
    }

    fn batches_at(&self, positions: &[usize]) -> Vec<usize> {
        match &self.batches {
            Some(batches) => positions.iter().map(|&p| batches[p]).collect(),
            None => Vec::new(),
        }
    }

    /// Composition imbalance of a split of the compared cells.
    pub fn imbalance(&self, a: &[usize], b: &[usize]) -> f64 {
        composition_imbalance(&self.batches_at(a), &self.batches_at(b))
    }

    /// No-difference kernels of every batch level with cells on both sides of a level vs rest split.
    pub fn batch_levels(
        &self,
        likelihoods: &GeneLikelihoods,
        prior: &ExpressionPrior,
    ) -> Result<Vec<BatchLevel>, ScdeError> {
        let Some(batches) = &self.batches else {
            return Ok(Vec::new());
        };
        let mut levels: Vec<usize> = batches.clone();
        levels.sort();
        levels.dedup();

        let mut kernels = Vec::with_capacity(levels.len());
        for level in levels {
            let (inside, rest): (Vec<usize>, Vec<usize>) =
                (0..self.n_cells()).partition(|&p| batches[p] == level);
            if inside.is_empty() || rest.is_empty() {
                continue;
            }
            let level_posterior = likelihoods.joint(&inside, prior)?;
            let rest_posterior = likelihoods.joint(&rest, prior)?;
            kernels.push(BatchLevel {
                level,
                share: inside.len() as f64 / self.n_cells() as f64,
                kernel: fold_change_posterior(&level_posterior, &rest_posterior, prior)?.symmetrized(),
            });
        }
        Ok(kernels)
    }
}

/// Posteriors of a gene under the observed labels.
pub(crate) struct ObservedDifference {
    pub joint_a: MagnitudePosterior,
    pub joint_b: MagnitudePosterior,
    pub fold_change: FoldChangePosterior,
    pub batch_levels: Vec<BatchLevel>,
    pub batch_corrected: Option<FoldChangePosterior>,
}

impl ObservedDifference {
    pub fn new(
        plan: &ComparisonPlan,
        likelihoods: &GeneLikelihoods,
        prior: &ExpressionPrior,
    ) -> Result<Self, ScdeError> {
        let (a, b) = (plan.positions_a(), plan.positions_b());
        let joint_a = likelihoods.joint(&a, prior)?;
        let joint_b = likelihoods.joint(&b, prior)?;
        let fold_change = fold_change_posterior(&joint_a, &joint_b, prior)?;

        let batch_levels = plan.batch_levels(likelihoods, prior)?;
        let batch_corrected = match plan.batches {
            Some(_) => Some(batch_marginalized(&fold_change, &batch_levels, plan.imbalance(&a, &b))?),
            None => None,
        };
        Ok(ObservedDifference {
            joint_a,
            joint_b,
            fold_change,
            batch_levels,
            batch_corrected,
        })
    }

    /// `(mle, lower, upper, conservative)` of the uncorrected fold change.
    pub fn summary(&self, credible_mass: f64) -> (f64, f64, f64, f64) {
        let (lower, upper) = self.fold_change.hdi(credible_mass);
        (
            self.fold_change.mode(),
            lower,
            upper,
            conservative_estimate(lower, upper),
        )
    }

    /// `(mle, lower, upper)` of the batch-marginalized fold change, when batches were given.
    pub fn corrected_summary(&self, credible_mass: f64) -> Option<(f64, f64, f64)> {
        self.batch_corrected.as_ref().map(|corrected| {
            let (lower, upper) = corrected.hdi(credible_mass);
            (corrected.mode(), lower, upper)
        })
    }

    /// Batch-adjusted statistic under the observed labels.
    pub fn adjusted_statistic(&self) -> Option<f64> {
        self.batch_corrected
            .as_ref()
            .map(|corrected| batch_adjusted_mean(&self.fold_change, corrected))
    }
}

fn evaluate_gene(
    gene: usize,
    counts: &[u64],
    plan: &ComparisonPlan,
    models: &ErrorModelTable,
    prior: &ExpressionPrior,
    sampler: &NullSampler,
    config: &ScdeConfig,
) -> Result<(DiffExpResult, Option<GenePosteriors>), ScdeError> {
    let likelihoods = GeneLikelihoods::new(counts, &plan.cells, models, prior)?;
    let observed = ObservedDifference::new(plan, &likelihoods, prior)?;
    let (mle, lower, upper, conservative) = observed.summary(config.credible_mass);

    let relabelings = sampler.relabelings(gene, plan.n_a, plan.n_cells());
    let mut null = Vec::with_capacity(relabelings.len());
    let mut corrected_null = Vec::with_capacity(relabelings.len());
    for relabeling in relabelings.iter() {
        let joint_a = likelihoods.joint(&relabeling.a, prior)?;
        let joint_b = likelihoods.joint(&relabeling.b, prior)?;
        null.push(mean_fold_change(&joint_a, &joint_b, prior));
        if observed.batch_corrected.is_some() {
            let fold_change = fold_change_posterior(&joint_a, &joint_b, prior)?;
            let imbalance = plan.imbalance(&relabeling.a, &relabeling.b);
            let corrected = batch_marginalized(&fold_change, &observed.batch_levels, imbalance)?;
            corrected_null.push(batch_adjusted_mean(&fold_change, &corrected));
        }
    }

    let z = randomization_z(observed.fold_change.mean(), &null);
    let mut result = DiffExpResult::new(mle, lower, upper, conservative, z);
    if let (Some(statistic), Some((c_mle, c_lower, c_upper))) = (
        observed.adjusted_statistic(),
        observed.corrected_summary(config.credible_mass),
    ) {
        result = result.with_batch_correction(randomization_z(statistic, &corrected_null), c_mle, c_lower, c_upper);
    }
    let posteriors = config.return_posteriors.then(|| GenePosteriors {
        joint_a: observed.joint_a,
        joint_b: observed.joint_b,
        fold_change: observed.fold_change,
        batch_corrected: observed.batch_corrected,
    });
    Ok((result, posteriors))
}

/// Test every requested gene for a difference between the two labelled groups.
///
/// Run-level problems (configuration, shapes, not exactly two groups, a group without valid
/// models) fail before any gene is evaluated. A gene that cannot be evaluated yields a
/// [`GeneFailure`] row; the table always covers every requested gene in ascending order.
///
/// # Arguments
///
/// * `matrix` - Count matrix (genes × cells)
/// * `genes` - Genes to test; `None` tests all genes
/// * `labels` - Groups and optional batches; batches switch on `batch_corrected_z`
/// * `models` - Error models in column order
/// * `prior` - Expression prior
/// * `config` - Uses `n_randomizations`, `seed`, `n_cores`, `credible_mass` and `return_posteriors`
/// * `cancel` - Checked before each gene; a cancelled run returns [`ScdeError::Cancelled`]
pub fn differential_expression<T>(
    matrix: &CsrMatrix<T>,
    genes: Option<&[usize]>,
    labels: &CellLabels,
    models: &ErrorModelTable,
    prior: &ExpressionPrior,
    config: &ScdeConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<DiffExpTable>
where
    T: FloatOpsTS + Sync,
{
    config.validate()?;
    validate_counts(matrix)?;
    labels.check_cells(matrix.ncols())?;
    models.check_cells(matrix.ncols())?;

    let genes: Vec<usize> = match genes {
        Some(genes) => {
            let mut genes = genes.to_vec();
            genes.sort();
            genes.dedup();
            if let Some(&gene) = genes.iter().find(|&&g| g >= matrix.nrows()) {
                return Err(ScdeError::invalid_input(format!(
                    "Gene index {} is out of range for {} genes",
                    gene,
                    matrix.nrows()
                ))
                .into());
            }
            genes
        }
        None => (0..matrix.nrows()).collect(),
    };

    let plan = ComparisonPlan::new(labels, models)?;
    let sampler = NullSampler::new(config.seed, config.n_randomizations);
    if config.logs_progress() {
        info!(
            "Testing {} genes: group {} ({} cells) vs group {} ({} cells), {} randomizations{}",
            genes.len(),
            plan.group_a,
            plan.n_a,
            plan.group_b,
            plan.n_cells() - plan.n_a,
            config.n_randomizations,
            if plan.batches.is_some() { ", batch corrected" } else { "" }
        );
    }

    let pool = config.thread_pool()?;
    let rows: Option<Vec<DiffExpRow>> = pool.install(|| {
        genes
            .par_iter()
            .map(|&gene| {
                if cancel.is_cancelled() {
                    return None;
                }
                let counts = gene_counts(matrix, gene);
                let row = match evaluate_gene(gene, &counts, &plan, models, prior, &sampler, config) {
                    Ok((result, posteriors)) => DiffExpRow {
                        gene,
                        result: Ok(result),
                        posteriors,
                    },
                    Err(err) => {
                        if config.logs_details() {
                            debug!("gene {} failed: {}", gene, err);
                        }
                        DiffExpRow {
                            gene,
                            result: Err(GeneFailure::new(gene, &err)),
                            posteriors: None,
                        }
                    }
                };
                Some(row)
            })
            .collect()
    });

    let Some(rows) = rows else {
        if config.logs_progress() {
            info!("Differential expression run cancelled");
        }
        return Err(ScdeError::Cancelled.into());
    };

    let table = DiffExpTable::new(plan.group_a, plan.group_b, rows);
    if config.logs_progress() {
        info!(
            "Finished {} genes, {} failed",
            table.len(),
            table.failures().count()
        );
    }
    Ok(table)
}
