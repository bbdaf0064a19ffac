//! Single-gene query mode: every posterior of one gene, without randomization.

use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use super::differential::{ComparisonPlan, ObservedDifference};
use crate::config::ScdeConfig;
use crate::counts::{gene_counts, validate_counts};
use crate::error::ScdeError;
use crate::fitting::ErrorModelTable;
use crate::labels::CellLabels;
use crate::posterior::foldchange::FoldChangePosterior;
use crate::posterior::{GeneLikelihoods, MagnitudePosterior};
use crate::prior::ExpressionPrior;

/// Posteriors and credible interval of one gene, for inspection or plotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneDifference {
    pub gene: usize,
    pub group_a: usize,
    pub group_b: usize,
    /// Compared cells of group A with a valid model, in column order
    pub cells_a: Vec<usize>,
    pub cells_b: Vec<usize>,
    pub cell_posteriors_a: Vec<MagnitudePosterior>,
    pub cell_posteriors_b: Vec<MagnitudePosterior>,
    pub joint_a: MagnitudePosterior,
    pub joint_b: MagnitudePosterior,
    pub fold_change: FoldChangePosterior,
    /// Batch-marginalized fold change, when batches were given
    pub batch_corrected: Option<FoldChangePosterior>,
    pub mle: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub conservative_estimate: f64,
}

/// Posteriors of one gene under the observed labels.
///
/// # Arguments
///
/// * `matrix` - Count matrix (genes × cells)
/// * `gene` - Row index of the gene
/// * `labels` - Groups and optional batches
/// * `models` - Error models in column order
/// * `prior` - Expression prior
/// * `config` - Uses `credible_mass`
pub fn test_gene_expression_difference<T>(
    matrix: &CsrMatrix<T>,
    gene: usize,
    labels: &CellLabels,
    models: &ErrorModelTable,
    prior: &ExpressionPrior,
    config: &ScdeConfig,
) -> anyhow::Result<GeneDifference>
where
    T: FloatOpsTS,
{
    config.validate()?;
    validate_counts(matrix)?;
    labels.check_cells(matrix.ncols())?;
    models.check_cells(matrix.ncols())?;
    if gene >= matrix.nrows() {
        return Err(ScdeError::invalid_input(format!(
            "Gene index {} is out of range for {} genes",
            gene,
            matrix.nrows()
        ))
        .into());
    }

    let plan = ComparisonPlan::new(labels, models)?;
    let counts = gene_counts(matrix, gene);
    let likelihoods = GeneLikelihoods::new(&counts, &plan.cells, models, prior)?;
    let observed = ObservedDifference::new(&plan, &likelihoods, prior)?;
    let (mle, lower_bound, upper_bound, conservative_estimate) = observed.summary(config.credible_mass);

    let mut cell_posteriors_a = likelihoods.cell_posteriors(prior)?;
    let cell_posteriors_b = cell_posteriors_a.split_off(plan.n_a);

    Ok(GeneDifference {
        gene,
        group_a: plan.group_a,
        group_b: plan.group_b,
        cells_a: plan.cells[..plan.n_a].to_vec(),
        cells_b: plan.cells[plan.n_a..].to_vec(),
        cell_posteriors_a,
        cell_posteriors_b,
        joint_a: observed.joint_a,
        joint_b: observed.joint_b,
        fold_change: observed.fold_change,
        batch_corrected: observed.batch_corrected,
        mle,
        lower_bound,
        upper_bound,
        conservative_estimate,
    })
}
