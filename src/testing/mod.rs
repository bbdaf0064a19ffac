use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use single_utilities::traits::FloatOpsTS;

use crate::config::ScdeConfig;
use crate::error::ScdeError;
use crate::fitting::{ErrorModelTable, fit_error_models};
use crate::labels::CellLabels;
use crate::posterior::MagnitudePosterior;
use crate::posterior::foldchange::FoldChangePosterior;
use crate::prior::{ExpressionPrior, build_prior};

pub mod differential;
pub mod randomization;
pub mod single_gene;

pub use differential::differential_expression;
pub use single_gene::{GeneDifference, test_gene_expression_difference};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffExpResult {
    /// Log2 fold change at the posterior mode
    pub mle: f64,
    /// Lower end of the highest-density credible interval
    pub lower_bound: f64,
    /// Upper end of the highest-density credible interval
    pub upper_bound: f64,
    /// Interval end closest to zero, or 0 when the interval covers zero
    pub conservative_estimate: f64,
    /// Randomization-calibrated Z of the posterior mean fold change
    pub z: f64,
    /// Randomization-calibrated Z of the batch-adjusted statistic (only with batches)
    pub batch_corrected_z: Option<f64>,
    /// Mode of the batch-marginalized fold change (only with batches)
    pub batch_corrected_mle: Option<f64>,
    /// Credible interval of the batch-marginalized fold change (only with batches)
    pub batch_corrected_bounds: Option<(f64, f64)>,
}

impl DiffExpResult {
    pub fn new(mle: f64, lower_bound: f64, upper_bound: f64, conservative_estimate: f64, z: f64) -> Self {
        DiffExpResult {
            mle,
            lower_bound,
            upper_bound,
            conservative_estimate,
            z,
            batch_corrected_z: None,
            batch_corrected_mle: None,
            batch_corrected_bounds: None,
        }
    }

    pub fn with_batch_correction(mut self, z: f64, mle: f64, lower_bound: f64, upper_bound: f64) -> Self {
        self.batch_corrected_z = Some(z);
        self.batch_corrected_mle = Some(mle);
        self.batch_corrected_bounds = Some((lower_bound, upper_bound));
        self
    }

    /// Whether the credible interval excludes zero
    pub fn is_credible(&self) -> bool {
        self.conservative_estimate != 0.0
    }
}

/// Marker of a gene that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneFailure {
    pub gene: usize,
    pub reason: String,
}

impl GeneFailure {
    pub fn new(gene: usize, error: &ScdeError) -> Self {
        GeneFailure {
            gene,
            reason: error.to_string(),
        }
    }
}

/// Raw posteriors of a gene under the observed labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenePosteriors {
    pub joint_a: MagnitudePosterior,
    pub joint_b: MagnitudePosterior,
    pub fold_change: FoldChangePosterior,
    pub batch_corrected: Option<FoldChangePosterior>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffExpRow {
    pub gene: usize,
    pub result: Result<DiffExpResult, GeneFailure>,
    /// Present when `return_posteriors` is set and the gene succeeded
    pub posteriors: Option<GenePosteriors>,
}

/// One row per tested gene in ascending gene order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffExpTable {
    /// Group A of the comparison; positive fold changes mean higher expression in A
    pub group_a: usize,
    pub group_b: usize,
    rows: Vec<DiffExpRow>,
}

impl DiffExpTable {
    pub fn new(group_a: usize, group_b: usize, rows: Vec<DiffExpRow>) -> Self {
        DiffExpTable { group_a, group_b, rows }
    }

    pub fn rows(&self) -> &[DiffExpRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row of a gene, if it was tested.
    pub fn row(&self, gene: usize) -> Option<&DiffExpRow> {
        self.rows
            .binary_search_by_key(&gene, |r| r.gene)
            .ok()
            .map(|i| &self.rows[i])
    }

    pub fn result(&self, gene: usize) -> Option<&DiffExpResult> {
        self.row(gene).and_then(|r| r.result.as_ref().ok())
    }

    pub fn results(&self) -> impl Iterator<Item = (usize, &DiffExpResult)> {
        self.rows
            .iter()
            .filter_map(|r| r.result.as_ref().ok().map(|res| (r.gene, res)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &GeneFailure> {
        self.rows.iter().filter_map(|r| r.result.as_ref().err())
    }

    pub fn z_scores(&self) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.result.as_ref().ok().map(|res| res.z)).collect()
    }

    pub fn batch_corrected_z_scores(&self) -> Vec<Option<f64>> {
        self.rows
            .iter()
            .map(|r| r.result.as_ref().ok().and_then(|res| res.batch_corrected_z))
            .collect()
    }

    /// Top `n` genes by `|Z|`, ties broken by gene index.
    pub fn top_genes(&self, n: usize) -> Vec<usize> {
        let mut ranked: Vec<(usize, f64)> = self.results().map(|(g, r)| (g, r.z.abs())).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().take(n).map(|(g, _)| g).collect()
    }
}

/// Shared flag that stops a running differential expression test.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub trait MatrixScdeTests<T>
where
    T: FloatOpsTS,
{
    fn fit_error_models(&self, labels: &CellLabels, config: &ScdeConfig) -> anyhow::Result<ErrorModelTable>;

    fn expression_prior(&self, models: &ErrorModelTable, config: &ScdeConfig) -> anyhow::Result<ExpressionPrior>;

    fn differential_expression(
        &self,
        labels: &CellLabels,
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
        config: &ScdeConfig,
    ) -> anyhow::Result<DiffExpTable>;

    fn differential_expression_cancellable(
        &self,
        genes: Option<&[usize]>,
        labels: &CellLabels,
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
        config: &ScdeConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DiffExpTable>;

    fn test_gene_expression_difference(
        &self,
        gene: usize,
        labels: &CellLabels,
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
        config: &ScdeConfig,
    ) -> anyhow::Result<GeneDifference>;
}

impl<T> MatrixScdeTests<T> for CsrMatrix<T>
where
    T: FloatOpsTS + Sync,
{
    fn fit_error_models(&self, labels: &CellLabels, config: &ScdeConfig) -> anyhow::Result<ErrorModelTable> {
        fit_error_models(self, labels, config)
    }

    fn expression_prior(&self, models: &ErrorModelTable, config: &ScdeConfig) -> anyhow::Result<ExpressionPrior> {
        build_prior(self, models, config)
    }

    fn differential_expression(
        &self,
        labels: &CellLabels,
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
        config: &ScdeConfig,
    ) -> anyhow::Result<DiffExpTable> {
        differential::differential_expression(
            self,
            None,
            labels,
            models,
            prior,
            config,
            &CancellationToken::new(),
        )
    }

    fn differential_expression_cancellable(
        &self,
        genes: Option<&[usize]>,
        labels: &CellLabels,
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
        config: &ScdeConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DiffExpTable> {
        differential::differential_expression(self, genes, labels, models, prior, config, cancel)
    }

    fn test_gene_expression_difference(
        &self,
        gene: usize,
        labels: &CellLabels,
        models: &ErrorModelTable,
        prior: &ExpressionPrior,
        config: &ScdeConfig,
    ) -> anyhow::Result<GeneDifference> {
        single_gene::test_gene_expression_difference(self, gene, labels, models, prior, config)
    }
}
