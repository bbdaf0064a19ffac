//! # single-scde
//!
//! Bayesian differential expression for single-cell count data, part of the single-rust ecosystem.
//!
//! Counts from single cells are noisy and full of dropouts. Instead of treating them as exact, this
//! crate fits a per-cell error model (a negative binomial "amplified" component mixed with a Poisson
//! "failure" background) from cross-cell comparisons and integrates over the unknown expression
//! magnitude on a discretized grid.
//!
//! ## Core Features
//!
//! - **Error Models**: robust gene selection, peer consensus and EM fitting of the NB + Poisson mixture
//! - **Expression Prior**: kernel-smoothed grid prior from the magnitudes implied by the fitted models
//! - **Posteriors**: per-cell, joint group and fold-change posteriors with highest-density intervals
//! - **Differential Expression**: randomization-calibrated Z scores with optional batch marginalization
//! - **Sparse Matrix Support**: operates on `CsrMatrix` (genes × cells) from nalgebra-sparse
//!
//! ## Quick Start
//!
//! Use the `MatrixScdeTests` trait on a count matrix: fit the error models, build the prior and
//! test the two labelled groups. Every step is parallel over cells or genes and deterministic for a
//! fixed `seed`.
//!
//! ## Module Organization
//!
//! - **[`fitting`]**: robust genes, peer consensus and per-cell mixture fits
//! - **[`prior`]**: the expression grid and its prior weights
//! - **[`posterior`]**: likelihoods, magnitude and fold-change posteriors
//! - **[`testing`]**: the differential expression tester and single-gene queries
//! - **[`simulation`]**: synthetic data drawn from known error models

pub mod config;
pub mod counts;
pub mod error;
pub mod fitting;
pub mod labels;
pub mod posterior;
pub mod prior;
pub mod simulation;
pub mod stats;
pub mod testing;

pub use config::{FitGrouping, ScdeConfig};
pub use error::ScdeError;
pub use fitting::robust::select_robust_genes;
pub use fitting::{ErrorModel, ErrorModelTable, FitStatus, fit_error_models};
pub use labels::CellLabels;
pub use posterior::foldchange::{FoldChangePosterior, batch_adjusted_mean, batch_marginalized, fold_change_posterior};
pub use posterior::{MagnitudePosterior, cell_posterior, group_posterior};
pub use prior::{ExpressionPrior, build_prior};
pub use testing::randomization::NullSampler;
pub use testing::{
    CancellationToken, DiffExpResult, DiffExpRow, DiffExpTable, GeneDifference, GeneFailure, MatrixScdeTests,
    differential_expression, test_gene_expression_difference,
};
