//! Error taxonomy of the inference engine.
//!
//! Run-level variants (`InsufficientRobustGenes`, `DegenerateGrid`, `InvalidConfiguration`,
//! `InvalidInput`, `Cancelled`) abort a run before the expensive work starts. Per-cell and
//! per-gene variants (`ModelFitFailure`, `NumericUnderflow`) are recorded inline in the
//! error model table or the differential expression table instead of being raised.
//!
//! Public entry points return `anyhow::Result`; the carried error downcasts to [`ScdeError`].

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScdeError {
    #[error("Insufficient robust genes for group {group}: found {found}, need at least {required}")]
    InsufficientRobustGenes {
        group: String,
        found: usize,
        required: usize,
    },

    #[error("Error model fit failed for cell {cell}: {reason}")]
    ModelFitFailure { cell: String, reason: String },

    #[error("Degenerate expression grid: {reason}")]
    DegenerateGrid { reason: String },

    #[error("Numeric underflow in {context}")]
    NumericUnderflow { context: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Run cancelled before all genes were evaluated")]
    Cancelled,
}

impl ScdeError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        ScdeError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        ScdeError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn degenerate_grid(reason: impl Into<String>) -> Self {
        ScdeError::DegenerateGrid {
            reason: reason.into(),
        }
    }
}
