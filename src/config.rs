use crate::error::ScdeError;

/// How cells are partitioned for the cross-cell error model fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitGrouping {
    /// A single implicit group containing every cell, labelled or not.
    Pooled,
    /// Each labelled group is fitted independently; unassigned cells are not fitted.
    #[default]
    PerGroup,
}

/// Configuration of an analysis run.
///
/// Every tunable threshold of the robust gene selection, the mixture fit and the prior
/// lives here so nothing downstream relies on hidden constants. Use the `with_*` setters
/// on top of [`ScdeConfig::default`] and call [`ScdeConfig::validate`] (the entry points do
/// it for you) before any computation starts.
#[derive(Debug, Clone)]
pub struct ScdeConfig {
    /// Fit per labelled group or on all cells together
    pub groups: FitGrouping,
    /// Detection-threshold-aware initialisation of the mixture fit
    pub threshold_segmentation: bool,
    /// Counts at or above this value are pinned to the NB component under threshold segmentation
    pub segmentation_threshold: u64,
    /// Degree of parallelism; `None` uses the rayon default
    pub n_cores: Option<usize>,
    /// Number of random relabelings used for the null distribution
    pub n_randomizations: usize,
    /// Explicit upper bound of the expression grid (expected count scale)
    pub max_value: Option<f64>,
    /// Number of grid points
    pub length_out: usize,
    /// Diagnostic logging level (0 = quiet, 1 = progress, 2 = per entity)
    pub verbose: u8,
    /// Run seed for the randomization streams
    pub seed: u64,
    /// Minimum number of robust genes a fitting group must have
    pub min_robust_genes: usize,
    /// Maximum number of robust genes used per fitting group
    pub max_robust_genes: usize,
    /// Fraction of non-outlier cells in which a robust gene must be detected
    pub robust_detection_fraction: f64,
    /// Minimum count that counts as a detection
    pub min_count_threshold: u64,
    /// Library sizes further than this many scaled MADs from the median mark outlier cells
    pub outlier_mad_multiplier: f64,
    /// Added to a peer's residual spread before inverting it into a consensus weight
    pub consensus_spread_floor: f64,
    /// Maximum number of EM iterations per cell
    pub max_fit_iterations: usize,
    /// Relative change of the log-likelihood accepted as converged
    pub fit_tolerance: f64,
    /// Fixed background Poisson rate; estimated per cell when `None`
    pub fixed_poisson_rate: Option<f64>,
    /// Quantile of the implied magnitudes used as the grid upper bound
    pub prior_quantile: f64,
    /// Gaussian smoothing bandwidth of the prior, in grid steps
    pub prior_bandwidth: f64,
    /// Pseudocount added to every prior bin, relative to the mean bin mass
    pub prior_pseudocount: f64,
    /// Posterior mass of the credible interval
    pub credible_mass: f64,
    /// Keep the joint and fold-change posteriors of every gene in the output table
    pub return_posteriors: bool,
}

impl Default for ScdeConfig {
    fn default() -> Self {
        ScdeConfig {
            groups: FitGrouping::PerGroup,
            threshold_segmentation: false,
            segmentation_threshold: 4,
            n_cores: None,
            n_randomizations: 150,
            max_value: None,
            length_out: 400,
            verbose: 0,
            seed: 0,
            min_robust_genes: 10,
            max_robust_genes: 1000,
            robust_detection_fraction: 0.5,
            min_count_threshold: 1,
            outlier_mad_multiplier: 5.0,
            consensus_spread_floor: 0.1,
            max_fit_iterations: 100,
            fit_tolerance: 1e-6,
            fixed_poisson_rate: None,
            prior_quantile: 0.999,
            prior_bandwidth: 2.0,
            prior_pseudocount: 1e-3,
            credible_mass: 0.95,
            return_posteriors: false,
        }
    }
}

impl ScdeConfig {
    pub fn with_groups(mut self, groups: FitGrouping) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_threshold_segmentation(mut self, enabled: bool) -> Self {
        self.threshold_segmentation = enabled;
        self
    }

    pub fn with_n_cores(mut self, n_cores: usize) -> Self {
        self.n_cores = Some(n_cores);
        self
    }

    pub fn with_n_randomizations(mut self, n: usize) -> Self {
        self.n_randomizations = n;
        self
    }

    pub fn with_max_value(mut self, max_value: f64) -> Self {
        self.max_value = Some(max_value);
        self
    }

    pub fn with_length_out(mut self, length_out: usize) -> Self {
        self.length_out = length_out;
        self
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_min_robust_genes(mut self, n: usize) -> Self {
        self.min_robust_genes = n;
        self
    }

    pub fn with_max_robust_genes(mut self, n: usize) -> Self {
        self.max_robust_genes = n;
        self
    }

    pub fn with_robust_detection_fraction(mut self, fraction: f64) -> Self {
        self.robust_detection_fraction = fraction;
        self
    }

    pub fn with_fixed_poisson_rate(mut self, rate: f64) -> Self {
        self.fixed_poisson_rate = Some(rate);
        self
    }

    pub fn with_return_posteriors(mut self, enabled: bool) -> Self {
        self.return_posteriors = enabled;
        self
    }

    /// Check ranges and combinations of options, failing fast with
    /// [`ScdeError::InvalidConfiguration`].
    pub fn validate(&self) -> Result<(), ScdeError> {
        let fail = |reason: String| Err(ScdeError::invalid_configuration(reason));

        if self.length_out < 2 {
            return fail(format!("length_out must be at least 2, got {}", self.length_out));
        }
        if self.n_cores == Some(0) {
            return fail("n_cores must be positive".to_string());
        }
        if self.n_randomizations < 2 {
            return fail(format!(
                "n_randomizations must be at least 2 to estimate a null spread, got {}",
                self.n_randomizations
            ));
        }
        if let Some(max_value) = self.max_value {
            if !max_value.is_finite() || max_value <= 0.0 {
                return fail(format!("max_value must be positive and finite, got {}", max_value));
            }
        }
        if !(self.prior_quantile > 0.0 && self.prior_quantile <= 1.0) {
            return fail(format!("prior_quantile must lie in (0, 1], got {}", self.prior_quantile));
        }
        if !(self.robust_detection_fraction > 0.0 && self.robust_detection_fraction <= 1.0) {
            return fail(format!(
                "robust_detection_fraction must lie in (0, 1], got {}",
                self.robust_detection_fraction
            ));
        }
        if self.min_robust_genes < 2 {
            return fail("min_robust_genes must be at least 2".to_string());
        }
        if self.max_robust_genes < self.min_robust_genes {
            return fail(format!(
                "max_robust_genes ({}) is smaller than min_robust_genes ({})",
                self.max_robust_genes, self.min_robust_genes
            ));
        }
        if self.min_count_threshold == 0 {
            return fail("min_count_threshold must be at least 1".to_string());
        }
        if self.threshold_segmentation && self.segmentation_threshold == 0 {
            return fail("threshold_segmentation requires a positive segmentation_threshold".to_string());
        }
        if !(self.outlier_mad_multiplier > 0.0) {
            return fail("outlier_mad_multiplier must be positive".to_string());
        }
        if !(self.consensus_spread_floor > 0.0) {
            return fail("consensus_spread_floor must be positive".to_string());
        }
        if self.max_fit_iterations == 0 {
            return fail("max_fit_iterations must be positive".to_string());
        }
        if !(self.fit_tolerance > 0.0) {
            return fail("fit_tolerance must be positive".to_string());
        }
        if let Some(rate) = self.fixed_poisson_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return fail(format!("fixed_poisson_rate must be positive and finite, got {}", rate));
            }
        }
        if !(self.prior_bandwidth >= 0.0) || !(self.prior_pseudocount >= 0.0) {
            return fail("prior_bandwidth and prior_pseudocount must be non-negative".to_string());
        }
        if !(self.credible_mass > 0.0 && self.credible_mass < 1.0) {
            return fail(format!("credible_mass must lie in (0, 1), got {}", self.credible_mass));
        }
        Ok(())
    }

    /// Thread pool honoring `n_cores`.
    pub fn thread_pool(&self) -> anyhow::Result<rayon::ThreadPool> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.n_cores {
            builder = builder.num_threads(n);
        }
        Ok(builder.build()?)
    }

    pub(crate) fn logs_progress(&self) -> bool {
        self.verbose >= 1
    }

    pub(crate) fn logs_details(&self) -> bool {
        self.verbose >= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ScdeConfig::default().validate().is_ok());
        assert_eq!(ScdeConfig::default().groups, FitGrouping::PerGroup);
    }

    #[test]
    fn test_out_of_range_options() {
        let bad = [
            ScdeConfig::default().with_length_out(1),
            ScdeConfig::default().with_n_cores(0),
            ScdeConfig::default().with_n_randomizations(1),
            ScdeConfig::default().with_max_value(-3.0),
            ScdeConfig::default().with_robust_detection_fraction(0.0),
            ScdeConfig::default().with_fixed_poisson_rate(f64::NAN),
            ScdeConfig::default().with_min_robust_genes(50).with_max_robust_genes(10),
        ];
        for config in bad.iter() {
            match config.validate() {
                Err(ScdeError::InvalidConfiguration { .. }) => {}
                other => panic!("expected invalid configuration, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_contradictory_segmentation() {
        let mut config = ScdeConfig::default().with_threshold_segmentation(true);
        config.segmentation_threshold = 0;
        assert!(config.validate().is_err());
    }
}
