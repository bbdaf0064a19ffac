//! EM fit of the NB + Poisson background mixture of one cell against reference magnitudes.
//!
//! ```text
//! p(y | x) = (1 - π(x)) NB(y; exp(a + b x), φ) + π(x) Pois(y; λ)
//! π(x)     = logistic(c + d x)
//! ```
//!
//! The E-step assigns every gene a probability of having been amplified (NB component);
//! the M-step refits the corr relation (a, b) by weighted log-link IRLS, the overdispersion φ
//! by weighted moments, the conc relation (c, d) by logistic IRLS and λ by the
//! failure-weighted mean count unless it is fixed by configuration.

use ndarray::Array1;

use crate::posterior::likelihood::{ln_mixture_pmf, ln_nb_pmf};
use crate::stats::logistic;

const MAX_IRLS_ITER: usize = 25;
const IRLS_TOL: f64 = 1e-8;
const LOGISTIC_RIDGE: f64 = 1e-3;
const MAX_LINEAR_PREDICTOR: f64 = 30.0;
const MIN_OVERDISPERSION: f64 = 1e-4;
const MAX_OVERDISPERSION: f64 = 1e3;
const MIN_FAIL_RATE: f64 = 1e-4;
const MAX_FAIL_RATE: f64 = 1.0;

/// Parameters of the mixture, before validity checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixtureParams {
    pub corr_intercept: f64,
    pub corr_slope: f64,
    pub conc_intercept: f64,
    pub conc_slope: f64,
    pub nb_overdispersion: f64,
    pub poisson_fail_rate: f64,
}

impl MixtureParams {
    fn nb_mean(&self, x: f64) -> f64 {
        (self.corr_intercept + self.corr_slope * x)
            .clamp(-MAX_LINEAR_PREDICTOR, MAX_LINEAR_PREDICTOR)
            .exp()
    }

    fn fail_probability(&self, x: f64) -> f64 {
        logistic(self.conc_intercept + self.conc_slope * x)
    }

    fn is_finite(&self) -> bool {
        [
            self.corr_intercept,
            self.corr_slope,
            self.conc_intercept,
            self.conc_slope,
            self.nb_overdispersion,
            self.poisson_fail_rate,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone)]
pub struct MixtureOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub fixed_rate: Option<f64>,
    /// Counts at or above this value start in, and stay in, the NB component
    pub segmentation_threshold: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MixtureFit {
    pub params: MixtureParams,
    pub iterations: usize,
    pub converged: bool,
    pub log_likelihood: f64,
    /// Final probability of each observation belonging to the NB component
    pub amplified: Array1<f64>,
}

/// Fit the mixture to counts `y` observed at reference magnitudes `x`.
///
/// Returns `None` when a regression step is singular (e.g. every reference magnitude is equal).
pub fn fit_mixture(y: &Array1<f64>, x: &Array1<f64>, options: &MixtureOptions) -> Option<MixtureFit> {
    let n = y.len();
    if n < 2 || x.len() != n {
        return None;
    }
    let counts: Vec<u64> = y.iter().map(|&v| v.max(0.0).round() as u64).collect();
    let pinned: Vec<bool> = counts
        .iter()
        .map(|&c| options.segmentation_threshold.is_some_and(|t| c >= t))
        .collect();

    let mut amplified = match options.segmentation_threshold {
        Some(_) => Array1::from_shape_fn(n, |i| if pinned[i] { 1.0 } else { 0.0 }),
        None => y.mapv(|v| if v > 0.0 { 0.9 } else { 0.1 }),
    };

    let weighted_mean = (y * &amplified).sum() / amplified.sum().max(1e-12);
    let mut params = MixtureParams {
        corr_intercept: (weighted_mean + 0.1).ln(),
        corr_slope: 0.0,
        conc_intercept: 0.0,
        conc_slope: 0.0,
        nb_overdispersion: 0.1,
        poisson_fail_rate: options.fixed_rate.unwrap_or(0.1),
    };

    let mut prev_ll = f64::NEG_INFINITY;
    let mut log_likelihood = f64::NEG_INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..options.max_iterations {
        iterations = iteration + 1;

        // M-step
        let (a, b) = poisson_irls(x, y, &amplified, params.corr_intercept, params.corr_slope)?;
        params.corr_intercept = a;
        params.corr_slope = b;
        params.nb_overdispersion = moment_overdispersion(x, y, &amplified, &params);

        let failed = amplified.mapv(|z| 1.0 - z);
        let (c, d) = logistic_irls(x, &failed, params.conc_intercept, params.conc_slope)?;
        params.conc_intercept = c;
        params.conc_slope = d;

        params.poisson_fail_rate = match options.fixed_rate {
            Some(rate) => rate,
            None => {
                let mass = failed.sum();
                if mass > 0.0 {
                    ((&failed * y).sum() / mass).clamp(MIN_FAIL_RATE, MAX_FAIL_RATE)
                } else {
                    MIN_FAIL_RATE
                }
            }
        };

        if !params.is_finite() {
            return None;
        }

        // E-step
        log_likelihood = 0.0;
        for i in 0..n {
            let mean = params.nb_mean(x[i]);
            let pi = params.fail_probability(x[i]);
            let ln_total = ln_mixture_pmf(counts[i], mean, params.nb_overdispersion, pi, params.poisson_fail_rate);
            log_likelihood += ln_total;
            amplified[i] = if pinned[i] {
                1.0
            } else {
                let ln_nb = (1.0 - pi).ln() + ln_nb_pmf(counts[i], mean, params.nb_overdispersion);
                let z = (ln_nb - ln_total).exp();
                if z.is_finite() { z.clamp(0.0, 1.0) } else { 0.0 }
            };
        }

        if (log_likelihood - prev_ll).abs() <= options.tolerance * (1.0 + log_likelihood.abs()) {
            converged = true;
            break;
        }
        prev_ll = log_likelihood;
    }

    Some(MixtureFit {
        params,
        iterations,
        converged,
        log_likelihood,
        amplified,
    })
}

/// Solve the 2x2 weighted least squares problem of `response ~ 1 + x`.
fn weighted_linear_fit(x: &Array1<f64>, response: &Array1<f64>, weights: &Array1<f64>, ridge: f64) -> Option<(f64, f64)> {
    let mut s0 = ridge;
    let mut s1 = 0.0;
    let mut s2 = ridge;
    let mut t0 = 0.0;
    let mut t1 = 0.0;
    for ((&xi, &ri), &wi) in x.iter().zip(response.iter()).zip(weights.iter()) {
        if wi <= 0.0 || !ri.is_finite() {
            continue;
        }
        s0 += wi;
        s1 += wi * xi;
        s2 += wi * xi * xi;
        t0 += wi * ri;
        t1 += wi * xi * ri;
    }
    let det = s0 * s2 - s1 * s1;
    if !(det.abs() > 1e-12 * (s0 * s2).abs().max(1e-300)) {
        return None;
    }
    let intercept = (s2 * t0 - s1 * t1) / det;
    let slope = (s0 * t1 - s1 * t0) / det;
    Some((intercept, slope))
}

/// Weighted log-link IRLS for the NB mean relation.
fn poisson_irls(x: &Array1<f64>, y: &Array1<f64>, z: &Array1<f64>, a0: f64, b0: f64) -> Option<(f64, f64)> {
    let (mut a, mut b) = (a0, b0);
    for _ in 0..MAX_IRLS_ITER {
        let eta = x.mapv(|xi| (a + b * xi).clamp(-MAX_LINEAR_PREDICTOR, MAX_LINEAR_PREDICTOR));
        let mu = eta.mapv(f64::exp);
        let working = &eta + &((y - &mu) / &mu);
        let weights = z * &mu;
        let (a_new, b_new) = weighted_linear_fit(x, &working, &weights, 0.0)?;
        let change = (a_new - a).abs().max((b_new - b).abs());
        a = a_new;
        b = b_new;
        if change < IRLS_TOL {
            break;
        }
    }
    Some((a, b))
}

/// Weighted logistic IRLS with a small ridge so perfectly separated fits stay finite.
fn logistic_irls(x: &Array1<f64>, target: &Array1<f64>, c0: f64, d0: f64) -> Option<(f64, f64)> {
    let (mut c, mut d) = (c0, d0);
    for _ in 0..MAX_IRLS_ITER {
        let eta = x.mapv(|xi| (c + d * xi).clamp(-MAX_LINEAR_PREDICTOR, MAX_LINEAR_PREDICTOR));
        let p = eta.mapv(logistic);
        let weights = p.mapv(|pi| (pi * (1.0 - pi)).max(1e-10));
        let working = &eta + &((target - &p) / &weights);
        let (c_new, d_new) = weighted_linear_fit(x, &working, &weights, LOGISTIC_RIDGE)?;
        let change = (c_new - c).abs().max((d_new - d).abs());
        c = c_new;
        d = d_new;
        if change < IRLS_TOL {
            break;
        }
    }
    Some((c, d))
}

/// `φ` from `Var(y) = μ + φ μ²`, weighted by the NB responsibilities.
fn moment_overdispersion(x: &Array1<f64>, y: &Array1<f64>, z: &Array1<f64>, params: &MixtureParams) -> f64 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for ((&xi, &yi), &zi) in x.iter().zip(y.iter()).zip(z.iter()) {
        let mu = params.nb_mean(xi);
        numerator += zi * ((yi - mu).powi(2) - mu);
        denominator += zi * mu * mu;
    }
    if denominator > 0.0 {
        (numerator / denominator).clamp(MIN_OVERDISPERSION, MAX_OVERDISPERSION)
    } else {
        params.nb_overdispersion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Gamma, Poisson};

    /// Draw counts from the mixture with known parameters at evenly spread magnitudes.
    fn simulate(truth: &MixtureParams, n: usize, seed: u64) -> (Array1<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array1::from_shape_fn(n, |i| 0.2 + 5.0 * i as f64 / n as f64);
        let y = x.mapv(|xi| {
            let pi = truth.fail_probability(xi);
            let u: f64 = rng.random();
            let rate = if u < pi {
                truth.poisson_fail_rate
            } else {
                let size = 1.0 / truth.nb_overdispersion;
                let gamma = Gamma::new(size, truth.nb_mean(xi) / size).unwrap();
                gamma.sample(&mut rng)
            };
            if rate <= 0.0 {
                0.0
            } else {
                Poisson::new(rate).unwrap().sample(&mut rng)
            }
        });
        (y, x)
    }

    fn truth() -> MixtureParams {
        MixtureParams {
            corr_intercept: 0.0,
            corr_slope: 1.0,
            conc_intercept: 2.0,
            conc_slope: -2.5,
            nb_overdispersion: 0.2,
            poisson_fail_rate: 0.05,
        }
    }

    fn options() -> MixtureOptions {
        MixtureOptions {
            max_iterations: 500,
            tolerance: 1e-7,
            fixed_rate: None,
            segmentation_threshold: None,
        }
    }

    #[test]
    fn test_recovers_positive_slope() {
        let (y, x) = simulate(&truth(), 600, 11);
        let fit = fit_mixture(&y, &x, &options()).unwrap();
        assert!(fit.converged);
        assert!(fit.params.corr_slope > 0.6 && fit.params.corr_slope < 1.4);
        assert!(fit.params.conc_slope < 0.0);
        assert!(fit.log_likelihood.is_finite());
    }

    #[test]
    fn test_fixed_rate_is_kept() {
        let (y, x) = simulate(&truth(), 300, 5);
        let options = MixtureOptions {
            fixed_rate: Some(0.3),
            ..options()
        };
        let fit = fit_mixture(&y, &x, &options).unwrap();
        assert_eq!(fit.params.poisson_fail_rate, 0.3);
    }

    #[test]
    fn test_segmentation_pins_high_counts() {
        let (y, x) = simulate(&truth(), 300, 9);
        let options = MixtureOptions {
            segmentation_threshold: Some(4),
            ..options()
        };
        let fit = fit_mixture(&y, &x, &options).unwrap();
        for (&yi, &zi) in y.iter().zip(fit.amplified.iter()) {
            if yi >= 4.0 {
                assert_eq!(zi, 1.0);
            }
        }
    }

    #[test]
    fn test_constant_magnitudes_are_singular() {
        let y = Array1::from(vec![1.0, 4.0, 2.0, 0.0]);
        let x = Array1::from_elem(4, 1.5);
        assert!(fit_mixture(&y, &x, &options()).is_none());
    }
}
