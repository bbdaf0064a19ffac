//! Count likelihood of the NB + Poisson background mixture.

use statrs::function::factorial::ln_factorial;
use statrs::function::gamma::ln_gamma;

use crate::stats::log_sum_exp;

/// Log pmf of a negative binomial with the given mean and variance `mean + φ·mean²`.
pub fn ln_nb_pmf(y: u64, mean: f64, overdispersion: f64) -> f64 {
    if mean <= 0.0 {
        return if y == 0 { 0.0 } else { f64::NEG_INFINITY };
    }
    let size = 1.0 / overdispersion;
    let yf = y as f64;
    ln_gamma(yf + size) - ln_gamma(size) - ln_factorial(y) - size * (mean / size).ln_1p()
        + yf * (mean.ln() - (size + mean).ln())
}

pub fn ln_poisson_pmf(y: u64, rate: f64) -> f64 {
    if rate <= 0.0 {
        return if y == 0 { 0.0 } else { f64::NEG_INFINITY };
    }
    y as f64 * rate.ln() - rate - ln_factorial(y)
}

/// `ln[(1 - π)·NB(y; μ, φ) + π·Pois(y; λ)]`
pub fn ln_mixture_pmf(y: u64, mean: f64, overdispersion: f64, fail_probability: f64, rate: f64) -> f64 {
    let nb = (1.0 - fail_probability).ln() + ln_nb_pmf(y, mean, overdispersion);
    let background = fail_probability.ln() + ln_poisson_pmf(y, rate);
    log_sum_exp(&[nb, background])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_nb_pmf_sums_to_one() {
        let total: f64 = (0..2000).map(|y| ln_nb_pmf(y, 12.0, 0.3).exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_nb_approaches_poisson() {
        for y in [0u64, 3, 10] {
            assert_abs_diff_eq!(ln_nb_pmf(y, 4.0, 1e-9), ln_poisson_pmf(y, 4.0), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_mixture_limits() {
        let y = 7;
        assert_abs_diff_eq!(
            ln_mixture_pmf(y, 5.0, 0.2, 0.0, 0.1),
            ln_nb_pmf(y, 5.0, 0.2),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            ln_mixture_pmf(y, 5.0, 0.2, 1.0, 0.1),
            ln_poisson_pmf(y, 0.1),
            epsilon = 1e-12
        );
        assert_eq!(ln_nb_pmf(3, 0.0, 0.2), f64::NEG_INFINITY);
    }
}
