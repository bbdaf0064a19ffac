//! Size-preserving random relabelings for the empirical null distribution.
//!
//! Every gene draws from its own generator, seeded by mixing the run seed with the gene index,
//! so the null of a gene does not depend on which worker evaluates it or in which order.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::stats::mean_and_sd;

/// Null spreads at or below this value give a Z of 0.
pub const NULL_SD_EPSILON: f64 = 1e-12;

/// SplitMix64 finalizer over the run seed and the gene index.
///
/// Neighbouring `(seed, gene)` pairs land on unrelated streams, so runs with adjacent seeds do not
/// share relabelings.
pub fn gene_seed(seed: u64, gene: usize) -> u64 {
    let mut z = seed ^ (gene as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// One relabeling: positions assigned to group A and to group B.
#[derive(Debug, Clone, PartialEq)]
pub struct Relabeling {
    pub a: Vec<usize>,
    pub b: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct NullSampler {
    seed: u64,
    n_randomizations: usize,
}

impl NullSampler {
    pub fn new(seed: u64, n_randomizations: usize) -> Self {
        NullSampler {
            seed,
            n_randomizations,
        }
    }

    pub fn n_randomizations(&self) -> usize {
        self.n_randomizations
    }

    /// Generator of one gene's stream.
    pub fn gene_rng(&self, gene: usize) -> StdRng {
        StdRng::seed_from_u64(gene_seed(self.seed, gene))
    }

    /// Random splits of positions `0..n_total` into `n_a` and `n_total - n_a` positions.
    ///
    /// Draws are consumed in a fixed sequence, so the same gene always gets the same splits.
    pub fn relabelings(&self, gene: usize, n_a: usize, n_total: usize) -> Vec<Relabeling> {
        let mut rng = self.gene_rng(gene);
        let mut positions: Vec<usize> = (0..n_total).collect();
        (0..self.n_randomizations)
            .map(|_| {
                positions.shuffle(&mut rng);
                let (a, b) = positions.split_at(n_a.min(n_total));
                Relabeling {
                    a: a.to_vec(),
                    b: b.to_vec(),
                }
            })
            .collect()
    }
}

/// `(observed - mean) / sd` of the null sample, 0 when the null has no spread.
pub fn randomization_z(observed: f64, null: &[f64]) -> f64 {
    let (mean, sd) = mean_and_sd(null);
    if !(sd > NULL_SD_EPSILON) || !observed.is_finite() {
        return 0.0;
    }
    (observed - mean) / sd
}
