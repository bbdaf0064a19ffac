//! Multi-cell consensus of expression magnitudes for the robust genes of a fitting group.
//!
//! A single reference cell is unreliable because any cross-cell comparison can be distorted
//! by dropouts. Instead every peer of the fitted cell contributes to the reference magnitude
//! of a gene, weighted by how consistent its pairwise comparison with the cell is relative to
//! the other peers.

use ndarray::{Array1, Array2, Axis};

use crate::stats::{MAD_SCALE, mad, median};

/// Counts of the robust genes (rows) for the cells of one fitting group (columns).
#[derive(Debug, Clone)]
pub struct GroupBlock {
    counts: Array2<f64>,
    log_normalized: Array2<f64>,
}

impl GroupBlock {
    pub fn new(counts: Array2<f64>) -> Self {
        let sizes = counts.sum_axis(Axis(0));
        let median_size = median(sizes.as_slice().unwrap_or(&[])).unwrap_or(1.0);
        let size_factors = sizes.mapv(|s| {
            let f = s / median_size;
            if f > 0.0 && f.is_finite() { f } else { 1.0 }
        });

        let mut log_normalized = counts.clone();
        for (mut column, &factor) in log_normalized.axis_iter_mut(Axis(1)).zip(size_factors.iter()) {
            column.mapv_inplace(|y| (y / factor).ln_1p());
        }

        GroupBlock {
            counts,
            log_normalized,
        }
    }

    pub fn n_cells(&self) -> usize {
        self.counts.ncols()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    /// Observed counts of the cell at local position `cell`.
    pub fn cell_counts(&self, cell: usize) -> Array1<f64> {
        self.counts.column(cell).to_owned()
    }

    /// Weight of every peer (the cell itself gets zero).
    ///
    /// Peers whose median log-ratio against the cell deviates from the typical peer bias are
    /// down-weighted, as are peers with a noisy comparison.
    pub fn peer_weights(&self, cell: usize, spread_floor: f64) -> Array1<f64> {
        let n = self.n_cells();
        let own = self.log_normalized.column(cell);
        let own_counts = self.counts.column(cell);

        let mut bias = vec![f64::NAN; n];
        let mut spread = vec![f64::NAN; n];
        for peer in (0..n).filter(|&p| p != cell) {
            let peer_values = self.log_normalized.column(peer);
            let peer_counts = self.counts.column(peer);
            let residuals: Vec<f64> = (0..self.n_genes())
                .filter(|&g| own_counts[g] > 0.0 && peer_counts[g] > 0.0)
                .map(|g| own[g] - peer_values[g])
                .collect();
            if let Some(b) = median(&residuals) {
                bias[peer] = b;
                spread[peer] = mad(&residuals, b).unwrap_or(0.0);
            }
        }

        let observed: Vec<f64> = bias.iter().cloned().filter(|b| b.is_finite()).collect();
        let center = median(&observed).unwrap_or(0.0);
        let scale = mad(&observed, center).unwrap_or(0.0) * MAD_SCALE + 1e-6;

        Array1::from_shape_fn(n, |peer| {
            if peer == cell || !bias[peer].is_finite() {
                return 0.0;
            }
            let deviation = (bias[peer] - center) / scale;
            1.0 / (1.0 + deviation * deviation) / (spread[peer] + spread_floor)
        })
    }

    /// Consensus log magnitude of every robust gene as seen by the peers of `cell`.
    ///
    /// Returns `None` when no peer carries any weight.
    pub fn reference_magnitudes(&self, cell: usize, spread_floor: f64) -> Option<Array1<f64>> {
        let weights = self.peer_weights(cell, spread_floor);
        if weights.sum() <= 0.0 {
            return None;
        }
        let reference = Array1::from_shape_fn(self.n_genes(), |g| {
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (peer, &w) in weights.iter().enumerate() {
                if w > 0.0 && self.counts[[g, peer]] > 0.0 {
                    acc += w * self.log_normalized[[g, peer]];
                    norm += w;
                }
            }
            if norm > 0.0 { acc / norm } else { 0.0 }
        });
        Some(reference)
    }
}
