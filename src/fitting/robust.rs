//! Selection of genes that are reliably detected within a fitting group.

use nalgebra_sparse::CsrMatrix;
use single_utilities::traits::FloatOpsTS;
use std::cmp::Ordering;

use crate::config::ScdeConfig;
use crate::counts::library_sizes;
use crate::error::ScdeError;
use crate::labels::{CellLabels, FittingGroup};
use crate::stats::{MAD_SCALE, mad, median};

/// Robust genes of one fitting group, sorted by gene index.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustGeneSet {
    pub group: FittingGroup,
    pub genes: Vec<usize>,
}

/// Select the robust genes of every fitting group defined by `config.groups`.
///
/// Fails with [`ScdeError::InsufficientRobustGenes`] as soon as one group falls short.
pub fn select_robust_genes<T>(
    matrix: &CsrMatrix<T>,
    labels: &CellLabels,
    config: &ScdeConfig,
) -> anyhow::Result<Vec<RobustGeneSet>>
where
    T: FloatOpsTS,
{
    config.validate()?;
    labels.check_cells(matrix.ncols())?;

    let sizes = library_sizes(matrix);
    let mut sets = Vec::new();
    for group in labels.fitting_groups(config.groups) {
        let genes = robust_genes_for_group(matrix, &group, &sizes, config)?;
        sets.push(RobustGeneSet { group, genes });
    }
    Ok(sets)
}

/// Cells of the group whose log library size is not an extreme outlier.
pub(crate) fn non_outlier_cells(cells: &[usize], sizes: &[f64], mad_multiplier: f64) -> Vec<usize> {
    let log_sizes: Vec<f64> = cells
        .iter()
        .filter(|&&c| sizes[c] > 0.0)
        .map(|&c| sizes[c].ln())
        .collect();
    let Some(center) = median(&log_sizes) else {
        return Vec::new();
    };
    let spread = mad(&log_sizes, center).unwrap_or(0.0) * MAD_SCALE;

    cells
        .iter()
        .copied()
        .filter(|&c| {
            if sizes[c] <= 0.0 {
                return false;
            }
            spread <= 0.0 || (sizes[c].ln() - center).abs() <= mad_multiplier * spread
        })
        .collect()
}

pub(crate) fn robust_genes_for_group<T>(
    matrix: &CsrMatrix<T>,
    group: &FittingGroup,
    sizes: &[f64],
    config: &ScdeConfig,
) -> Result<Vec<usize>, ScdeError>
where
    T: FloatOpsTS,
{
    let kept = non_outlier_cells(&group.cells, sizes, config.outlier_mad_multiplier);
    let insufficient = |found: usize| ScdeError::InsufficientRobustGenes {
        group: group.label.clone(),
        found,
        required: config.min_robust_genes,
    };
    if kept.is_empty() {
        return Err(insufficient(0));
    }

    let mut in_group = vec![false; matrix.ncols()];
    for &c in kept.iter() {
        in_group[c] = true;
    }
    let n_kept = kept.len() as f64;
    let required_detections = (config.robust_detection_fraction * n_kept).ceil() as usize;
    let threshold = config.min_count_threshold as f64;

    let mut candidates: Vec<(usize, f64)> = Vec::new();
    for gene in 0..matrix.nrows() {
        let row = matrix.row(gene);
        let mut detections = 0usize;
        let mut total = 0.0;
        for (&cell, value) in row.col_indices().iter().zip(row.values().iter()) {
            if !in_group[cell] {
                continue;
            }
            let v = value.to_f64().unwrap_or(0.0);
            total += v;
            if v >= threshold {
                detections += 1;
            }
        }
        if detections >= required_detections.max(1) {
            candidates.push((gene, total / n_kept));
        }
    }

    // Highest mean first, lower index wins ties
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    candidates.truncate(config.max_robust_genes);

    if candidates.len() < config.min_robust_genes {
        return Err(insufficient(candidates.len()));
    }

    let mut genes: Vec<usize> = candidates.into_iter().map(|(g, _)| g).collect();
    genes.sort();
    Ok(genes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    /// 6 genes x 6 cells; genes 0-2 detected everywhere, gene 3 in half the cells,
    /// genes 4-5 barely detected. Cell 5 has a huge library and is an outlier.
    fn create_test_matrix() -> CsrMatrix<f64> {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for cell in 0..6 {
            let scale = if cell == 5 { 500.0 } else { 1.0 };
            for gene in 0..3 {
                rows.push(gene);
                cols.push(cell);
                vals.push(scale * (10.0 + gene as f64));
            }
            if cell % 2 == 0 {
                rows.push(3);
                cols.push(cell);
                vals.push(scale * 3.0);
            }
        }
        rows.push(4);
        cols.push(0);
        vals.push(1.0);
        rows.push(5);
        cols.push(5);
        vals.push(900.0);
        let coo = CooMatrix::try_from_triplets(6, 6, rows, cols, vals).unwrap();
        CsrMatrix::from(&coo)
    }

    fn config() -> ScdeConfig {
        ScdeConfig::default().with_min_robust_genes(2)
    }

    #[test]
    fn test_outlier_cells_are_excluded() {
        let matrix = create_test_matrix();
        let sizes = library_sizes(&matrix);
        let kept = non_outlier_cells(&[0, 1, 2, 3, 4, 5], &sizes, 5.0);
        assert!(!kept.contains(&5));
        assert_eq!(kept.len(), 5);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let matrix = create_test_matrix();
        let labels = CellLabels::from_groups(vec![Some(0); 6]);

        let first = select_robust_genes(&matrix, &labels, &config()).unwrap();
        let second = select_robust_genes(&matrix, &labels, &config()).unwrap();
        assert_eq!(first, second);
        // gene 3 is seen in 3 of 5 kept cells, gene 5 only in the outlier
        assert_eq!(first[0].genes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_max_robust_genes_keeps_highest_means() {
        let matrix = create_test_matrix();
        let labels = CellLabels::from_groups(vec![Some(0); 6]);
        let config = config().with_max_robust_genes(2);
        let sets = select_robust_genes(&matrix, &labels, &config).unwrap();
        assert_eq!(sets[0].genes, vec![1, 2]);
    }

    #[test]
    fn test_insufficient_robust_genes() {
        let matrix = create_test_matrix();
        let labels = CellLabels::from_groups(vec![Some(0); 6]);
        let config = ScdeConfig::default().with_min_robust_genes(5).with_max_robust_genes(10);
        let err = select_robust_genes(&matrix, &labels, &config).unwrap_err();
        match err.downcast_ref::<ScdeError>() {
            Some(ScdeError::InsufficientRobustGenes { found, required, .. }) => {
                assert_eq!(*found, 4);
                assert_eq!(*required, 5);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
