//! Access helpers for the genes × cells count matrix.
//!
//! Counts arrive as a `CsrMatrix` whose rows are genes and whose columns are cells. Values are
//! stored in a float type but must be non-negative integers; ingestion is expected to have
//! removed degenerate rows and columns already, so only basic checks happen here.

use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use single_utilities::traits::FloatOpsTS;

use crate::error::ScdeError;

/// Shape and value checks: non-empty, finite, non-negative, integral.
pub fn validate_counts<T>(matrix: &CsrMatrix<T>) -> Result<(), ScdeError>
where
    T: FloatOpsTS,
{
    if matrix.nrows() == 0 || matrix.ncols() == 0 {
        return Err(ScdeError::invalid_input(format!(
            "Count matrix must not be empty, got {} genes x {} cells",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    for (gene, cell, value) in matrix.triplet_iter() {
        let v = value.to_f64().unwrap_or(f64::NAN);
        if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
            return Err(ScdeError::invalid_input(format!(
                "Count at gene {} cell {} is not a non-negative integer: {}",
                gene, cell, v
            )));
        }
    }
    Ok(())
}

/// Dense counts of one gene across all cells.
pub fn gene_counts<T>(matrix: &CsrMatrix<T>, gene: usize) -> Vec<u64>
where
    T: FloatOpsTS,
{
    let mut counts = vec![0u64; matrix.ncols()];
    let row = matrix.row(gene);
    for (&cell, value) in row.col_indices().iter().zip(row.values().iter()) {
        counts[cell] = value.to_f64().unwrap_or(0.0).round() as u64;
    }
    counts
}

/// Dense `genes.len() × n_cells` block of the selected genes.
pub fn dense_rows<T>(matrix: &CsrMatrix<T>, genes: &[usize]) -> Array2<f64>
where
    T: FloatOpsTS,
{
    let mut block = Array2::<f64>::zeros((genes.len(), matrix.ncols()));
    for (i, &gene) in genes.iter().enumerate() {
        let row = matrix.row(gene);
        for (&cell, value) in row.col_indices().iter().zip(row.values().iter()) {
            block[[i, cell]] = value.to_f64().unwrap_or(0.0).round();
        }
    }
    block
}

/// Total counts per cell over all genes.
pub fn library_sizes<T>(matrix: &CsrMatrix<T>) -> Vec<f64>
where
    T: FloatOpsTS,
{
    let mut sizes = vec![0.0; matrix.ncols()];
    for (_, cell, value) in matrix.triplet_iter() {
        sizes[cell] += value.to_f64().unwrap_or(0.0);
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn create_test_matrix() -> CsrMatrix<f64> {
        // 3 genes x 4 cells
        let rows = vec![0, 0, 1, 2, 2, 2];
        let cols = vec![0, 3, 1, 0, 1, 2];
        let vals = vec![5.0, 2.0, 7.0, 1.0, 1.0, 4.0];
        let coo = CooMatrix::try_from_triplets(3, 4, rows, cols, vals).unwrap();
        CsrMatrix::from(&coo)
    }

    #[test]
    fn test_gene_counts_and_library_sizes() {
        let matrix = create_test_matrix();
        assert_eq!(gene_counts(&matrix, 0), vec![5, 0, 0, 2]);
        assert_eq!(gene_counts(&matrix, 2), vec![1, 1, 4, 0]);
        assert_eq!(library_sizes(&matrix), vec![6.0, 8.0, 4.0, 2.0]);

        let block = dense_rows(&matrix, &[2, 1]);
        assert_eq!(block.dim(), (2, 4));
        assert_eq!(block[[0, 2]], 4.0);
        assert_eq!(block[[1, 1]], 7.0);
    }

    #[test]
    fn test_validate_counts() {
        assert!(validate_counts(&create_test_matrix()).is_ok());

        let coo = CooMatrix::try_from_triplets(1, 2, vec![0, 0], vec![0, 1], vec![1.5, 2.0]).unwrap();
        assert!(validate_counts(&CsrMatrix::from(&coo)).is_err());

        let coo = CooMatrix::try_from_triplets(1, 2, vec![0], vec![1], vec![-1.0]).unwrap();
        assert!(validate_counts(&CsrMatrix::from(&coo)).is_err());
    }
}
