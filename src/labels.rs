use std::collections::HashSet;

use crate::config::FitGrouping;
use crate::error::ScdeError;

/// Per-cell annotations: a unique name, an optional group and an optional batch.
///
/// Cells are indexed by their column in the count matrix.
#[derive(Debug, Clone)]
pub struct CellLabels {
    names: Vec<String>,
    groups: Vec<Option<usize>>,
    batches: Option<Vec<usize>>,
}

/// A set of cells fitted together.
#[derive(Debug, Clone, PartialEq)]
pub struct FittingGroup {
    pub label: String,
    pub cells: Vec<usize>,
}

/// The two groups compared by the differential expression test.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub group_a: usize,
    pub group_b: usize,
    pub cells_a: Vec<usize>,
    pub cells_b: Vec<usize>,
}

impl CellLabels {
    pub fn new(names: Vec<String>, groups: Vec<Option<usize>>) -> Result<Self, ScdeError> {
        if names.len() != groups.len() {
            return Err(ScdeError::invalid_input(format!(
                "{} cell names but {} group assignments",
                names.len(),
                groups.len()
            )));
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in names.iter() {
            if !seen.insert(name.as_str()) {
                return Err(ScdeError::invalid_input(format!("duplicate cell name {}", name)));
            }
        }
        Ok(CellLabels {
            names,
            groups,
            batches: None,
        })
    }

    /// Cells named `cell0`, `cell1`, ... in column order.
    pub fn from_groups(groups: Vec<Option<usize>>) -> Self {
        let names = (0..groups.len()).map(|i| format!("cell{}", i)).collect();
        CellLabels {
            names,
            groups,
            batches: None,
        }
    }

    pub fn with_batches(mut self, batches: Vec<usize>) -> Result<Self, ScdeError> {
        if batches.len() != self.names.len() {
            return Err(ScdeError::invalid_input(format!(
                "{} batch assignments for {} cells",
                batches.len(),
                self.names.len()
            )));
        }
        self.batches = Some(batches);
        Ok(self)
    }

    pub fn n_cells(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, cell: usize) -> &str {
        &self.names[cell]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn group(&self, cell: usize) -> Option<usize> {
        self.groups[cell]
    }

    pub fn groups(&self) -> &[Option<usize>] {
        &self.groups
    }

    pub fn batches(&self) -> Option<&[usize]> {
        self.batches.as_deref()
    }

    pub fn has_batches(&self) -> bool {
        self.batches.is_some()
    }

    /// Sorted distinct group ids, unassigned cells ignored.
    pub fn unique_groups(&self) -> Vec<usize> {
        let mut unique_groups: Vec<usize> = self.groups.iter().flatten().copied().collect();
        unique_groups.sort();
        unique_groups.dedup();
        unique_groups
    }

    /// Column indices of the cells assigned to `group`.
    pub fn group_indices(&self, group: usize) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter_map(|(i, &g)| if g == Some(group) { Some(i) } else { None })
            .collect()
    }

    /// Partition of the cells for error model fitting.
    pub fn fitting_groups(&self, grouping: FitGrouping) -> Vec<FittingGroup> {
        match grouping {
            FitGrouping::Pooled => vec![FittingGroup {
                label: "pooled".to_string(),
                cells: (0..self.n_cells()).collect(),
            }],
            FitGrouping::PerGroup => self
                .unique_groups()
                .into_iter()
                .map(|g| FittingGroup {
                    label: format!("group{}", g),
                    cells: self.group_indices(g),
                })
                .collect(),
        }
    }

    /// The two groups to compare; the lower group id is group A.
    pub fn comparison(&self) -> Result<Comparison, ScdeError> {
        let unique_groups = self.unique_groups();
        if unique_groups.len() != 2 {
            return Err(ScdeError::invalid_input(format!(
                "Exactly two groups are required for a comparison, found {}",
                unique_groups.len()
            )));
        }
        let (group_a, group_b) = (unique_groups[0], unique_groups[1]);
        Ok(Comparison {
            group_a,
            group_b,
            cells_a: self.group_indices(group_a),
            cells_b: self.group_indices(group_b),
        })
    }

    pub(crate) fn check_cells(&self, n_cells: usize) -> Result<(), ScdeError> {
        if self.n_cells() != n_cells {
            return Err(ScdeError::invalid_input(format!(
                "Labels describe {} cells but the count matrix has {} columns",
                self.n_cells(),
                n_cells
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_groups_and_indices() {
        let labels = CellLabels::from_groups(vec![Some(2), None, Some(0), Some(2), Some(0)]);
        assert_eq!(labels.unique_groups(), vec![0, 2]);
        assert_eq!(labels.group_indices(2), vec![0, 3]);

        let comparison = labels.comparison().unwrap();
        assert_eq!(comparison.group_a, 0);
        assert_eq!(comparison.cells_a, vec![2, 4]);
        assert_eq!(comparison.cells_b, vec![0, 3]);
    }

    #[test]
    fn test_fitting_groups() {
        let labels = CellLabels::from_groups(vec![Some(1), None, Some(1), Some(3)]);
        let pooled = labels.fitting_groups(FitGrouping::Pooled);
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].cells, vec![0, 1, 2, 3]);

        let per_group = labels.fitting_groups(FitGrouping::PerGroup);
        assert_eq!(per_group.len(), 2);
        assert_eq!(per_group[0].cells, vec![0, 2]);
        assert_eq!(per_group[1].label, "group3");
    }

    #[test]
    fn test_invalid_labels() {
        let names = vec!["a".to_string(), "a".to_string()];
        assert!(CellLabels::new(names, vec![Some(0), Some(1)]).is_err());

        let labels = CellLabels::from_groups(vec![Some(0), Some(1), Some(2)]);
        assert!(labels.comparison().is_err());
        assert!(labels.with_batches(vec![0]).is_err());
    }
}
