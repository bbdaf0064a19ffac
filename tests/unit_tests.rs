use approx::assert_abs_diff_eq;
use single_scde::posterior::foldchange::{batch_marginalized, fold_change_posterior};
use single_scde::posterior::{cell_posterior, group_posterior};
use single_scde::simulation::{SimArgs, SimOut, simulate_two_groups};
use single_scde::{CellLabels, ErrorModel, ErrorModelTable, ExpressionPrior, MatrixScdeTests, ScdeConfig, build_prior};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_simulation(rseed: u64, fold_change: f64) -> SimOut {
    simulate_two_groups(&SimArgs {
        genes: 40,
        cells_per_group: 12,
        up_regulated: if fold_change == 1.0 { 0 } else { 1 },
        fold_change,
        rseed,
        ..SimArgs::default()
    })
    .unwrap()
}

fn true_prior(sim: &SimOut, config: &ScdeConfig) -> ExpressionPrior {
    build_prior(&sim.counts, &sim.models, config).unwrap()
}

#[cfg(test)]
mod quick_test {
    use super::*;

    #[test]
    fn check_prior_from_true_models() {
        init_logging();
        let sim = small_simulation(1, 4.0);
        let config = ScdeConfig::default().with_length_out(80);
        let prior = true_prior(&sim, &config);

        println!("grid: {} points, step {:.4} log10", prior.len(), prior.step());
        assert_eq!(prior.len(), 80);
        assert_abs_diff_eq!(prior.weights().sum(), 1.0, epsilon = 1e-10);
        assert!(prior.weights().iter().all(|&w| w >= 0.0));
        assert_eq!(prior.log_magnitudes()[0], 0.0);
    }

    #[test]
    fn check_single_cell_group_posterior() {
        let sim = small_simulation(2, 4.0);
        let config = ScdeConfig::default().with_length_out(60);
        let prior = true_prior(&sim, &config);
        let counts = single_scde::counts::gene_counts(&sim.counts, 3);

        for cell in [0usize, 7, 15] {
            let joint = group_posterior(&counts, &[cell], &sim.models, &prior).unwrap();
            let single = cell_posterior(counts[cell], sim.models.get(cell), &prior).unwrap();
            for (a, b) in joint.weights().iter().zip(single.weights().iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn check_fold_change_antisymmetry() {
        let sim = small_simulation(3, 4.0);
        let config = ScdeConfig::default().with_length_out(60);
        let prior = true_prior(&sim, &config);
        let counts = single_scde::counts::gene_counts(&sim.counts, 0);
        let a = group_posterior(&counts, &(0..12).collect::<Vec<_>>(), &sim.models, &prior).unwrap();
        let b = group_posterior(&counts, &(12..24).collect::<Vec<_>>(), &sim.models, &prior).unwrap();

        let ab = fold_change_posterior(&a, &b, &prior).unwrap();
        let ba = fold_change_posterior(&b, &a, &prior).unwrap();
        let n = ab.len();
        for k in 0..n {
            assert_abs_diff_eq!(ab.weights()[k], ba.weights()[n - 1 - k], epsilon = 1e-12);
            assert_abs_diff_eq!(ab.values()[k], -ab.values()[n - 1 - k], epsilon = 1e-12);
        }
        println!("mle A vs B: {:.3}, B vs A: {:.3}", ab.mode(), ba.mode());
        assert!(ab.mode() > 0.0);
        assert_abs_diff_eq!(ab.mode(), -ba.mode(), epsilon = 1e-12);
    }

    #[test]
    fn check_invalid_models_are_excluded() {
        let sim = small_simulation(4, 4.0);
        let config = ScdeConfig::default().with_length_out(60);
        let prior = true_prior(&sim, &config);

        let mut models: Vec<ErrorModel> = sim.models.iter().cloned().collect();
        models[2] = ErrorModel::failed("cell2", Some("group0".to_string()), "no informative peer cells");
        models[5].corr_slope = -0.5;
        let table = ErrorModelTable::new(models);
        assert_eq!(table.n_valid(), 22);
        assert_eq!(table.failures().len(), 2);

        let counts = single_scde::counts::gene_counts(&sim.counts, 1);
        let all = group_posterior(&counts, &(0..12).collect::<Vec<_>>(), &table, &prior).unwrap();
        let kept: Vec<usize> = (0..12).filter(|&c| c != 2 && c != 5).collect();
        let valid_only = group_posterior(&counts, &kept, &table, &prior).unwrap();
        assert_eq!(all, valid_only);
    }

    #[test]
    fn check_balanced_batches_leave_fold_change_unchanged() {
        let sim = small_simulation(5, 4.0);
        let config = ScdeConfig::default().with_length_out(60);
        let prior = true_prior(&sim, &config);

        // same batch composition in both groups
        let batches: Vec<usize> = (0..24).map(|c| c % 2).collect();
        let labels = sim.labels.clone().with_batches(batches).unwrap();
        let difference = sim
            .counts
            .test_gene_expression_difference(0, &labels, &sim.models, &prior, &config)
            .unwrap();
        let corrected = difference.batch_corrected.as_ref().unwrap();
        assert_eq!(corrected, &difference.fold_change);
        assert_eq!(batch_marginalized(&difference.fold_change, &[], 0.7).unwrap(), difference.fold_change);
    }

    #[test]
    fn check_labels_without_two_groups_fail() {
        let sim = small_simulation(6, 4.0);
        let config = ScdeConfig::default().with_length_out(40).with_n_randomizations(5);
        let prior = true_prior(&sim, &config);
        let one_group = CellLabels::from_groups(vec![Some(0); 24]);
        let err = sim
            .counts
            .differential_expression(&one_group, &sim.models, &prior, &config)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<single_scde::ScdeError>(),
            Some(single_scde::ScdeError::InvalidInput { .. })
        ));
    }
}
