//! Synthetic two-group count data drawn from the NB + Poisson background mixture.
//!
//! ```text
//! x(g, c) = ln(1 + e(g) · f(g, c))
//! y(g, c) ~ (1 - π_c(x)) · NB(μ_c(x), φ_c) + π_c(x) · Pois(λ_c)
//! ```
//!
//! `e(g)` is a log-uniform base expression level, `f(g, c)` the fold change of the
//! up-regulated genes in group 0, and every cell has its own known error model.

use log::info;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Poisson, Uniform};

use crate::fitting::{ErrorModel, ErrorModelTable};
use crate::labels::CellLabels;

#[derive(Debug, Clone)]
pub struct SimArgs {
    pub genes: usize,
    pub cells_per_group: usize,
    /// Number of batch levels; cells are assigned round-robin within each group, 0 for none
    pub batches: usize,
    /// The first `up_regulated` genes are multiplied by `fold_change` in group 0
    pub up_regulated: usize,
    pub fold_change: f64,
    /// Range of the base expected counts
    pub min_expression: f64,
    pub max_expression: f64,
    pub overdispersion: f64,
    pub poisson_fail_rate: f64,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        SimArgs {
            genes: 200,
            cells_per_group: 20,
            batches: 0,
            up_regulated: 1,
            fold_change: 4.0,
            min_expression: 2.0,
            max_expression: 200.0,
            overdispersion: 0.2,
            poisson_fail_rate: 0.05,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    pub counts: CsrMatrix<f64>,
    pub labels: CellLabels,
    /// Error models the counts were drawn from
    pub models: ErrorModelTable,
    /// Base expected count of every gene
    pub expression: Array1<f64>,
    pub up_regulated: Vec<usize>,
}

fn draw_count(model: &ErrorModel, x: f64, rng: &mut StdRng) -> anyhow::Result<f64> {
    let u: f64 = rng.random();
    let rate = if u < model.fail_probability(x) {
        model.poisson_fail_rate
    } else {
        let size = 1.0 / model.nb_overdispersion;
        Gamma::new(size, model.nb_mean(x) / size)
            .map_err(|e| anyhow::anyhow!("invalid gamma parameters: {}", e))?
            .sample(rng)
    };
    if rate <= 0.0 {
        return Ok(0.0);
    }
    Ok(Poisson::new(rate)
        .map_err(|e| anyhow::anyhow!("invalid Poisson rate {}: {}", rate, e))?
        .sample(rng))
}

/// Generate a two-group dataset with known per-cell error models.
///
/// Group 0 occupies the first `cells_per_group` columns, group 1 the rest.
pub fn simulate_two_groups(args: &SimArgs) -> anyhow::Result<SimOut> {
    if args.genes == 0 || args.cells_per_group == 0 {
        return Err(anyhow::anyhow!("Simulation needs at least one gene and one cell per group"));
    }
    if !(args.min_expression > 0.0 && args.max_expression >= args.min_expression) {
        return Err(anyhow::anyhow!("Invalid expression range"));
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let n_cells = 2 * args.cells_per_group;

    let log_range = Uniform::new_inclusive(args.min_expression.ln(), args.max_expression.ln())
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let expression = Array1::from_shape_fn(args.genes, |_| log_range.sample(&mut rng).exp());

    let slope = Uniform::new(0.85, 1.15).map_err(|e| anyhow::anyhow!("{}", e))?;
    let intercept = Uniform::new(-0.3, 0.3).map_err(|e| anyhow::anyhow!("{}", e))?;
    let conc_intercept = Uniform::new(1.0, 2.0).map_err(|e| anyhow::anyhow!("{}", e))?;
    let conc_slope = Uniform::new(-3.0, -2.0).map_err(|e| anyhow::anyhow!("{}", e))?;
    let models: Vec<ErrorModel> = (0..n_cells)
        .map(|c| {
            ErrorModel::new(
                format!("cell{}", c),
                slope.sample(&mut rng),
                intercept.sample(&mut rng),
                conc_slope.sample(&mut rng),
                conc_intercept.sample(&mut rng),
                args.overdispersion,
                args.poisson_fail_rate,
            )
        })
        .collect();

    let up_regulated: Vec<usize> = (0..args.up_regulated.min(args.genes)).collect();
    let mut coo = CooMatrix::new(args.genes, n_cells);
    for (c, model) in models.iter().enumerate() {
        let in_group_a = c < args.cells_per_group;
        for g in 0..args.genes {
            let fold = if in_group_a && g < up_regulated.len() {
                args.fold_change
            } else {
                1.0
            };
            let x = (expression[g] * fold).ln_1p();
            let y = draw_count(model, x, &mut rng)?;
            if y > 0.0 {
                coo.push(g, c, y);
            }
        }
    }

    let groups = (0..n_cells)
        .map(|c| Some(if c < args.cells_per_group { 0 } else { 1 }))
        .collect();
    let mut labels = CellLabels::from_groups(groups);
    if args.batches > 0 {
        let batches = (0..n_cells).map(|c| (c % args.cells_per_group) % args.batches).collect();
        labels = labels.with_batches(batches)?;
    }

    info!(
        "simulated {} genes x {} cells, {} up-regulated {}-fold in group 0",
        args.genes,
        n_cells,
        up_regulated.len(),
        args.fold_change
    );

    Ok(SimOut {
        counts: CsrMatrix::from(&coo),
        labels,
        models: ErrorModelTable::new(models),
        expression,
        up_regulated,
    })
}
