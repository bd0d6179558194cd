//! Discrete dual (Kantorovich) OT solver.
//!
//! Maximises over one potential `ψ_k` per reference point `x_k`:
//!
//! ```text
//! D(ψ) = mean_y [ min_k c(x_k, y) − ψ_k ] + mean_k ψ_k
//! ```
//!
//! Every step draws a minibatch of `y` without replacement, finds each
//! point's nearest neighbour under `c(x_k, y) − ψ_k` with a chunked search
//! over the reference set, and applies one Adam step to `−D`. The estimate
//! of the last step is returned; `n_steps` is a fixed budget.
//!
//! On a full batch `D(ψ)` is a lower bound on the OT cost for every `ψ`.

use ndarray::{s, Array1, ArrayView1, ArrayView2, Axis};
use rand::seq::index::sample;
use rand::Rng;
use tracing::debug;

use crate::distance::{pairwise_distance, BaseMetric};
use crate::error::{OtError, OtResult};
use crate::Diagnostics;

/// Diagnostic name reported by the dual solver.
pub const DUAL_DIAGNOSTIC: &str = "dual";

/// Settings of the discrete dual solver.
#[derive(Debug, Clone, PartialEq)]
pub struct DualConfig {
    /// Optimisation steps. Default: **500**.
    pub n_steps: usize,
    /// Minibatch size drawn from `y`; `None` uses all of `y`. Default: **None**.
    pub batch_size: Option<usize>,
    /// Adam learning rate. Default: **0.001**.
    pub lr: f64,
    /// Reference points per nearest-neighbour chunk. Default: **256**.
    pub nnb: usize,
    /// Ground cost. Default: **L2** (squared Euclidean).
    pub metric: BaseMetric,
    /// Keep `ψ` and the Adam moments between calls when the reference set
    /// size is unchanged. Default: **false**.
    pub warm_start: bool,
}

impl Default for DualConfig {
    fn default() -> Self {
        Self { n_steps: 500, batch_size: None, lr: 1e-3, nnb: 256, metric: BaseMetric::L2, warm_start: false }
    }
}

impl DualConfig {
    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> OtResult<()> {
        if self.n_steps == 0 {
            return Err(OtError::invalid_parameter("n_steps", "must be > 0"));
        }
        if self.batch_size == Some(0) {
            return Err(OtError::invalid_parameter("batch_size", "must be > 0"));
        }
        if !(self.lr > 0.0) || self.lr.is_infinite() {
            return Err(OtError::invalid_parameter("lr", "must be finite and > 0"));
        }
        if self.nnb == 0 {
            return Err(OtError::invalid_parameter("nnb", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nearest neighbours
// ---------------------------------------------------------------------------

/// Result of [`batched_nearest_neighbors`].
#[derive(Debug, Clone)]
pub struct NearestNeighbors {
    /// `min_k c(x_k, q) − ψ_k` per query.
    pub value: Array1<f64>,
    /// Arg-min reference index per query (first on ties).
    pub index: Vec<usize>,
}

/// Nearest reference point of every query under `c(x_k, q) − ψ_k`.
///
/// The reference set is processed in chunks of `chunk` rows so at most a
/// `queries × chunk` cost block is alive at once.
pub fn batched_nearest_neighbors(
    queries: ArrayView2<'_, f64>,
    reference: ArrayView2<'_, f64>,
    potential: ArrayView1<'_, f64>,
    chunk: usize,
    metric: BaseMetric,
) -> OtResult<NearestNeighbors> {
    if chunk == 0 {
        return Err(OtError::invalid_parameter("nnb", "must be > 0"));
    }
    if potential.len() != reference.nrows() {
        return Err(OtError::shape_mismatch(vec![reference.nrows()], vec![potential.len()]));
    }
    let q = queries.nrows();
    let mut value = Array1::from_elem(q, f64::INFINITY);
    let mut index = vec![0usize; q];

    for start in (0..reference.nrows()).step_by(chunk) {
        let end = (start + chunk).min(reference.nrows());
        // queries × chunk
        let block = pairwise_distance(queries, reference.slice(s![start..end, ..]), metric)?;
        for (row, costs) in block.outer_iter().enumerate() {
            for (offset, &c) in costs.iter().enumerate() {
                let candidate = c - potential[start + offset];
                if candidate < value[row] {
                    value[row] = candidate;
                    index[row] = start + offset;
                }
            }
        }
    }
    Ok(NearestNeighbors { value, index })
}

// ---------------------------------------------------------------------------
// Adam
// ---------------------------------------------------------------------------

/// Adam with the usual defaults (β₁ = 0.9, β₂ = 0.999, ε = 1e-8).
#[derive(Debug, Clone)]
struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    fn new(len: usize, lr: f64) -> Self {
        Self { lr, beta1: 0.9, beta2: 0.999, eps: 1e-8, m: Array1::zeros(len), v: Array1::zeros(len), t: 0 }
    }

    fn step(&mut self, params: &mut Array1<f64>, grad: &Array1<f64>) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        for k in 0..params.len() {
            let g = grad[k];
            self.m[k] = self.beta1 * self.m[k] + (1.0 - self.beta1) * g;
            self.v[k] = self.beta2 * self.v[k] + (1.0 - self.beta2) * g * g;
            let denom = (self.v[k] / bc2).sqrt() + self.eps;
            params[k] -= self.lr * (self.m[k] / bc1) / denom;
        }
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// Outcome of one [`DiscreteDualSolver::solve`] call.
#[derive(Debug, Clone)]
pub struct DualOutcome {
    /// Dual estimate of the final step.
    pub estimate: f64,
    /// Potentials after the final update.
    pub potentials: Array1<f64>,
    /// Steps performed.
    pub steps: usize,
}

/// Stateful dual solver. Owns `ψ` and the optimiser moments; not safe to
/// share between threads without a lock.
#[derive(Debug, Clone)]
pub struct DiscreteDualSolver {
    config: DualConfig,
    psi: Array1<f64>,
    adam: Adam,
}

impl DiscreteDualSolver {
    /// Validate `config` and create an idle solver.
    pub fn new(config: DualConfig) -> OtResult<Self> {
        config.validate()?;
        let lr = config.lr;
        Ok(Self { config, psi: Array1::zeros(0), adam: Adam::new(0, lr) })
    }

    /// Solver settings.
    pub fn config(&self) -> &DualConfig {
        &self.config
    }

    /// Potentials left by the last call.
    pub fn potentials(&self) -> ArrayView1<'_, f64> {
        self.psi.view()
    }

    /// Run `n_steps` of stochastic ascent with `x` as the reference set.
    pub fn solve<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
        rng: &mut R,
    ) -> OtResult<DualOutcome> {
        let (n, m) = (x.nrows(), y.nrows());
        if n == 0 || m == 0 {
            return Err(OtError::empty_input(format!("discrete dual on {n} and {m} samples")));
        }
        if x.ncols() != y.ncols() {
            return Err(OtError::DimensionMismatch { expected: x.ncols(), got: y.ncols(), context: "discrete dual" });
        }

        if !self.config.warm_start || self.psi.len() != n {
            self.psi = Array1::zeros(n);
            self.adam = Adam::new(n, self.config.lr);
        }

        let batch = self.config.batch_size.unwrap_or(m).min(m);
        let inv_n = 1.0 / n as f64;
        let mut estimate = f64::NAN;
        let mut grad = Array1::<f64>::zeros(n);

        for _ in 0..self.config.n_steps {
            let picks = sample(rng, m, batch).into_vec();
            let minibatch = y.select(Axis(0), &picks);
            let nn = batched_nearest_neighbors(minibatch.view(), x, self.psi.view(), self.config.nnb, self.config.metric)?;

            estimate = nn.value.sum() / batch as f64 + self.psi.sum() * inv_n;

            // ∂(−D)/∂ψ_k = count_k / B − 1/N
            grad.fill(-inv_n);
            for &k in &nn.index {
                grad[k] += 1.0 / batch as f64;
            }
            self.adam.step(&mut self.psi, &grad);
        }

        debug!(steps = self.config.n_steps, estimate, n, m, batch, "discrete dual finished");
        Ok(DualOutcome { estimate, potentials: self.psi.clone(), steps: self.config.n_steps })
    }
}

/// One-shot dual estimate with freshly zeroed potentials.
pub fn discrete_dual<R: Rng + ?Sized>(
    x: ArrayView2<'_, f64>,
    y: ArrayView2<'_, f64>,
    config: &DualConfig,
    rng: &mut R,
) -> OtResult<(f64, Diagnostics)> {
    let mut solver = DiscreteDualSolver::new(DualConfig { warm_start: false, ..config.clone() })?;
    let outcome = solver.solve(x, y, rng)?;
    let mut diagnostics = Diagnostics::new();
    diagnostics.insert(DUAL_DIAGNOSTIC.to_string(), outcome.estimate);
    Ok((outcome.estimate, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn chunked_search_matches_brute_force() {
        let x = array![[0.0, 0.0], [1.0, 1.0], [4.0, 0.0], [2.0, 2.0], [-1.0, 3.0]];
        let q = array![[0.9, 1.2], [3.5, 0.1], [-2.0, 2.0]];
        let psi = array![0.0, 0.5, -0.2, 1.0, 0.0];
        let full = batched_nearest_neighbors(q.view(), x.view(), psi.view(), 100, BaseMetric::L2).unwrap();
        for chunk in 1..=5 {
            let nn = batched_nearest_neighbors(q.view(), x.view(), psi.view(), chunk, BaseMetric::L2).unwrap();
            assert_eq!(nn.index, full.index, "chunk {chunk}");
            for (a, b) in nn.value.iter().zip(full.value.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }
        assert_eq!(full.index, vec![1, 2, 4]);
    }

    #[test]
    fn identical_sets_give_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = array![[0.0, 1.0], [2.0, 2.0], [5.0, -1.0]];
        let cfg = DualConfig { n_steps: 50, ..DualConfig::default() };
        let (d, diag) = discrete_dual(x.view(), x.view(), &cfg, &mut rng).unwrap();
        assert_abs_diff_eq!(d, 0.0, epsilon = 1e-12);
        assert_eq!(diag[DUAL_DIAGNOSTIC], d);
    }

    #[test]
    fn full_batch_ascent_reaches_the_transport_cost() {
        // OT cost: (0→1) + (10→2) = (1 + 64) / 2 = 32.5; ψ = 0 starts at 2.5.
        let mut rng = StdRng::seed_from_u64(2);
        let x = array![[0.0], [10.0]];
        let y = array![[1.0], [2.0]];
        let cfg = DualConfig { n_steps: 500, lr: 0.5, ..DualConfig::default() };
        let (d, _) = discrete_dual(x.view(), y.view(), &cfg, &mut rng).unwrap();
        assert_abs_diff_eq!(d, 32.5, epsilon = 1e-6);
    }

    #[test]
    fn potentials_reset_unless_warm_started() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = array![[0.0], [10.0]];
        let y = array![[1.0], [2.0]];
        let cfg = DualConfig { n_steps: 5, lr: 0.5, ..DualConfig::default() };

        let mut cold = DiscreteDualSolver::new(cfg.clone()).unwrap();
        let first = cold.solve(x.view(), y.view(), &mut rng).unwrap();
        let second = cold.solve(x.view(), y.view(), &mut rng).unwrap();
        assert_abs_diff_eq!(first.estimate, second.estimate, epsilon = 1e-12);

        let mut warm = DiscreteDualSolver::new(DualConfig { warm_start: true, ..cfg }).unwrap();
        let first = warm.solve(x.view(), y.view(), &mut rng).unwrap();
        let second = warm.solve(x.view(), y.view(), &mut rng).unwrap();
        assert!(second.estimate > first.estimate, "{} <= {}", second.estimate, first.estimate);
    }

    #[test]
    fn minibatch_is_capped_at_the_sample_count() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = Array2::from_shape_fn((6, 2), |(i, j)| (i * 2 + j) as f64);
        let y = x.mapv(|v| v + 0.5);
        let cfg = DualConfig { n_steps: 3, batch_size: Some(100), nnb: 2, ..DualConfig::default() };
        let (d, _) = discrete_dual(x.view(), y.view(), &cfg, &mut rng).unwrap();
        assert!(d.is_finite());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(DiscreteDualSolver::new(DualConfig { n_steps: 0, ..DualConfig::default() }).is_err());
        assert!(DiscreteDualSolver::new(DualConfig { nnb: 0, ..DualConfig::default() }).is_err());
        assert!(DiscreteDualSolver::new(DualConfig { batch_size: Some(0), ..DualConfig::default() }).is_err());
        assert!(DiscreteDualSolver::new(DualConfig { lr: -1.0, ..DualConfig::default() }).is_err());
    }
}
