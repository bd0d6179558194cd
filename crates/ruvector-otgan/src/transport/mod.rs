//! Optimal transport between two uniform empirical distributions.
//!
//! [`ot_plan`] is the entry point. With `epsilon == 0` it solves the exact
//! linear program:
//!
//! ```text
//! min_P Σ P[i,j]·C[i,j]   s.t.  P·1 = 1/N,  Pᵀ·1 = 1/M,  P ≥ 0
//! ```
//!
//! Square problems go through the Hungarian algorithm (an optimal
//! permutation scaled by `1/N` is an optimal plan); rectangular problems go
//! through the transportation simplex on integer-scaled masses. With
//! `epsilon > 0` the entropy-regularised problem is solved by log-domain
//! Sinkhorn iterations.
//!
//! ## Modules
//!
//! - [`assignment`]: Hungarian algorithm for the N == M fast path
//! - [`simplex`]: exact transportation simplex (MODI pivoting)
//! - [`sinkhorn`]: log-stabilised Sinkhorn–Knopp

pub mod assignment;
pub mod simplex;
pub mod sinkhorn;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::config::EngineConfig;
use crate::error::{OtError, OtResult};

pub use assignment::hungarian_assignment;
pub use simplex::TransportSimplex;
pub use sinkhorn::SinkhornSolver;

/// A transport plan and its cost.
#[derive(Debug, Clone)]
pub struct TransportPlan {
    /// Plan matrix `P[i, j]` (N × M), total mass 1.
    pub plan: Array2<f64>,
    /// Total transport cost `Σ P ⊙ C`.
    pub cost: f64,
    /// Pivots (exact) or sweeps (Sinkhorn) performed.
    pub iterations: usize,
    /// L1 violation of the row and column marginals.
    pub marginal_error: f64,
    /// Whether the solver met its stopping criterion.
    pub converged: bool,
}

impl TransportPlan {
    /// Row sums `P·1`.
    pub fn row_marginals(&self) -> Array1<f64> {
        self.plan.sum_axis(Axis(1))
    }

    /// Column sums `Pᵀ·1`.
    pub fn col_marginals(&self) -> Array1<f64> {
        self.plan.sum_axis(Axis(0))
    }
}

/// Configured OT solver.
#[derive(Debug, Clone)]
pub struct OtSolver {
    epsilon: f64,
    sinkhorn_max_iterations: usize,
    sinkhorn_threshold: f64,
    max_pivots: usize,
}

impl OtSolver {
    /// Solver for regularisation `epsilon` (0 = exact) with default limits.
    pub fn new(epsilon: f64) -> Self {
        Self::from_config(epsilon, &EngineConfig::default())
    }

    /// Solver for regularisation `epsilon` with limits from `config`.
    pub fn from_config(epsilon: f64, config: &EngineConfig) -> Self {
        Self {
            epsilon,
            sinkhorn_max_iterations: config.sinkhorn_max_iterations,
            sinkhorn_threshold: config.sinkhorn_threshold,
            max_pivots: config.simplex_max_pivots,
        }
    }

    /// Regularisation strength.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Plan between uniform marginals for the given cost matrix.
    ///
    /// # Errors
    ///
    /// - [`OtError::InvalidParameter`] for a negative or NaN `epsilon`
    /// - [`OtError::EmptyInput`] when either side has no points
    /// - [`OtError::NonFiniteCost`] when `cost` holds NaN or infinity
    pub fn solve(&self, cost: ArrayView2<'_, f64>) -> OtResult<TransportPlan> {
        if !(self.epsilon >= 0.0) || self.epsilon.is_infinite() {
            return Err(OtError::invalid_parameter("epsilon", format!("must be finite and >= 0, got {}", self.epsilon)));
        }
        let (n, m) = cost.dim();
        if n == 0 || m == 0 {
            return Err(OtError::empty_input(format!("cost matrix is {n}x{m}")));
        }
        check_finite(&cost)?;

        if self.epsilon > 0.0 {
            let a = Array1::from_elem(n, 1.0 / n as f64);
            let b = Array1::from_elem(m, 1.0 / m as f64);
            return SinkhornSolver::new(self.epsilon, self.sinkhorn_max_iterations)
                .with_threshold(self.sinkhorn_threshold)
                .solve(cost, a.view(), b.view());
        }

        if n == m {
            let assignment = hungarian_assignment(cost);
            let mass = 1.0 / n as f64;
            let mut plan = Array2::zeros((n, m));
            for (i, j) in assignment {
                plan[[i, j]] = mass;
            }
            return Ok(finish_plan(plan, cost, n, true));
        }

        TransportSimplex::uniform(n, m)
            .with_max_pivots(self.max_pivots)
            .solve(cost)
    }
}

/// Transport plan between uniform marginals; `epsilon == 0` is exact.
pub fn ot_plan(cost: ArrayView2<'_, f64>, epsilon: f64) -> OtResult<TransportPlan> {
    OtSolver::new(epsilon).solve(cost)
}

/// Optimal transport cost `Σ P ⊙ C` between uniform marginals.
pub fn ot_cost(cost: ArrayView2<'_, f64>, epsilon: f64) -> OtResult<f64> {
    Ok(ot_plan(cost, epsilon)?.cost)
}

fn check_finite(cost: &ArrayView2<'_, f64>) -> OtResult<()> {
    match cost.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, col), &value)) => Err(OtError::NonFiniteCost { row, col, value }),
        None => Ok(()),
    }
}

/// L1 error of `plan` against uniform marginals.
pub(crate) fn uniform_marginal_error(plan: &Array2<f64>) -> f64 {
    let (n, m) = plan.dim();
    let a = 1.0 / n as f64;
    let b = 1.0 / m as f64;
    let rows: f64 = plan.sum_axis(Axis(1)).iter().map(|r| (r - a).abs()).sum();
    let cols: f64 = plan.sum_axis(Axis(0)).iter().map(|c| (c - b).abs()).sum();
    rows + cols
}

pub(crate) fn finish_plan(plan: Array2<f64>, cost: ArrayView2<'_, f64>, iterations: usize, converged: bool) -> TransportPlan {
    let total = (&plan * &cost).sum();
    let marginal_error = uniform_marginal_error(&plan);
    TransportPlan { plan, cost: total, iterations, marginal_error, converged }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn square_exact_plan_is_a_scaled_permutation() {
        let c = array![[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let plan = ot_plan(c.view(), 0.0).unwrap();
        // Optimal assignment: 0->1, 1->0, 2->2 with cost 1 + 2 + 2.
        assert_abs_diff_eq!(plan.cost, 5.0 / 3.0, epsilon = 1e-12);
        for v in plan.plan.iter() {
            assert!(*v == 0.0 || (*v - 1.0 / 3.0).abs() < 1e-15);
        }
        assert!(plan.converged);
    }

    #[test]
    fn rectangular_exact_plan_meets_marginals() {
        let c = array![[0.0, 1.0, 4.0], [1.0, 0.0, 1.0]];
        let plan = ot_plan(c.view(), 0.0).unwrap();
        for r in plan.row_marginals().iter() {
            assert_abs_diff_eq!(*r, 0.5, epsilon = 1e-12);
        }
        for c in plan.col_marginals().iter() {
            assert_abs_diff_eq!(*c, 1.0 / 3.0, epsilon = 1e-12);
        }
        // Row 0 ships 1/3 to col 0 and 1/6 to col 1, row 1 ships 1/6 to col 1 and 1/3 to col 2.
        assert_abs_diff_eq!(plan.cost, 1.0 / 6.0 + 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn non_finite_cost_is_reported() {
        let c = array![[0.0, f64::NAN], [1.0, 0.0]];
        match ot_plan(c.view(), 0.0) {
            Err(OtError::NonFiniteCost { row, col, .. }) => assert_eq!((row, col), (0, 1)),
            other => panic!("expected NonFiniteCost, got {other:?}"),
        }
        let c = array![[0.0, 1.0], [f64::INFINITY, 0.0]];
        assert!(matches!(ot_plan(c.view(), 0.5), Err(OtError::NonFiniteCost { row: 1, col: 0, .. })));
    }

    #[test]
    fn empty_cost_and_negative_epsilon_are_rejected() {
        let c = Array2::<f64>::zeros((0, 3));
        assert!(matches!(ot_plan(c.view(), 0.0), Err(OtError::EmptyInput { .. })));
        let c = array![[1.0]];
        assert!(matches!(ot_plan(c.view(), -1.0), Err(OtError::InvalidParameter { .. })));
    }

    #[test]
    fn single_point_carries_all_mass() {
        let c = array![[3.0, 5.0, 7.0]];
        let plan = ot_plan(c.view(), 0.0).unwrap();
        assert_abs_diff_eq!(plan.cost, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(plan.plan.sum(), 1.0, epsilon = 1e-12);
    }
}
