//! Log-Stabilized Sinkhorn Algorithm
//!
//! Solves the entropic-regularised transport problem
//!
//! min_{P ∈ Π(a,b)} ⟨P, C⟩ − ε H(P)
//!
//! by alternately rescaling rows and columns of the Gibbs kernel
//! `K = exp(−C/ε)`. The scalings are kept as `log u`, `log v` and
//! normalised with log-sum-exp, so small `ε` does not underflow `K`.
//!
//! Hitting the iteration cap is not an error: the last iterate is returned
//! with `converged == false`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::{debug, warn};

use super::{check_finite, TransportPlan};
use crate::error::{OtError, OtResult};

/// Floor for `ln` of a zero weight.
const LOG_MIN: f64 = -700.0;

/// Stable `log Σ exp(x_i)`.
pub(crate) fn log_sum_exp<I: IntoIterator<Item = f64> + Clone>(values: I) -> f64 {
    let max_val = values.clone().into_iter().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = values.into_iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Log-stabilized Sinkhorn solver for entropic optimal transport.
#[derive(Debug, Clone)]
pub struct SinkhornSolver {
    /// Regularization ε.
    regularization: f64,
    /// Maximum sweeps.
    max_iterations: usize,
    /// Convergence threshold on the L1 marginal error.
    threshold: f64,
}

impl SinkhornSolver {
    /// Create a new Sinkhorn solver.
    ///
    /// # Arguments
    /// * `regularization` - Entropy regularization ε (> 0)
    /// * `max_iterations` - Maximum Sinkhorn sweeps
    pub fn new(regularization: f64, max_iterations: usize) -> Self {
        Self {
            regularization,
            max_iterations: max_iterations.max(1),
            threshold: 1e-9,
        }
    }

    /// Set convergence threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.max(1e-15);
        self
    }

    /// Solve for marginals `a` (rows) and `b` (columns); both are
    /// normalised to unit mass first.
    pub fn solve(&self, cost: ArrayView2<'_, f64>, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> OtResult<TransportPlan> {
        if !(self.regularization > 0.0) || self.regularization.is_infinite() {
            return Err(OtError::invalid_parameter("epsilon", "Sinkhorn needs a finite regularization > 0"));
        }
        let (n, m) = cost.dim();
        if n == 0 || m == 0 {
            return Err(OtError::empty_input("cost matrix"));
        }
        if a.len() != n || b.len() != m {
            return Err(OtError::shape_mismatch(vec![a.len(), b.len()], vec![n, m]));
        }
        if a.iter().chain(b.iter()).any(|&w| !(w >= 0.0)) {
            return Err(OtError::invalid_parameter("weights", "marginals must be non-negative"));
        }
        check_finite(&cost)?;

        let (sum_a, sum_b) = (a.sum(), b.sum());
        if !(sum_a > 0.0) || !(sum_b > 0.0) {
            return Err(OtError::invalid_parameter("weights", "marginals must have positive mass"));
        }
        let a: Array1<f64> = a.mapv(|w| w / sum_a);
        let b: Array1<f64> = b.mapv(|w| w / sum_b);
        let log_a = a.mapv(|w| w.ln().max(LOG_MIN));
        let log_b = b.mapv(|w| w.ln().max(LOG_MIN));

        // log K = −C/ε
        let log_k: Array2<f64> = cost.mapv(|c| -c / self.regularization);

        let mut log_u = Array1::<f64>::zeros(n);
        let mut log_v = Array1::<f64>::zeros(m);
        let mut iterations = 0;
        let mut converged = false;
        let mut marginal_error = f64::INFINITY;

        for iter in 0..self.max_iterations {
            iterations = iter + 1;

            for i in 0..n {
                let row = log_k.row(i);
                log_u[i] = log_a[i] - log_sum_exp(row.iter().zip(log_v.iter()).map(|(k, v)| k + v));
            }
            for j in 0..m {
                let col = log_k.column(j);
                log_v[j] = log_b[j] - log_sum_exp(col.iter().zip(log_u.iter()).map(|(k, u)| k + u));
            }

            // Columns are exact after the v-update; only rows can drift.
            if iter % 10 == 0 || iter + 1 == self.max_iterations {
                marginal_error = (0..n)
                    .map(|i| {
                        let lse = log_sum_exp(log_k.row(i).iter().zip(log_v.iter()).map(|(k, v)| k + v));
                        ((log_u[i] + lse).exp() - a[i]).abs()
                    })
                    .sum();
                if marginal_error < self.threshold {
                    converged = true;
                    break;
                }
            }
        }

        if converged {
            debug!(iterations, marginal_error, epsilon = self.regularization, "sinkhorn converged");
        } else {
            warn!(iterations, marginal_error, epsilon = self.regularization, "sinkhorn hit its iteration cap");
        }

        let mut plan = Array2::zeros((n, m));
        for ((i, j), p) in plan.indexed_iter_mut() {
            *p = (log_u[i] + log_k[[i, j]] + log_v[j]).exp();
        }
        let total = (&plan * &cost).sum();

        Ok(TransportPlan { plan, cost: total, iterations, marginal_error, converged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ot_plan;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn uniform(n: usize) -> Array1<f64> {
        Array1::from_elem(n, 1.0 / n as f64)
    }

    #[test]
    fn test_sinkhorn_marginals() {
        let cost = array![[0.0, 1.0, 2.0], [1.0, 0.0, 1.0], [2.0, 1.0, 0.0]];
        let plan = SinkhornSolver::new(0.1, 1000)
            .with_threshold(1e-6)
            .solve(cost.view(), uniform(3).view(), uniform(3).view())
            .unwrap();
        assert!(plan.converged, "should converge: {plan:?}");
        for r in plan.row_marginals().iter() {
            assert_abs_diff_eq!(*r, 1.0 / 3.0, epsilon = 1e-6);
        }
        for c in plan.col_marginals().iter() {
            assert_abs_diff_eq!(*c, 1.0 / 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn small_epsilon_does_not_underflow() {
        let cost = array![[0.0, 50.0], [50.0, 0.0]];
        let plan = SinkhornSolver::new(1e-3, 200)
            .solve(cost.view(), uniform(2).view(), uniform(2).view())
            .unwrap();
        assert!(plan.plan.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(plan.cost, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn large_epsilon_spreads_mass() {
        let cost = array![[0.0, 1.0], [1.0, 0.0]];
        let plan = SinkhornSolver::new(100.0, 1000)
            .solve(cost.view(), uniform(2).view(), uniform(2).view())
            .unwrap();
        for v in plan.plan.iter() {
            assert_abs_diff_eq!(*v, 0.25, epsilon = 1e-2);
        }
    }

    #[test]
    fn cost_approaches_exact_as_epsilon_shrinks() {
        let cost = array![[0.3, 1.2, 2.0, 0.7], [1.1, 0.1, 0.9, 1.6], [2.2, 0.8, 0.2, 1.3]];
        let exact = ot_plan(cost.view(), 0.0).unwrap().cost;
        let mut previous = f64::INFINITY;
        for eps in [1.0, 0.3, 0.1, 0.03, 0.01] {
            let c = ot_plan(cost.view(), eps).unwrap().cost;
            assert!(c >= exact - 1e-9, "entropic cost {c} below exact {exact}");
            assert!(c <= previous + 1e-9, "cost should decrease with epsilon: {c} > {previous}");
            previous = c;
        }
        assert_abs_diff_eq!(previous, exact, epsilon = 1e-2);
    }

    #[test]
    fn rejects_bad_weights() {
        let cost = array![[0.0, 1.0]];
        let a = array![1.0];
        let bad = array![-1.0, 2.0];
        assert!(SinkhornSolver::new(0.1, 10).solve(cost.view(), a.view(), bad.view()).is_err());
        let zero = array![0.0, 0.0];
        assert!(SinkhornSolver::new(0.1, 10).solve(cost.view(), a.view(), zero.view()).is_err());
    }
}
