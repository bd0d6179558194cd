//! Sample-set distances selected by name.
//!
//! The MiniBatch metrics take a `dist=` option naming one of:
//!
//! | name            | options                                   | diagnostic          |
//! |-----------------|-------------------------------------------|---------------------|
//! | `w1`            | `epsilon`, `b`, `base`                    | `W1-L2`             |
//! | `swd`           | `num_proj`                                | `SWD`               |
//! | `discrete_dual` | `n_steps`, `batch_size`, `lr`, `nnb`, `base`, `warm_start` | `dual` |
//! | `fd`            | `eps`                                     | `Frechet-distance`  |

use ndarray::{Array2, ArrayView2};
use rand::Rng;

use crate::config::{EngineConfig, Options};
use crate::distance::{pairwise_distance, pairwise_distance_batched, BaseMetric};
use crate::dual::{DiscreteDualSolver, DualConfig, DUAL_DIAGNOSTIC};
use crate::error::{ConfigError, OtResult};
use crate::frechet::FrechetEstimator;
use crate::sliced::swd;
use crate::transport::{OtSolver, TransportPlan};
use crate::Diagnostics;

/// Transport cost on the full cost matrix.
#[derive(Debug, Clone)]
pub struct W1Distance {
    /// Exact (`epsilon == 0`) or Sinkhorn solver.
    pub solver: OtSolver,
    /// Block size for the batched cost matrix; `None` builds it in one go.
    pub block: Option<usize>,
    /// Ground cost.
    pub base: BaseMetric,
}

impl W1Distance {
    /// Diagnostic key, `W1-L2` for the default ground cost.
    pub fn diagnostic_name(&self) -> String {
        format!("W1-{}", self.base)
    }

    /// Cost matrix between the rows of `x` and `y`.
    pub fn cost_matrix(&self, x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> OtResult<Array2<f64>> {
        match self.block {
            Some(b) => pairwise_distance_batched(x, y, self.base, b, b),
            None => pairwise_distance(x, y, self.base),
        }
    }

    /// Plan and cost between the rows of `x` and `y`.
    pub fn plan(&self, x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> OtResult<TransportPlan> {
        let c = self.cost_matrix(x, y)?;
        self.solver.solve(c.view())
    }
}

/// A configured sample distance.
#[derive(Debug, Clone)]
pub enum SampleDistance {
    /// OT cost (`w1`).
    W1(W1Distance),
    /// Sliced Wasserstein (`swd`).
    Swd {
        /// Random projections per call.
        num_proj: usize,
    },
    /// Discrete dual estimate (`discrete_dual`).
    Dual(DiscreteDualSolver),
    /// Fréchet distance (`fd`).
    Frechet(FrechetEstimator),
}

impl SampleDistance {
    /// Build the distance `name`, consuming its options from `opts`.
    pub fn from_options(name: &str, opts: &mut Options, config: &EngineConfig) -> Result<Self, ConfigError> {
        match name {
            "w1" => {
                let epsilon = opts.take_or("epsilon", 0.0_f64)?;
                if !(epsilon >= 0.0) || epsilon.is_infinite() {
                    return Err(ConfigError::invalid_value("epsilon", "must be finite and >= 0"));
                }
                let block = opts.take::<usize>("b")?;
                if block == Some(0) {
                    return Err(ConfigError::invalid_value("b", "must be > 0"));
                }
                let base = opts.take_or("base", config.base_metric)?;
                Ok(SampleDistance::W1(W1Distance { solver: OtSolver::from_config(epsilon, config), block, base }))
            }
            "swd" => {
                let num_proj = opts.take_or("num_proj", config.num_projections)?;
                if num_proj == 0 {
                    return Err(ConfigError::invalid_value("num_proj", "must be > 0"));
                }
                Ok(SampleDistance::Swd { num_proj })
            }
            "discrete_dual" => {
                let dual = DualConfig {
                    n_steps: opts.take_or("n_steps", config.dual_steps)?,
                    batch_size: opts.take("batch_size")?,
                    lr: opts.take_or("lr", config.dual_lr)?,
                    nnb: opts.take_or("nnb", config.dual_nnb)?,
                    metric: opts.take_or("base", config.base_metric)?,
                    warm_start: opts.take_bool_or("warm_start", false)?,
                };
                DiscreteDualSolver::new(dual)
                    .map(SampleDistance::Dual)
                    .map_err(|e| ConfigError::invalid_value("discrete_dual", e.to_string()))
            }
            "fd" => {
                let eps = opts.take_or("eps", config.frechet_eps)?;
                if !(eps > 0.0) {
                    return Err(ConfigError::invalid_value("eps", "must be > 0"));
                }
                Ok(SampleDistance::Frechet(
                    FrechetEstimator::new(eps).with_imaginary_tolerance(config.imaginary_tolerance),
                ))
            }
            other => Err(ConfigError::UnknownDistance { name: other.to_string() }),
        }
    }

    /// Short name as used in `dist=`.
    pub fn name(&self) -> &'static str {
        match self {
            SampleDistance::W1(_) => "w1",
            SampleDistance::Swd { .. } => "swd",
            SampleDistance::Dual(_) => "discrete_dual",
            SampleDistance::Frechet(_) => "fd",
        }
    }

    /// Distance between the rows of `x` and `y` with its diagnostics.
    pub fn compute<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
        rng: &mut R,
    ) -> OtResult<(f64, Diagnostics)> {
        match self {
            SampleDistance::W1(w1) => {
                let plan = w1.plan(x, y)?;
                let mut diagnostics = Diagnostics::new();
                diagnostics.insert(w1.diagnostic_name(), plan.cost);
                Ok((plan.cost, diagnostics))
            }
            SampleDistance::Swd { num_proj } => swd(x, y, *num_proj, rng),
            SampleDistance::Dual(solver) => {
                let outcome = solver.solve(x, y, rng)?;
                let mut diagnostics = Diagnostics::new();
                diagnostics.insert(DUAL_DIAGNOSTIC.to_string(), outcome.estimate);
                Ok((outcome.estimate, diagnostics))
            }
            SampleDistance::Frechet(estimator) => estimator.distance(x, y),
        }
    }
}
