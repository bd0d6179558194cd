//! Differentiable losses on `tch` tensors (feature `tch-backend`).
//!
//! The transport plans, dual potentials and random draws are computed by
//! the `ndarray` core on detached copies of the inputs; the returned loss
//! is rebuilt from tensor operations on the original inputs so gradients
//! reach the generator through the cost matrix:
//!
//! ```text
//! C = c(x, y)                    (tensor, differentiable)
//! P = plan(C.detach())           (ndarray, constant)
//! L = Σ P ⊙ C
//! ```
//!
//! The Fréchet distance is returned as a constant.
//!
//! This module also holds the critic-based losses ([`WGANLoss`],
//! [`AdversarialFeatureMatchingLoss`]) and the [`gradient_penalty`].

use ndarray::{Array1, Array2, ArrayViewD};
use rand::seq::index::sample;
use rand::Rng;
use tch::nn::Module;
use tch::{Device, Kind, Reduction, Tensor};

use crate::config::Options;
use crate::distance::BaseMetric;
use crate::distribution::SampleDistance;
use crate::dual::DUAL_DIAGNOSTIC;
use crate::error::{ConfigError, OtError, OtResult, Step};
use crate::metric::Metric;
use crate::patches::PatchGeometry;
use crate::sliced::{generate_directions, stretch_indices, SWD_DIAGNOSTIC};
use crate::transport::OtSolver;
use crate::Diagnostics;

// ---------------------------------------------------------------------------
// Critic
// ---------------------------------------------------------------------------

/// The discriminator network as seen by the losses.
pub trait Critic {
    /// One score per sample, shape `[B]` or `[B, 1]`.
    fn score(&self, x: &Tensor) -> Tensor;

    /// Intermediate features used for feature matching. Defaults to the
    /// score.
    fn features(&self, x: &Tensor) -> Tensor {
        self.score(x)
    }
}

impl<M: Module> Critic for M {
    fn score(&self, x: &Tensor) -> Tensor {
        self.forward(x)
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Reshape `N × …` into `N × D`.
pub fn flatten(x: &Tensor) -> Tensor {
    let n = x.size().first().copied().unwrap_or(0);
    x.reshape([n, -1])
}

/// Tensor shape as `usize`s.
pub fn shape_of(x: &Tensor) -> Vec<usize> {
    x.size().into_iter().map(|d| d.max(0) as usize).collect()
}

/// Detached `f64` copy of a 2-D tensor.
pub fn to_array2(x: &Tensor) -> OtResult<Array2<f64>> {
    let (n, d) = x.size2()?;
    let flat = x.detach().to_device(Device::Cpu).to_kind(Kind::Double).contiguous().flatten(0, -1);
    let values = Vec::<f64>::try_from(&flat)?;
    Array2::from_shape_vec((n as usize, d as usize), values)
        .map_err(|e| OtError::numerical_instability(e.to_string()))
}

/// Tensor copy of a 2-D array on `device`.
pub fn from_array2(a: &Array2<f64>, device: Device) -> Tensor {
    let (n, m) = a.dim();
    let values: Vec<f64> = a.iter().copied().collect();
    Tensor::from_slice(&values).reshape([n as i64, m as i64]).to_device(device)
}

fn from_array1(a: &Array1<f64>, device: Device) -> Tensor {
    Tensor::from_slice(&a.to_vec()).to_device(device)
}

fn index_tensor(indices: &[usize], device: Device) -> Tensor {
    let indices: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_slice(&indices).to_device(device)
}

// ---------------------------------------------------------------------------
// Cost matrices and patches
// ---------------------------------------------------------------------------

/// Pairwise cost `N × M` between the rows of `x` and `y`.
pub fn pairwise_distance(x: &Tensor, y: &Tensor, metric: BaseMetric) -> Tensor {
    match metric {
        BaseMetric::L2 => squared_distance(x, y),
        BaseMetric::Euclidean => squared_distance(x, y).clamp_min(1e-30).sqrt(),
        BaseMetric::L1 => (x.unsqueeze(1) - y.unsqueeze(0)).abs().sum_dim_intlist([2i64].as_slice(), false, Kind::Double),
    }
}

fn squared_distance(x: &Tensor, y: &Tensor) -> Tensor {
    let xx = (x * x).sum_dim_intlist([1i64].as_slice(), true, Kind::Double);
    let yy = (y * y).sum_dim_intlist([1i64].as_slice(), true, Kind::Double);
    (xx + yy.tr() - x.matmul(&y.tr()) * 2.0).clamp_min(0.0)
}

/// [`pairwise_distance`] assembled from `bx × by` blocks.
pub fn pairwise_distance_batched(x: &Tensor, y: &Tensor, metric: BaseMetric, bx: usize, by: usize) -> OtResult<Tensor> {
    if bx == 0 || by == 0 {
        return Err(OtError::invalid_parameter("b", "block sizes must be > 0"));
    }
    let (n, m) = (x.size()[0], y.size()[0]);
    let mut rows = Vec::new();
    for i in (0..n).step_by(bx) {
        let xi = x.narrow(0, i, (bx as i64).min(n - i));
        let blocks: Vec<Tensor> = (0..m)
            .step_by(by)
            .map(|j| pairwise_distance(&xi, &y.narrow(0, j, (by as i64).min(m - j)), metric))
            .collect();
        rows.push(Tensor::cat(&blocks, 1));
    }
    Ok(Tensor::cat(&rows, 0))
}

fn unfold(images: &Tensor, geometry: PatchGeometry) -> OtResult<Tensor> {
    let size = images.size();
    if size.len() != 4 {
        return Err(OtError::shape_mismatch(vec![0, 0, 0, 0], shape_of(images)));
    }
    geometry.grid(size[2] as usize, size[3] as usize)?;
    let (p, s) = (geometry.size as i64, geometry.stride as i64);
    // B × C·p² × L, channel-major within a window.
    Ok(images.im2col([p, p], [1, 1], [0, 0], [s, s]))
}

/// Pooled patches `(B·L) × C·p²`, optionally subsampled to `sample_n` rows.
pub fn to_patches<R: Rng + ?Sized>(
    images: &Tensor,
    geometry: PatchGeometry,
    sample_n: Option<usize>,
    rng: &mut R,
) -> OtResult<Tensor> {
    let windows = unfold(images, geometry)?;
    let features = windows.size()[1];
    let pooled = windows.permute([0, 2, 1]).reshape([-1, features]);
    let rows = pooled.size()[0] as usize;
    Ok(match sample_n {
        Some(k) if k < rows => {
            let picks = sample(rng, rows, k).into_vec();
            pooled.index_select(0, &index_tensor(&picks, images.device()))
        }
        _ => pooled,
    })
}

/// Located patches `L × B × C·p²` at the given location indices.
pub fn to_patches_at(images: &Tensor, geometry: PatchGeometry, locations: &[usize]) -> OtResult<Tensor> {
    let windows = unfold(images, geometry)?;
    let l = windows.size()[2] as usize;
    if let Some(&bad) = locations.iter().find(|&&loc| loc >= l) {
        return Err(OtError::invalid_parameter("locations", format!("index {bad} out of {l} locations")));
    }
    Ok(windows.permute([2, 0, 1]).index_select(0, &index_tensor(locations, images.device())))
}

// ---------------------------------------------------------------------------
// Distances
// ---------------------------------------------------------------------------

/// Differentiable version of [`SampleDistance::compute`].
pub fn sample_distance<R: Rng + ?Sized>(
    dist: &mut SampleDistance,
    x: &Tensor,
    y: &Tensor,
    rng: &mut R,
) -> OtResult<(Tensor, Diagnostics)> {
    let (n, dx) = x.size2()?;
    let (m, dy) = y.size2()?;
    if n == 0 || m == 0 {
        return Err(OtError::empty_input(format!("{} on {n} and {m} samples", dist.name())));
    }
    if dx != dy {
        return Err(OtError::DimensionMismatch { expected: dx as usize, got: dy as usize, context: "tensor distance" });
    }
    let (x, y) = (x.to_kind(Kind::Double), y.to_kind(Kind::Double));
    let mut diagnostics = Diagnostics::new();

    let loss = match dist {
        SampleDistance::W1(w1) => {
            let cost = match w1.block {
                Some(b) => pairwise_distance_batched(&x, &y, w1.base, b, b)?,
                None => pairwise_distance(&x, &y, w1.base),
            };
            let plan = w1.solver.solve(to_array2(&cost)?.view())?;
            let loss = (from_array2(&plan.plan, cost.device()) * &cost).sum(Kind::Double);
            diagnostics.insert(w1.diagnostic_name(), loss.double_value(&[]));
            loss
        }
        SampleDistance::Swd { num_proj } => {
            let loss = swd(&x, &y, *num_proj, rng)?;
            diagnostics.insert(SWD_DIAGNOSTIC.to_string(), loss.double_value(&[]));
            loss
        }
        SampleDistance::Dual(solver) => {
            let outcome = solver.solve(to_array2(&x)?.view(), to_array2(&y)?.view(), rng)?;
            let psi = from_array1(&outcome.potentials, x.device());
            let cost = pairwise_distance(&y, &x, solver.config().metric);
            let (phi, _) = (cost - psi.unsqueeze(0)).min_dim(1, false);
            // The loss uses all of `y` and the final ψ; the diagnostic is the
            // solver's last-step estimate, as in the array path.
            let loss = phi.mean(Kind::Double) + psi.mean(Kind::Double);
            diagnostics.insert(DUAL_DIAGNOSTIC.to_string(), outcome.estimate);
            loss
        }
        SampleDistance::Frechet(estimator) => {
            let (value, d) = estimator.distance(to_array2(&x)?.view(), to_array2(&y)?.view())?;
            diagnostics = d;
            Tensor::from(value).to_device(x.device())
        }
    };
    Ok((loss, diagnostics))
}

/// Differentiable sliced Wasserstein distance.
pub fn swd<R: Rng + ?Sized>(x: &Tensor, y: &Tensor, num_proj: usize, rng: &mut R) -> OtResult<Tensor> {
    if num_proj == 0 {
        return Err(OtError::invalid_parameter("num_proj", "must be > 0"));
    }
    let d = x.size()[1] as usize;
    let dirs = from_array2(&generate_directions(d, num_proj, rng), x.device());
    let mut proj_x = x.matmul(&dirs).tr();
    let mut proj_y = y.matmul(&dirs).tr();

    let (n, m) = (proj_x.size()[1] as usize, proj_y.size()[1] as usize);
    if n < m {
        proj_x = proj_x.index_select(1, &index_tensor(&stretch_indices(n, m, rng)?, x.device()));
    } else if m < n {
        proj_y = proj_y.index_select(1, &index_tensor(&stretch_indices(m, n, rng)?, x.device()));
    }

    let (sx, _) = proj_x.sort(1, false);
    let (sy, _) = proj_y.sort(1, false);
    Ok((sx - sy).abs().mean(Kind::Double))
}

// ---------------------------------------------------------------------------
// Gradient penalty
// ---------------------------------------------------------------------------

/// WGAN-GP penalty on random interpolates of `real` and `fake`.
///
/// Returns `mean((‖∇D(x̂)‖ − 1)²)` (part of the graph) and the mean gradient
/// norm.
pub fn gradient_penalty(critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, f64)> {
    let size = real.size();
    if size != fake.size() {
        return Err(OtError::shape_mismatch(shape_of(real), shape_of(fake)));
    }
    let b = size.first().copied().unwrap_or(0);
    if b == 0 {
        return Err(OtError::empty_input("gradient penalty on an empty batch"));
    }
    let mut alpha_shape = vec![1i64; size.len()];
    alpha_shape[0] = b;
    let alpha = Tensor::rand(alpha_shape.as_slice(), (real.kind(), real.device()));

    let interpolates = (&alpha * real.detach() + (&alpha * -1.0 + 1.0) * fake.detach()).set_requires_grad(true);
    let scores = critic.score(&interpolates);
    let grads = Tensor::run_backward(&[scores.sum(scores.kind())], &[&interpolates], true, true);
    let grad = grads
        .into_iter()
        .next()
        .ok_or_else(|| OtError::numerical_instability("critic output does not depend on its input"))?;

    let norms = grad.reshape([b, -1]).norm_scalaropt_dim(2.0, [1i64].as_slice(), false);
    let penalty = (&norms - 1.0).square().mean(Kind::Double);
    Ok((penalty, norms.mean(Kind::Double).double_value(&[])))
}

// ---------------------------------------------------------------------------
// Critic-based losses
// ---------------------------------------------------------------------------

fn needs_critic(metric: &str) -> OtError {
    OtError::unsupported(metric, Step::Evaluate, "needs a critic; use train_d and train_g")
}

/// Wasserstein GAN loss on critic scores.
#[derive(Debug, Clone, PartialEq)]
pub struct WGANLoss {
    /// Gradient penalty weight; `0` disables the penalty.
    pub gp_weight: f64,
}

impl WGANLoss {
    /// Registry name.
    pub const NAME: &'static str = "WGANLoss";

    /// Options: `gp_weight` (default 0).
    pub fn from_options(opts: &mut Options) -> Result<Self, ConfigError> {
        let gp_weight = opts.take_or("gp_weight", 0.0_f64)?;
        if !(gp_weight >= 0.0) || gp_weight.is_infinite() {
            return Err(ConfigError::invalid_value(format!("{}.gp_weight", opts.metric()), "must be finite and >= 0"));
        }
        Ok(Self { gp_weight })
    }
}

impl Metric for WGANLoss {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports_discriminator_step(&self) -> bool {
        true
    }

    fn compute(&mut self, _real: ArrayViewD<'_, f64>, _fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        Err(needs_critic(Self::NAME))
    }

    fn train_d(&mut self, critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let fake = fake.detach();
        let w1 = critic.score(real).mean(Kind::Double) - critic.score(&fake).mean(Kind::Double);
        let mut loss = -&w1;

        let mut diagnostics = Diagnostics::new();
        diagnostics.insert("W1".to_string(), w1.double_value(&[]));
        if self.gp_weight > 0.0 {
            let (penalty, norm) = gradient_penalty(critic, real, &fake)?;
            loss = loss + penalty * self.gp_weight;
            diagnostics.insert("gradient_norm".to_string(), norm);
        }
        diagnostics.insert("Dloss".to_string(), loss.double_value(&[]));
        Ok((loss, diagnostics))
    }

    fn train_g(&mut self, critic: &dyn Critic, _real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let loss = -critic.score(fake).mean(Kind::Double);
        let mut diagnostics = Diagnostics::new();
        diagnostics.insert("Gloss".to_string(), loss.double_value(&[]));
        Ok((loss, diagnostics))
    }
}

/// Non-saturating discriminator with exact OT feature matching for the
/// generator.
#[derive(Debug, Clone)]
pub struct AdversarialFeatureMatchingLoss {
    solver: OtSolver,
}

impl AdversarialFeatureMatchingLoss {
    /// Registry name.
    pub const NAME: &'static str = "AdversarialFeatureMatchingLoss";

    /// Loss with the exact solver.
    pub fn new() -> Self {
        Self { solver: OtSolver::new(0.0) }
    }
}

impl Default for AdversarialFeatureMatchingLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for AdversarialFeatureMatchingLoss {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports_discriminator_step(&self) -> bool {
        true
    }

    fn compute(&mut self, _real: ArrayViewD<'_, f64>, _fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        Err(needs_critic(Self::NAME))
    }

    fn train_d(&mut self, critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let (nr, nf) = (real.size()[0], fake.size()[0]);
        let preds = Tensor::cat(&[critic.score(real).reshape([nr]), critic.score(&fake.detach()).reshape([nf])], 0)
            .to_kind(Kind::Double);
        let labels = Tensor::cat(
            &[Tensor::ones([nr], (Kind::Double, preds.device())), Tensor::zeros([nf], (Kind::Double, preds.device()))],
            0,
        );
        let loss = preds.binary_cross_entropy_with_logits::<Tensor>(&labels, None, None, Reduction::Mean);

        let mut diagnostics = Diagnostics::new();
        diagnostics.insert("Dloss".to_string(), loss.double_value(&[]));
        Ok((loss, diagnostics))
    }

    fn train_g(&mut self, critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let rf = flatten(&critic.features(real)).to_kind(Kind::Double);
        let ff = flatten(&critic.features(fake)).to_kind(Kind::Double);
        // Mean over features, not the sum.
        let cost = pairwise_distance(&rf, &ff, BaseMetric::L2) / rf.size()[1] as f64;
        let plan = self.solver.solve(to_array2(&cost)?.view())?;
        let loss = (from_array2(&plan.plan, cost.device()) * &cost).sum(Kind::Double);

        let mut diagnostics = Diagnostics::new();
        diagnostics.insert("OT".to_string(), loss.double_value(&[]));
        Ok((loss, diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::nn;

    fn tensor(a: &Array2<f64>) -> Tensor {
        from_array2(a, Device::Cpu)
    }

    #[test]
    fn w1_gradient_points_along_the_plan() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = tensor(&array![[0.0, 0.0], [1.0, 0.0]]);
        let y = tensor(&array![[0.0, 1.0], [1.0, 1.0]]).set_requires_grad(true);
        let mut dist = SampleDistance::W1(crate::distribution::W1Distance {
            solver: OtSolver::new(0.0),
            block: None,
            base: BaseMetric::L2,
        });
        let (loss, diag) = sample_distance(&mut dist, &x, &y, &mut rng).unwrap();
        assert_abs_diff_eq!(loss.double_value(&[]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(diag["W1-L2"], 1.0, epsilon = 1e-12);

        loss.backward();
        // d/dy_j Σ P_ij |x_i − y_j|² = Σ_i 2 P_ij (y_j − x_i) = (0, 1) for both.
        let grad = to_array2(&y.grad()).unwrap();
        assert_abs_diff_eq!(grad[[0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[[1, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn tensor_swd_matches_the_array_version() {
        let x = array![[0.0, 1.0], [2.0, -1.0], [0.5, 0.5]];
        let y = array![[1.0, 1.0], [0.0, 0.0], [3.0, 3.0], [1.5, -2.0], [0.2, 0.1]];
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let (expected, _) = crate::sliced::swd(x.view(), y.view(), 16, &mut a).unwrap();
        let got = swd(&tensor(&x), &tensor(&y), 16, &mut b).unwrap();
        assert_abs_diff_eq!(got.double_value(&[]), expected, epsilon = 1e-10);
    }

    #[test]
    fn tensor_patches_match_the_array_layout() {
        let images = ndarray::Array4::from_shape_fn((2, 2, 5, 5), |(b, c, i, j)| (b * 100 + c * 25 + i * 5 + j) as f64);
        let mut rng = StdRng::seed_from_u64(0);
        let geometry = PatchGeometry::new(3, 2).unwrap();
        let expected = crate::patches::to_patches(images.view(), geometry, None, true, &mut rng)
            .unwrap()
            .into_pooled()
            .unwrap();
        let t = Tensor::from_slice(images.as_slice().unwrap()).reshape([2, 2, 5, 5]);
        let got = to_array2(&to_patches(&t, geometry, None, &mut rng).unwrap()).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn gradient_penalty_of_a_linear_critic() {
        // D(x) = 3·x₀ has gradient norm 3 everywhere: penalty (3 − 1)² = 4.
        let critic = nn::func(|x| x.narrow(1, 0, 1) * 3.0);
        let real = Tensor::rand([4, 2], (Kind::Double, Device::Cpu));
        let fake = Tensor::rand([4, 2], (Kind::Double, Device::Cpu));
        let (penalty, norm) = gradient_penalty(&critic, &real, &fake).unwrap();
        assert_abs_diff_eq!(penalty.double_value(&[]), 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(norm, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn critic_losses_need_a_critic_for_evaluate() {
        let x = Array2::<f64>::zeros((2, 2)).into_dyn();
        let err = AdversarialFeatureMatchingLoss::new().evaluate(x.view(), x.view()).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn dual_diagnostic_matches_the_array_path() {
        let x = array![[0.0, 0.0], [1.0, 2.0], [3.0, -1.0], [0.5, 0.5]];
        let y = array![[1.0, 1.0], [2.0, 0.0], [-1.0, 0.5], [0.0, 3.0], [2.5, 2.5]];
        let dual = || {
            let config = crate::dual::DualConfig { n_steps: 10, batch_size: Some(3), lr: 0.1, ..Default::default() };
            SampleDistance::Dual(crate::dual::DiscreteDualSolver::new(config).unwrap())
        };
        let (expected, _) = dual().compute(x.view(), y.view(), &mut StdRng::seed_from_u64(5)).unwrap();
        let (_, diag) = sample_distance(&mut dual(), &tensor(&x), &tensor(&y), &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(diag[DUAL_DIAGNOSTIC], expected);
    }

    #[test]
    fn wgan_reports_w1_and_dloss() {
        let critic = nn::func(|x| x.sum_dim_intlist([1i64].as_slice(), false, Kind::Double));
        let real = tensor(&array![[1.0, 1.0], [2.0, 2.0]]);
        let fake = tensor(&array![[0.0, 0.0], [1.0, 0.0]]);
        let mut loss = WGANLoss { gp_weight: 0.0 };
        let (d, diag) = loss.train_d(&critic, &real, &fake).unwrap();
        // mean D(real) = 3, mean D(fake) = 0.5.
        assert_abs_diff_eq!(diag["W1"], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(d.double_value(&[]), -2.5, epsilon = 1e-12);
    }
}
