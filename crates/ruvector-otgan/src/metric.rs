//! Metric interface and the minibatch OT losses.
//!
//! A [`Metric`] compares a batch of real samples with a batch of generated
//! ones. The minibatch losses here need no critic: the generator step is the
//! distance itself and the discriminator step is unsupported.
//!
//! | metric                    | samples compared                       |
//! |---------------------------|----------------------------------------|
//! | [`MiniBatchLoss`]         | whole samples, flattened to vectors    |
//! | [`MiniBatchPatchLoss`]    | pooled patches of both batches         |
//! | [`MiniBatchLocalPatchLoss`] | patches at each location, averaged   |
//! | [`MiniBatchMSPatchLoss`]  | a patch loss chosen by a step schedule |

use ndarray::{Array2, ArrayView4, ArrayViewD, Axis, Ix4};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use crate::config::{EngineConfig, Options};
use crate::distribution::SampleDistance;
use crate::error::{ConfigError, OtError, OtResult};
use crate::patches::{to_patches, to_patches_at, MultiScaleSchedule, PatchGeometry};
use crate::Diagnostics;

#[cfg(feature = "tch-backend")]
use crate::error::Step;
#[cfg(feature = "tch-backend")]
use crate::graph::{self, Critic};
#[cfg(feature = "tch-backend")]
use tch::Tensor;

/// Hint attached to every unsupported discriminator step.
pub const NO_DISCRIMINATOR_HINT: &str = "run with zero discriminator steps";

// ---------------------------------------------------------------------------
// Metric trait
// ---------------------------------------------------------------------------

/// A distance between a real and a generated batch.
///
/// `compute` is the gradient-free counterpart of the generator step and may
/// advance internal state (a multi-scale schedule, warm-started potentials).
/// `evaluate` only reads the state when the metric has any.
pub trait Metric: Send {
    /// Registry name of the metric.
    fn name(&self) -> &str;

    /// Whether [`Metric::train_d`] does anything useful.
    fn supports_discriminator_step(&self) -> bool {
        false
    }

    /// Value and diagnostics of the generator-step computation.
    fn compute(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)>;

    /// Scalar value for monitoring.
    fn evaluate(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<f64> {
        Ok(self.compute(real, fake)?.0)
    }

    /// Critic loss to minimise.
    #[cfg(feature = "tch-backend")]
    fn train_d(&mut self, _critic: &dyn Critic, _real: &Tensor, _fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        Err(OtError::unsupported(self.name(), Step::Discriminator, NO_DISCRIMINATOR_HINT))
    }

    /// Generator loss to minimise, differentiable with respect to `fake`.
    #[cfg(feature = "tch-backend")]
    fn train_g(&mut self, critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)>;
}

impl std::fmt::Debug for dyn Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric").field("name", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Random source for a metric: the `seed` option, then the engine seed,
/// then OS entropy.
pub(crate) fn seeded_rng(opts: &mut Options, config: &EngineConfig) -> Result<StdRng, ConfigError> {
    Ok(match opts.take::<u64>("seed")?.or(config.seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    })
}

/// Reshape a batch `N × …` into `N × D`, `D` the product of the trailing
/// axes (1 for a 1-D batch).
pub fn flatten_samples(x: ArrayViewD<'_, f64>) -> OtResult<Array2<f64>> {
    if x.ndim() == 0 {
        return Err(OtError::shape_mismatch(vec![0, 0], Vec::new()));
    }
    let n = x.shape()[0];
    let d: usize = x.shape()[1..].iter().product();
    x.as_standard_layout()
        .into_owned()
        .into_shape((n, d))
        .map_err(|e| OtError::numerical_instability(e.to_string()))
}

fn as_images(x: ArrayViewD<'_, f64>) -> OtResult<ArrayView4<'_, f64>> {
    let shape = x.shape().to_vec();
    x.into_dimensionality::<Ix4>()
        .map_err(|_| OtError::shape_mismatch(vec![0, 0, 0, 0], shape))
}

fn patch_geometry(opts: &mut Options, config: &EngineConfig) -> Result<PatchGeometry, ConfigError> {
    let size = opts.take_or("p", config.patch_size)?;
    let stride = opts.take_or("s", config.patch_stride)?;
    PatchGeometry::new(size, stride).map_err(|e| ConfigError::invalid_value(format!("{}.p", opts.metric()), e.to_string()))
}

fn distance_name(opts: &mut Options) -> String {
    opts.take_str("dist").unwrap_or_else(|| "w1".to_string())
}

// ---------------------------------------------------------------------------
// MiniBatchLoss
// ---------------------------------------------------------------------------

/// Distance between the flattened samples of both batches.
#[derive(Debug)]
pub struct MiniBatchLoss {
    dist: SampleDistance,
    rng: StdRng,
}

impl MiniBatchLoss {
    /// Registry name.
    pub const NAME: &'static str = "MiniBatchLoss";

    /// Loss over `dist`.
    pub fn new(dist: SampleDistance, rng: StdRng) -> Self {
        Self { dist, rng }
    }

    /// Options: `dist` (default `w1`), `seed`, and the options of the
    /// distance.
    pub fn from_options(opts: &mut Options, config: &EngineConfig) -> Result<Self, ConfigError> {
        let name = distance_name(opts);
        let rng = seeded_rng(opts, config)?;
        let dist = SampleDistance::from_options(&name, opts, config)?;
        Ok(Self::new(dist, rng))
    }

    /// The configured distance.
    pub fn distance(&self) -> &SampleDistance {
        &self.dist
    }
}

impl Metric for MiniBatchLoss {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compute(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        let x = flatten_samples(real)?;
        let y = flatten_samples(fake)?;
        self.dist.compute(x.view(), y.view(), &mut self.rng)
    }

    #[cfg(feature = "tch-backend")]
    fn train_g(&mut self, _critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let x = graph::flatten(real);
        let y = graph::flatten(fake);
        graph::sample_distance(&mut self.dist, &x, &y, &mut self.rng)
    }
}

// ---------------------------------------------------------------------------
// MiniBatchPatchLoss
// ---------------------------------------------------------------------------

/// Distance between the pooled patches of two image batches.
#[derive(Debug)]
pub struct MiniBatchPatchLoss {
    dist: SampleDistance,
    geometry: PatchGeometry,
    n_samples: Option<usize>,
    rng: StdRng,
}

impl MiniBatchPatchLoss {
    /// Registry name.
    pub const NAME: &'static str = "MiniBatchPatchLoss";

    /// Patch loss over `dist`; `n_samples` caps the patches drawn per batch.
    pub fn new(dist: SampleDistance, geometry: PatchGeometry, n_samples: Option<usize>, rng: StdRng) -> Self {
        Self { dist, geometry, n_samples, rng }
    }

    /// Options: `dist` (default `w1`), `p` (5), `s` (1), `n_samples`,
    /// `seed`, and the options of the distance.
    pub fn from_options(opts: &mut Options, config: &EngineConfig) -> Result<Self, ConfigError> {
        let name = distance_name(opts);
        let geometry = patch_geometry(opts, config)?;
        let n_samples = opts.take::<usize>("n_samples")?;
        let rng = seeded_rng(opts, config)?;
        let dist = SampleDistance::from_options(&name, opts, config)?;
        Ok(Self::new(dist, geometry, n_samples, rng))
    }

    /// Window geometry.
    pub fn geometry(&self) -> PatchGeometry {
        self.geometry
    }

    /// The configured distance.
    pub fn distance(&self) -> &SampleDistance {
        &self.dist
    }

    fn pooled(&mut self, images: ArrayViewD<'_, f64>) -> OtResult<Array2<f64>> {
        let patches = to_patches(as_images(images)?, self.geometry, self.n_samples, true, &mut self.rng)?;
        patches
            .into_pooled()
            .ok_or_else(|| OtError::numerical_instability("pooled extraction returned located patches"))
    }
}

impl Metric for MiniBatchPatchLoss {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compute(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        let x = self.pooled(real)?;
        let y = self.pooled(fake)?;
        self.dist.compute(x.view(), y.view(), &mut self.rng)
    }

    #[cfg(feature = "tch-backend")]
    fn train_g(&mut self, _critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let x = graph::to_patches(real, self.geometry, self.n_samples, &mut self.rng)?;
        let y = graph::to_patches(fake, self.geometry, self.n_samples, &mut self.rng)?;
        graph::sample_distance(&mut self.dist, &x, &y, &mut self.rng)
    }
}

// ---------------------------------------------------------------------------
// MiniBatchLocalPatchLoss
// ---------------------------------------------------------------------------

/// Mean over patch locations of the distance between the two batches'
/// patches at that location.
#[derive(Debug)]
pub struct MiniBatchLocalPatchLoss {
    dist: SampleDistance,
    geometry: PatchGeometry,
    n_samples: Option<usize>,
    rng: StdRng,
}

impl MiniBatchLocalPatchLoss {
    /// Registry name.
    pub const NAME: &'static str = "MiniBatchLocalPatchLoss";

    /// Local patch loss; `n_samples` caps the number of locations, the same
    /// locations being used for both batches.
    pub fn new(dist: SampleDistance, geometry: PatchGeometry, n_samples: Option<usize>, rng: StdRng) -> Self {
        Self { dist, geometry, n_samples, rng }
    }

    /// Same options as [`MiniBatchPatchLoss`].
    pub fn from_options(opts: &mut Options, config: &EngineConfig) -> Result<Self, ConfigError> {
        let name = distance_name(opts);
        let geometry = patch_geometry(opts, config)?;
        let n_samples = opts.take::<usize>("n_samples")?;
        let rng = seeded_rng(opts, config)?;
        let dist = SampleDistance::from_options(&name, opts, config)?;
        Ok(Self::new(dist, geometry, n_samples, rng))
    }

    /// Diagnostic key, e.g. `Local-w1`.
    pub fn diagnostic_name(&self) -> String {
        format!("Local-{}", self.dist.name())
    }

    /// Location indices for one call.
    fn locations(&mut self, real: &[usize], fake: &[usize]) -> OtResult<Vec<usize>> {
        if real.len() != 4 || fake.len() != 4 {
            return Err(OtError::shape_mismatch(vec![0, 0, 0, 0], if real.len() != 4 { real } else { fake }.to_vec()));
        }
        let (real_grid, fake_grid) = (
            self.geometry.grid(real[2], real[3])?,
            self.geometry.grid(fake[2], fake[3])?,
        );
        if real_grid != fake_grid {
            return Err(OtError::shape_mismatch(real.to_vec(), fake.to_vec()));
        }
        let count = real_grid.0 * real_grid.1;
        Ok(match self.n_samples {
            Some(k) if k < count => sample(&mut self.rng, count, k).into_vec(),
            _ => (0..count).collect(),
        })
    }
}

impl Metric for MiniBatchLocalPatchLoss {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compute(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        let (real, fake) = (as_images(real)?, as_images(fake)?);
        let locations = self.locations(real.shape(), fake.shape())?;
        let xs = to_patches_at(real, self.geometry, &locations)?;
        let ys = to_patches_at(fake, self.geometry, &locations)?;

        let mut total = 0.0;
        for (x, y) in xs.axis_iter(Axis(0)).zip(ys.axis_iter(Axis(0))) {
            total += self.dist.compute(x, y, &mut self.rng)?.0;
        }
        let value = total / locations.len() as f64;

        let mut diagnostics = Diagnostics::new();
        diagnostics.insert(self.diagnostic_name(), value);
        Ok((value, diagnostics))
    }

    #[cfg(feature = "tch-backend")]
    fn train_g(&mut self, _critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let locations = self.locations(&graph::shape_of(real), &graph::shape_of(fake))?;
        let xs = graph::to_patches_at(real, self.geometry, &locations)?;
        let ys = graph::to_patches_at(fake, self.geometry, &locations)?;

        let mut losses = Vec::with_capacity(locations.len());
        for i in 0..locations.len() as i64 {
            let (loss, _) = graph::sample_distance(&mut self.dist, &xs.get(i), &ys.get(i), &mut self.rng)?;
            losses.push(loss);
        }
        let loss = Tensor::stack(&losses, 0).mean(tch::Kind::Double);

        let mut diagnostics = Diagnostics::new();
        diagnostics.insert(self.diagnostic_name(), loss.double_value(&[]));
        Ok((loss, diagnostics))
    }
}

// ---------------------------------------------------------------------------
// MiniBatchMSPatchLoss
// ---------------------------------------------------------------------------

/// Patch losses at decreasing scales, switched by a step schedule.
#[derive(Debug)]
pub struct MiniBatchMSPatchLoss {
    stages: Vec<MiniBatchPatchLoss>,
    schedule: MultiScaleSchedule,
}

impl MiniBatchMSPatchLoss {
    /// Registry name.
    pub const NAME: &'static str = "MiniBatchMSPatchLoss";

    /// Schedule `stages` with `intervals`; needs one more stage than
    /// intervals.
    pub fn new(stages: Vec<MiniBatchPatchLoss>, intervals: Vec<usize>) -> OtResult<Self> {
        if stages.len() != intervals.len() + 1 {
            return Err(OtError::invalid_parameter(
                "intervals",
                format!("{} stages need {} intervals, got {}", stages.len(), stages.len().saturating_sub(1), intervals.len()),
            ));
        }
        Ok(Self { stages, schedule: MultiScaleSchedule::new(intervals) })
    }

    /// Options: `dists` (`['w1','swd','swd']`), `ps` (`[64,32,8]`), `ss`
    /// (`[1,2,8]`), `intervals` (`[10000,10000]`). Every other option,
    /// `n_samples` and `seed` included, is passed to each stage.
    pub fn from_options(opts: &mut Options, config: &EngineConfig) -> Result<Self, ConfigError> {
        let dists: Vec<String> = opts
            .take_list("dists")?
            .unwrap_or_else(|| vec!["w1".to_string(), "swd".to_string(), "swd".to_string()]);
        let ps: Vec<usize> = opts.take_list("ps")?.unwrap_or_else(|| vec![64, 32, 8]);
        let ss: Vec<usize> = opts.take_list("ss")?.unwrap_or_else(|| vec![1, 2, 8]);
        let intervals: Vec<usize> = opts.take_list("intervals")?.unwrap_or_else(|| vec![10_000, 10_000]);

        if ps.len() != dists.len() || ss.len() != dists.len() {
            return Err(ConfigError::invalid_value(
                format!("{}.dists", opts.metric()),
                format!("got {} dists, {} ps and {} ss", dists.len(), ps.len(), ss.len()),
            ));
        }

        let n_samples = opts.take::<usize>("n_samples")?;
        let mut master = seeded_rng(opts, config)?;

        let mut unused = opts.clone();
        let mut stages = Vec::with_capacity(dists.len());
        for ((dist, p), s) in dists.iter().zip(&ps).zip(&ss) {
            let mut stage_opts = opts.clone();
            let geometry = PatchGeometry::new(*p, *s)
                .map_err(|e| ConfigError::invalid_value(format!("{}.ps", opts.metric()), e.to_string()))?;
            let distance = SampleDistance::from_options(dist, &mut stage_opts, config)?;
            unused.retain_unconsumed(&stage_opts);
            let rng = StdRng::seed_from_u64(master.gen());
            stages.push(MiniBatchPatchLoss::new(distance, geometry, n_samples, rng));
        }
        *opts = unused;

        Self::new(stages, intervals).map_err(|e| ConfigError::invalid_value(format!("{}.intervals", opts.metric()), e.to_string()))
    }

    /// Stage the next call would use.
    pub fn stage(&self) -> usize {
        self.schedule.current()
    }

    /// Number of stages.
    pub fn stages(&self) -> usize {
        self.stages.len()
    }
}

impl Metric for MiniBatchMSPatchLoss {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compute(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        let stage = self.schedule.advance();
        self.stages[stage].compute(real, fake)
    }

    fn evaluate(&mut self, real: ArrayViewD<'_, f64>, fake: ArrayViewD<'_, f64>) -> OtResult<f64> {
        let stage = self.schedule.current();
        Ok(self.stages[stage].compute(real, fake)?.0)
    }

    #[cfg(feature = "tch-backend")]
    fn train_g(&mut self, critic: &dyn Critic, real: &Tensor, fake: &Tensor) -> OtResult<(Tensor, Diagnostics)> {
        let stage = self.schedule.advance();
        self.stages[stage].train_g(critic, real, fake)
    }
}
