//! Patch extraction and the multi-scale patch schedule.
//!
//! An image batch `B × C × H × W` is cut into `p × p` windows with stride
//! `s` on a grid of `oh × ow` locations, `oh = (H − p)/s + 1` (floored).
//! Every window becomes a vector of length `C·p²` laid out channel-major:
//! feature `c·p² + ki·p + kj` holds `image[b, c, top + ki, left + kj]`.
//!
//! - [`Patches::Pooled`]: `(B·L) × C·p²`, ordered by image then location;
//!   location identity is discarded.
//! - [`Patches::Located`]: `L × B × C·p²`, one sample set per location.

use ndarray::{Array2, Array3, ArrayView4, Axis};
use rand::seq::index::sample;
use rand::Rng;
use tracing::info;

use crate::error::{OtError, OtResult};

/// Window geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGeometry {
    /// Side length `p`.
    pub size: usize,
    /// Stride `s`.
    pub stride: usize,
}

impl PatchGeometry {
    /// Validated geometry.
    pub fn new(size: usize, stride: usize) -> OtResult<Self> {
        if size == 0 {
            return Err(OtError::invalid_parameter("p", "patch size must be > 0"));
        }
        if stride == 0 {
            return Err(OtError::invalid_parameter("s", "stride must be > 0"));
        }
        Ok(Self { size, stride })
    }

    /// Grid of window positions `(oh, ow)` for an `h × w` image.
    pub fn grid(&self, h: usize, w: usize) -> OtResult<(usize, usize)> {
        if self.size > h || self.size > w {
            return Err(OtError::invalid_parameter(
                "p",
                format!("patch size {} exceeds image size {h}x{w}", self.size),
            ));
        }
        Ok(((h - self.size) / self.stride + 1, (w - self.size) / self.stride + 1))
    }
}

/// Extracted patches.
#[derive(Debug, Clone, PartialEq)]
pub enum Patches {
    /// `(B·L) × C·p²` pool.
    Pooled(Array2<f64>),
    /// `L × B × C·p²`, grouped by location.
    Located(Array3<f64>),
}

impl Patches {
    /// Number of patch vectors.
    pub fn count(&self) -> usize {
        match self {
            Patches::Pooled(p) => p.nrows(),
            Patches::Located(p) => p.len_of(Axis(0)) * p.len_of(Axis(1)),
        }
    }

    /// Patch vector length `C·p²`.
    pub fn feature_len(&self) -> usize {
        match self {
            Patches::Pooled(p) => p.ncols(),
            Patches::Located(p) => p.len_of(Axis(2)),
        }
    }

    /// The pool, if location identity was discarded.
    pub fn into_pooled(self) -> Option<Array2<f64>> {
        match self {
            Patches::Pooled(p) => Some(p),
            Patches::Located(_) => None,
        }
    }

    /// The per-location array, if locations were kept.
    pub fn into_located(self) -> Option<Array3<f64>> {
        match self {
            Patches::Located(p) => Some(p),
            Patches::Pooled(_) => None,
        }
    }
}

/// All windows as `B × L × C·p²`.
fn unfold(images: ArrayView4<'_, f64>, geometry: PatchGeometry) -> OtResult<Array3<f64>> {
    let (b, c, h, w) = images.dim();
    let (oh, ow) = geometry.grid(h, w)?;
    let (p, s) = (geometry.size, geometry.stride);
    let mut out = Array3::zeros((b, oh * ow, c * p * p));

    for bi in 0..b {
        for li in 0..oh {
            for lj in 0..ow {
                let loc = li * ow + lj;
                let (top, left) = (li * s, lj * s);
                for ch in 0..c {
                    for ki in 0..p {
                        for kj in 0..p {
                            out[[bi, loc, ch * p * p + ki * p + kj]] = images[[bi, ch, top + ki, left + kj]];
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Cut an image batch into patch vectors.
///
/// With `sample_n`, that many entries of the first output axis (patches
/// when pooled, locations when located) are kept, drawn without
/// replacement. Asking for more than exist keeps everything.
pub fn to_patches<R: Rng + ?Sized>(
    images: ArrayView4<'_, f64>,
    geometry: PatchGeometry,
    sample_n: Option<usize>,
    remove_locations: bool,
    rng: &mut R,
) -> OtResult<Patches> {
    let windows = unfold(images, geometry)?;
    let (b, l, f) = windows.dim();

    if remove_locations {
        let pooled = windows
            .into_shape((b * l, f))
            .map_err(|e| OtError::numerical_instability(e.to_string()))?;
        let pooled = match sample_n {
            Some(k) if k < pooled.nrows() => {
                let picks = sample(rng, pooled.nrows(), k).into_vec();
                pooled.select(Axis(0), &picks)
            }
            _ => pooled,
        };
        Ok(Patches::Pooled(pooled))
    } else {
        let mut located = windows.permuted_axes([1, 0, 2]);
        if let Some(k) = sample_n {
            if k < l {
                let picks = sample(rng, l, k).into_vec();
                located = located.select(Axis(0), &picks);
            }
        }
        Ok(Patches::Located(located.as_standard_layout().into_owned()))
    }
}

/// Located patches at chosen location indices, for comparing two batches
/// at the same places.
pub fn to_patches_at(images: ArrayView4<'_, f64>, geometry: PatchGeometry, locations: &[usize]) -> OtResult<Array3<f64>> {
    let windows = unfold(images, geometry)?;
    let l = windows.len_of(Axis(1));
    if let Some(&bad) = locations.iter().find(|&&loc| loc >= l) {
        return Err(OtError::invalid_parameter("locations", format!("index {bad} out of {l} locations")));
    }
    Ok(windows.permuted_axes([1, 0, 2]).select(Axis(0), locations))
}

// ---------------------------------------------------------------------------
// Multi-scale schedule
// ---------------------------------------------------------------------------

/// Step-count curriculum over a list of stages.
///
/// Stage `k` lasts `intervals[k]` calls; the last stage has no interval and
/// persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiScaleSchedule {
    intervals: Vec<usize>,
    stage: usize,
    steps: usize,
}

impl MultiScaleSchedule {
    /// Schedule for `intervals.len() + 1` stages.
    pub fn new(intervals: Vec<usize>) -> Self {
        Self { intervals, stage: 0, steps: 0 }
    }

    /// Number of stages.
    pub fn stages(&self) -> usize {
        self.intervals.len() + 1
    }

    /// Stage the next [`advance`](Self::advance) would use without
    /// consuming a step.
    pub fn current(&self) -> usize {
        if self.stage < self.intervals.len() && self.steps >= self.intervals[self.stage] {
            self.stage + 1
        } else {
            self.stage
        }
    }

    /// Count one call and return the stage it runs in.
    pub fn advance(&mut self) -> usize {
        if self.stage < self.intervals.len() && self.steps >= self.intervals[self.stage] {
            self.stage += 1;
            self.steps = 0;
            info!(stage = self.stage, "multi-scale schedule advanced");
        }
        self.steps += 1;
        self.stage
    }

    /// Calls counted in the current stage.
    pub fn steps_in_stage(&self) -> usize {
        self.steps
    }
}
