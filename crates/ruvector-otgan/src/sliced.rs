//! Sliced Wasserstein Distance
//!
//! Approximates an OT distance in `D` dimensions by averaging exact 1-D
//! transport over random directions:
//!
//! 1. draw `num_proj` directions isotropically (normalised Gaussian draws),
//! 2. project both sets onto every direction,
//! 3. sort each projection and take the mean absolute difference.
//!
//! 1-D transport by sorting needs equal lengths, so when `N != M` the
//! shorter projection is tiled and topped up with randomly chosen columns
//! until both have `max(N, M)` entries; see [`duplicate_to_match_lengths`].
//!
//! ## Complexity
//!
//! - Projection: O((N + M) × D × P)
//! - Sorting: O(P × L log L) with `L = max(N, M)`

use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::index::sample;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{OtError, OtResult};
use crate::Diagnostics;

/// Diagnostic name reported by [`swd`].
pub const SWD_DIAGNOSTIC: &str = "SWD";

/// `dim × num_proj` matrix whose columns are random unit directions.
pub fn generate_directions<R: Rng + ?Sized>(dim: usize, num_proj: usize, rng: &mut R) -> Array2<f64> {
    let mut dirs = Array2::from_shape_simple_fn((dim, num_proj), || rng.sample::<f64, _>(StandardNormal));
    for mut col in dirs.columns_mut() {
        let norm = col.dot(&col).sqrt();
        if norm > f64::EPSILON {
            col.mapv_inplace(|v| v / norm);
        }
    }
    dirs
}

/// Bring two projection matrices (`P × N`, `P × M`) to a common column
/// count.
///
/// The one with fewer columns is tiled `⌊L / n⌋` times and then topped up
/// with `L mod n` distinct columns drawn without replacement from the
/// tiled copy, where `L` is the larger count. Inputs are returned in their
/// original order.
pub fn duplicate_to_match_lengths<R: Rng + ?Sized>(
    a: Array2<f64>,
    b: Array2<f64>,
    rng: &mut R,
) -> OtResult<(Array2<f64>, Array2<f64>)> {
    let (la, lb) = (a.ncols(), b.ncols());
    if la == lb {
        return Ok((a, b));
    }
    if la == 0 || lb == 0 {
        return Err(OtError::empty_input("cannot resample an empty projection"));
    }
    if la > lb {
        let b = stretch(b, la, rng)?;
        Ok((a, b))
    } else {
        let a = stretch(a, lb, rng)?;
        Ok((a, b))
    }
}

fn stretch<R: Rng + ?Sized>(short: Array2<f64>, target: usize, rng: &mut R) -> OtResult<Array2<f64>> {
    let picks = stretch_indices(short.ncols(), target, rng)?;
    Ok(short.select(Axis(1), &picks))
}

/// Column indices that bring `n` columns up to `target`: `⌊target / n⌋`
/// full passes over `0..n`, then `target mod n` distinct positions of the
/// tiled sequence.
pub(crate) fn stretch_indices<R: Rng + ?Sized>(n: usize, target: usize, rng: &mut R) -> OtResult<Vec<usize>> {
    if n == 0 {
        return Err(OtError::empty_input("cannot resample an empty projection"));
    }
    let tiled = (target / n) * n;
    let mut indices: Vec<usize> = (0..tiled).map(|i| i % n).collect();
    let extra = target - tiled;
    if extra > 0 {
        indices.extend(sample(rng, tiled, extra).into_iter().map(|i| i % n));
    }
    Ok(indices)
}

/// Mean absolute difference between row-wise sorted copies of `a` and `b`
/// (same shape).
pub fn sorted_mean_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    let mut total = 0.0;
    for (ra, rb) in a.outer_iter().zip(b.outer_iter()) {
        let mut sa = ra.to_vec();
        let mut sb = rb.to_vec();
        sa.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        sb.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        total += sa.iter().zip(&sb).map(|(x, y)| (x - y).abs()).sum::<f64>();
    }
    total / a.len() as f64
}

/// Sliced Wasserstein distance between the rows of `x` and `y`.
///
/// # Errors
///
/// [`OtError::InvalidParameter`] for `num_proj == 0`,
/// [`OtError::EmptyInput`] for an empty set and
/// [`OtError::DimensionMismatch`] when the feature dimensions differ.
pub fn swd<R: Rng + ?Sized>(
    x: ArrayView2<'_, f64>,
    y: ArrayView2<'_, f64>,
    num_proj: usize,
    rng: &mut R,
) -> OtResult<(f64, Diagnostics)> {
    if num_proj == 0 {
        return Err(OtError::invalid_parameter("num_proj", "must be > 0"));
    }
    if x.nrows() == 0 || y.nrows() == 0 {
        return Err(OtError::empty_input(format!("swd on {} and {} samples", x.nrows(), y.nrows())));
    }
    if x.ncols() != y.ncols() {
        return Err(OtError::DimensionMismatch { expected: x.ncols(), got: y.ncols(), context: "sliced wasserstein" });
    }

    let dirs = generate_directions(x.ncols(), num_proj, rng);
    // P × N and P × M
    let proj_x = dirs.t().dot(&x.t());
    let proj_y = dirs.t().dot(&y.t());
    let (proj_x, proj_y) = duplicate_to_match_lengths(proj_x, proj_y, rng)?;

    let value = sorted_mean_abs_diff(&proj_x, &proj_y);
    let mut diagnostics = Diagnostics::new();
    diagnostics.insert(SWD_DIAGNOSTIC.to_string(), value);
    Ok((value, diagnostics))
}
