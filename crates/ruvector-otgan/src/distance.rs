//! Pairwise distance matrices between two sample sets.
//!
//! Rows of `x` (N×D) and `y` (M×D) are points; the result is the N×M matrix
//! `C[i, j] = d(x[i], y[j])`. Squared Euclidean is the default and uses the
//! Gram identity `‖x‖² + ‖y‖² − 2x·y`, so the bulk of the work is one
//! matrix product.
//!
//! [`pairwise_distance_batched`] fills the same matrix block by block to
//! bound the size of the intermediate products.

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, OtError, OtResult};

/// Base distance between two vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BaseMetric {
    /// Squared Euclidean distance `‖x − y‖²`.
    #[default]
    L2,
    /// Manhattan distance `Σ |x_k − y_k|`.
    L1,
    /// Euclidean distance `‖x − y‖`.
    Euclidean,
}

impl BaseMetric {
    /// Short name used in configuration strings and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseMetric::L2 => "L2",
            BaseMetric::L1 => "L1",
            BaseMetric::Euclidean => "Euclidean",
        }
    }

    /// Distance between two single vectors.
    pub fn between(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            BaseMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            BaseMetric::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
            BaseMetric::Euclidean => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt(),
        }
    }
}

impl fmt::Display for BaseMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "sqeuclidean" => Ok(BaseMetric::L2),
            "l1" | "manhattan" => Ok(BaseMetric::L1),
            "euclidean" => Ok(BaseMetric::Euclidean),
            _ => Err(ConfigError::invalid_value("base", format!("unknown base metric `{s}`"))),
        }
    }
}

/// Full N×M distance matrix between the rows of `x` and `y`.
///
/// Returns an empty matrix when either set is empty.
///
/// # Errors
///
/// [`OtError::DimensionMismatch`] when the feature dimensions differ.
pub fn pairwise_distance(x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>, metric: BaseMetric) -> OtResult<Array2<f64>> {
    check_dims(&x, &y)?;
    let (n, m) = (x.nrows(), y.nrows());
    if n == 0 || m == 0 {
        return Ok(Array2::zeros((n, m)));
    }

    let c = match metric {
        BaseMetric::L2 => squared_euclidean(x, y),
        BaseMetric::Euclidean => squared_euclidean(x, y).mapv_into(f64::sqrt),
        BaseMetric::L1 => {
            let mut c = Array2::zeros((n, m));
            for (i, xi) in x.outer_iter().enumerate() {
                for (j, yj) in y.outer_iter().enumerate() {
                    c[[i, j]] = xi.iter().zip(yj.iter()).map(|(a, b)| (a - b).abs()).sum();
                }
            }
            c
        }
    };
    Ok(c)
}

/// Same matrix as [`pairwise_distance`], computed in `bx × by` blocks.
///
/// # Errors
///
/// [`OtError::InvalidParameter`] when a block size is zero, plus the errors
/// of [`pairwise_distance`].
pub fn pairwise_distance_batched(
    x: ArrayView2<'_, f64>,
    y: ArrayView2<'_, f64>,
    metric: BaseMetric,
    bx: usize,
    by: usize,
) -> OtResult<Array2<f64>> {
    if bx == 0 {
        return Err(OtError::invalid_parameter("bx", "block size must be > 0"));
    }
    if by == 0 {
        return Err(OtError::invalid_parameter("by", "block size must be > 0"));
    }
    check_dims(&x, &y)?;

    let (n, m) = (x.nrows(), y.nrows());
    let mut c = Array2::zeros((n, m));
    for i0 in (0..n).step_by(bx) {
        let i1 = (i0 + bx).min(n);
        for j0 in (0..m).step_by(by) {
            let j1 = (j0 + by).min(m);
            let block = pairwise_distance(x.slice(s![i0..i1, ..]), y.slice(s![j0..j1, ..]), metric)?;
            c.slice_mut(s![i0..i1, j0..j1]).assign(&block);
        }
    }
    Ok(c)
}

/// `‖x‖² + ‖y‖² − 2x·y`, clamped at zero against cancellation.
fn squared_euclidean(x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> Array2<f64> {
    let xx: Array1<f64> = x.map_axis(Axis(1), |row| row.dot(&row));
    let yy: Array1<f64> = y.map_axis(Axis(1), |row| row.dot(&row));
    let mut c = x.dot(&y.t());
    for ((i, j), v) in c.indexed_iter_mut() {
        *v = (xx[i] + yy[j] - 2.0 * *v).max(0.0);
    }
    c
}

fn check_dims(x: &ArrayView2<'_, f64>, y: &ArrayView2<'_, f64>) -> OtResult<()> {
    if x.ncols() != y.ncols() {
        return Err(OtError::DimensionMismatch {
            expected: x.ncols(),
            got: y.ncols(),
            context: "pairwise distance",
        });
    }
    Ok(())
}
