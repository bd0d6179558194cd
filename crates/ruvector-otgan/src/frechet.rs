//! Fréchet distance between Gaussian fits of two sample sets.
//!
//! ```text
//! d² = ‖m₁ − m₂‖² + Tr(C₁) + Tr(C₂) − 2·Tr(√(C₁C₂))
//! ```
//!
//! The square root is the principal one, computed from a complex Schur
//! factorisation `A = Q T Qᴴ` with the triangular recurrence
//!
//! ```text
//! R_ii = √T_ii,   R_ij = (T_ij − Σ_{i<k<j} R_ik R_kj) / (R_ii + R_jj)
//! ```
//!
//! Stability protocol:
//!
//! 1. `√(C₁C₂)`; if any entry is non-finite, warn and retry once on
//!    `(C₁ + εI)(C₂ + εI)`. A second failure is an error.
//! 2. If an imaginary part on the diagonal of the root exceeds the
//!    tolerance the call fails with [`OtError::ComplexResidue`]. Smaller
//!    imaginary parts are dropped.
//!
//! Evaluation only; nothing here is differentiable.

use nalgebra::{DMatrix, Schur};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use num_complex::Complex64;
use tracing::warn;

use crate::error::{OtError, OtResult};
use crate::Diagnostics;

/// Diagnostic name reported by the estimator.
pub const FRECHET_DIAGNOSTIC: &str = "Frechet-distance";

/// Mean and covariance of a sample set.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianStats {
    /// Mean vector (length D).
    pub mean: Array1<f64>,
    /// Unbiased covariance (D × D, normalised by N − 1).
    pub cov: Array2<f64>,
}

impl GaussianStats {
    /// Fit a Gaussian to the rows of `x`. Needs at least two rows.
    pub fn from_samples(x: ArrayView2<'_, f64>) -> OtResult<Self> {
        let n = x.nrows();
        if n < 2 {
            return Err(OtError::empty_input(format!("covariance needs at least 2 samples, got {n}")));
        }
        let mean = x.mean_axis(Axis(0)).ok_or_else(|| OtError::empty_input("mean of an empty set"))?;
        let centered = &x - &mean;
        let cov = centered.t().dot(&centered) / (n as f64 - 1.0);
        Ok(Self { mean, cov })
    }

    /// Feature dimension.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Principal square root of a real square matrix.
///
/// Entries come back non-finite when the matrix has a repeated zero
/// eigenvalue with a non-trivial Jordan block.
pub fn sqrtm(a: ArrayView2<'_, f64>) -> OtResult<Array2<Complex64>> {
    let (n, m) = a.dim();
    if n != m {
        return Err(OtError::shape_mismatch(vec![n, n], vec![n, m]));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(OtError::numerical_instability("sqrtm input has non-finite entries"));
    }
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }

    let mat = DMatrix::<Complex64>::from_fn(n, n, |i, j| Complex64::new(a[[i, j]], 0.0));
    let schur = Schur::try_new(mat, f64::EPSILON, 0)
        .ok_or_else(|| OtError::numerical_instability("complex Schur factorisation did not converge"))?;
    let (q, t) = schur.unpack();

    let mut r = DMatrix::<Complex64>::zeros(n, n);
    for i in 0..n {
        r[(i, i)] = t[(i, i)].sqrt();
    }
    for j in 1..n {
        for i in (0..j).rev() {
            let mut s = t[(i, j)];
            for k in (i + 1)..j {
                s -= r[(i, k)] * r[(k, j)];
            }
            r[(i, j)] = s / (r[(i, i)] + r[(j, j)]);
        }
    }

    let root = &q * r * q.adjoint();
    Ok(Array2::from_shape_fn((n, n), |(i, j)| root[(i, j)]))
}

/// Fréchet distance with the regularisation retry and the imaginary-part
/// check.
#[derive(Debug, Clone, PartialEq)]
pub struct FrechetEstimator {
    /// Diagonal offset for the retry. Default: **1e-6**.
    pub eps: f64,
    /// Largest tolerated imaginary part on the diagonal of the root.
    /// Default: **1e-3**.
    pub imaginary_tolerance: f64,
}

impl Default for FrechetEstimator {
    fn default() -> Self {
        Self { eps: 1e-6, imaginary_tolerance: 1e-3 }
    }
}

impl FrechetEstimator {
    /// Estimator with retry offset `eps`.
    pub fn new(eps: f64) -> Self {
        Self { eps, ..Self::default() }
    }

    /// Override the imaginary-part tolerance.
    pub fn with_imaginary_tolerance(mut self, tolerance: f64) -> Self {
        self.imaginary_tolerance = tolerance;
        self
    }

    /// Distance between two fitted Gaussians.
    pub fn distance_between(&self, a: &GaussianStats, b: &GaussianStats) -> OtResult<f64> {
        let d = a.dim();
        if b.dim() != d {
            return Err(OtError::DimensionMismatch { expected: d, got: b.dim(), context: "frechet distance" });
        }
        if a.cov.dim() != (d, d) {
            return Err(OtError::shape_mismatch(vec![d, d], a.cov.shape().to_vec()));
        }
        if b.cov.dim() != (d, d) {
            return Err(OtError::shape_mismatch(vec![d, d], b.cov.shape().to_vec()));
        }

        let diff = &a.mean - &b.mean;
        let mut root = sqrtm(a.cov.dot(&b.cov).view())?;
        if !root.iter().all(|z| z.re.is_finite() && z.im.is_finite()) {
            warn!(eps = self.eps, "covariance product is singular; adding eps to the diagonal of both covariances");
            let offset = Array2::<f64>::eye(d) * self.eps;
            root = sqrtm((&a.cov + &offset).dot(&(&b.cov + &offset)).view())?;
            if !root.iter().all(|z| z.re.is_finite() && z.im.is_finite()) {
                return Err(OtError::numerical_instability("covariance square root is not finite after regularisation"));
            }
        }

        let diag_imag = root.diag().iter().fold(0.0_f64, |acc, z| acc.max(z.im.abs()));
        if diag_imag > self.imaginary_tolerance {
            let magnitude = root.iter().fold(0.0_f64, |acc, z| acc.max(z.im.abs()));
            return Err(OtError::ComplexResidue { magnitude });
        }

        let tr_covmean: f64 = root.diag().iter().map(|z| z.re).sum();
        Ok(diff.dot(&diff) + a.cov.diag().sum() + b.cov.diag().sum() - 2.0 * tr_covmean)
    }

    /// Fit both sets and return the distance with its diagnostic.
    pub fn distance(&self, x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> OtResult<(f64, Diagnostics)> {
        if x.ncols() != y.ncols() {
            return Err(OtError::DimensionMismatch { expected: x.ncols(), got: y.ncols(), context: "frechet distance" });
        }
        let value = self.distance_between(&GaussianStats::from_samples(x)?, &GaussianStats::from_samples(y)?)?;
        let mut diagnostics = Diagnostics::new();
        diagnostics.insert(FRECHET_DIAGNOSTIC.to_string(), value);
        Ok((value, diagnostics))
    }
}

/// Fréchet distance with default settings.
///
/// When a covariance is rank-deficient (for example fewer samples than
/// dimensions) the result can come out slightly below zero, on the order of
/// the regularisation offset. It is returned as computed, not clamped.
pub fn frechet(x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> OtResult<(f64, Diagnostics)> {
    FrechetEstimator::default().distance(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn covariance_is_unbiased() {
        let x = array![[1.0, 2.0], [3.0, 6.0], [5.0, 10.0]];
        let stats = GaussianStats::from_samples(x.view()).unwrap();
        assert_abs_diff_eq!(stats.mean[0], 3.0);
        assert_abs_diff_eq!(stats.mean[1], 6.0);
        assert_abs_diff_eq!(stats.cov[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.cov[[0, 1]], 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.cov[[1, 1]], 16.0, epsilon = 1e-12);
    }

    #[test]
    fn sqrtm_squares_back() {
        let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 2.0]];
        let root = sqrtm(a.view()).unwrap();
        let n = a.nrows();
        for i in 0..n {
            for j in 0..n {
                let v: Complex64 = (0..n).map(|k| root[[i, k]] * root[[k, j]]).sum();
                assert_abs_diff_eq!(v.re, a[[i, j]], epsilon = 1e-10);
                assert_abs_diff_eq!(v.im, 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn sqrtm_of_non_symmetric_product() {
        // Product of two SPD matrices is not symmetric but has a real root.
        let c1 = array![[2.0, 0.5], [0.5, 1.0]];
        let c2 = array![[1.0, -0.3], [-0.3, 3.0]];
        let p = c1.dot(&c2);
        let root = sqrtm(p.view()).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let v: Complex64 = (0..2).map(|k| root[[i, k]] * root[[k, j]]).sum();
                assert_abs_diff_eq!(v.re, p[[i, j]], epsilon = 1e-10);
            }
            assert!(root[[i, i]].im.abs() < 1e-10);
        }
    }

    #[test]
    fn self_distance_is_zero() {
        let x = array![[0.1, 1.0, 2.0], [1.5, -0.5, 0.3], [2.0, 2.5, -1.0], [0.0, 0.2, 0.9], [-1.0, 1.1, 0.4]];
        let (d, diag) = frechet(x.view(), x.view()).unwrap();
        assert_abs_diff_eq!(d, 0.0, epsilon = 1e-9);
        assert_eq!(diag[FRECHET_DIAGNOSTIC], d);
    }

    #[test]
    fn mean_shift_adds_squared_norm() {
        let x = array![[0.1, 1.0], [1.5, -0.5], [2.0, 2.5], [0.0, 0.2]];
        let y = x.mapv(|v| v) + &array![3.0, 4.0];
        let (d, _) = frechet(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(d, 25.0, epsilon = 1e-9);
    }

    #[test]
    fn singular_product_is_regularised() {
        // X varies only along axis 0, Y only along axis 1: C1·C2 = 0.
        let x = array![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]];
        let y = array![[0.0, 0.0], [0.0, 1.0], [0.0, 2.0]];
        let (a, b) = (GaussianStats::from_samples(x.view()).unwrap(), GaussianStats::from_samples(y.view()).unwrap());
        let first = sqrtm(a.cov.dot(&b.cov).view()).unwrap();
        assert!(first.iter().any(|z| !z.re.is_finite() || !z.im.is_finite()));

        let (d, _) = frechet(x.view(), y.view()).unwrap();
        assert!(d.is_finite());
        // ‖m1 − m2‖² = 2, Tr(C1) + Tr(C2) = 2, covmean trace is O(√eps).
        assert_abs_diff_eq!(d, 4.0, epsilon = 1e-2);
    }

    #[test]
    fn rank_deficient_self_distance_stays_near_zero() {
        // Fewer samples than dimensions: both covariances are singular.
        let x = Array2::from_shape_fn((5, 10), |(i, j)| ((i * 10 + j) as f64 * 0.7).sin());
        let (d, _) = frechet(x.view(), x.view()).unwrap();
        assert!(d.abs() < 1e-4, "self-distance {d}");
    }

    #[test]
    fn imaginary_residue_is_an_error() {
        let a = GaussianStats { mean: array![0.0, 0.0], cov: array![[-1.0, 0.0], [0.0, 1.0]] };
        let b = GaussianStats { mean: array![0.0, 0.0], cov: Array2::eye(2) };
        match FrechetEstimator::default().distance_between(&a, &b) {
            Err(OtError::ComplexResidue { magnitude }) => assert_abs_diff_eq!(magnitude, 1.0, epsilon = 1e-12),
            other => panic!("expected ComplexResidue, got {other:?}"),
        }
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let x = array![[1.0, 2.0]];
        assert!(matches!(frechet(x.view(), x.view()), Err(OtError::EmptyInput { .. })));
    }
}
