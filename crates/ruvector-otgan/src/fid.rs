//! Fréchet distance in a feature space against a fixed reference set.
//!
//! A [`FidEvaluator`] owns its [`FeatureExtractor`] and the Gaussian fit of
//! the reference features, computed once at construction. Each
//! [`FidEvaluator::evaluate`] call extracts features from generated batches
//! and reports `{"FID": d²}`.

use ndarray::{concatenate, Array2, ArrayViewD, Axis};
use tracing::debug;

use crate::error::{OtError, OtResult};
use crate::frechet::{FrechetEstimator, GaussianStats};
use crate::metric::flatten_samples;
use crate::Diagnostics;

/// Diagnostic name reported by [`FidEvaluator::evaluate`].
pub const FID_DIAGNOSTIC: &str = "FID";

/// Maps a batch `N × …` to an `N × F` feature matrix.
pub trait FeatureExtractor: Send {
    /// Features of every sample in `batch`.
    fn extract(&self, batch: ArrayViewD<'_, f64>) -> OtResult<Array2<f64>>;
}

/// Raw pixels as features.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelFeatures;

impl FeatureExtractor for PixelFeatures {
    fn extract(&self, batch: ArrayViewD<'_, f64>) -> OtResult<Array2<f64>> {
        flatten_samples(batch)
    }
}

impl<F> FeatureExtractor for F
where
    F: Fn(ArrayViewD<'_, f64>) -> OtResult<Array2<f64>> + Send,
{
    fn extract(&self, batch: ArrayViewD<'_, f64>) -> OtResult<Array2<f64>> {
        self(batch)
    }
}

/// FID against reference statistics.
#[derive(Debug)]
pub struct FidEvaluator<E: FeatureExtractor = PixelFeatures> {
    extractor: E,
    reference: GaussianStats,
    estimator: FrechetEstimator,
}

impl<E: FeatureExtractor> FidEvaluator<E> {
    /// Fit the reference statistics on the features of `reference` batches.
    pub fn new(extractor: E, reference: &[ArrayViewD<'_, f64>]) -> OtResult<Self> {
        let features = extract_all(&extractor, reference)?;
        let reference = GaussianStats::from_samples(features.view())?;
        debug!(samples = features.nrows(), dim = reference.dim(), "fitted FID reference statistics");
        Ok(Self { extractor, reference, estimator: FrechetEstimator::default() })
    }

    /// Use `estimator` for the distance.
    pub fn with_estimator(mut self, estimator: FrechetEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Reference mean and covariance.
    pub fn reference(&self) -> &GaussianStats {
        &self.reference
    }

    /// FID of the generated `batches`.
    pub fn evaluate(&self, batches: &[ArrayViewD<'_, f64>]) -> OtResult<Diagnostics> {
        let features = extract_all(&self.extractor, batches)?;
        let stats = GaussianStats::from_samples(features.view())?;
        let value = self.estimator.distance_between(&self.reference, &stats)?;
        let mut diagnostics = Diagnostics::new();
        diagnostics.insert(FID_DIAGNOSTIC.to_string(), value);
        Ok(diagnostics)
    }
}

fn extract_all<E: FeatureExtractor>(extractor: &E, batches: &[ArrayViewD<'_, f64>]) -> OtResult<Array2<f64>> {
    if batches.is_empty() {
        return Err(OtError::empty_input("no batches to extract features from"));
    }
    let features = batches.iter().map(|b| extractor.extract(b.view())).collect::<OtResult<Vec<_>>>()?;
    let views: Vec<_> = features.iter().map(|f| f.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| OtError::numerical_instability(format!("feature batches disagree: {e}")))
}
