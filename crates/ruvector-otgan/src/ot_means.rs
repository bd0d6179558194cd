//! OT-means clustering.
//!
//! K-means with the hard assignment replaced by a balanced transport plan:
//! every centroid receives mass `1/K` and every point sends `1/N`, so all
//! clusters are forced to the same size. Costs are Euclidean distances.
//!
//! Two centroid updates are available:
//!
//! - [`CentroidUpdate::Barycentric`]: `centroids = K · P · X`, the
//!   plan-weighted mean of each centroid's points.
//! - [`CentroidUpdate::Weiszfeld`]: `steps` rounds of re-solving the plan
//!   and moving each centroid to `Σⱼ (Pᵢⱼ/Cᵢⱼ) xⱼ / Σⱼ Pᵢⱼ/Cᵢⱼ`, which
//!   approximates the plan-weighted geometric median.

use ndarray::{Array2, ArrayView2, Axis, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::distance::{pairwise_distance, BaseMetric};
use crate::error::{OtError, OtResult};
use crate::transport::{OtSolver, TransportPlan};

/// Distances below this are clamped in the Weiszfeld weights.
const MIN_DISTANCE: f64 = 1e-12;

/// How centroids move after each plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentroidUpdate {
    /// Plan-weighted mean.
    Barycentric,
    /// Plan-weighted geometric median by Weiszfeld iteration.
    Weiszfeld {
        /// Plan/update rounds per outer iteration.
        steps: usize,
    },
}

/// Result of [`OtMeans::fit`].
#[derive(Debug, Clone)]
pub struct OtMeansFit {
    /// `K × D` centroids.
    pub centroids: Array2<f64>,
    /// Centroid index of each point, from the final plan.
    pub assignment: Vec<usize>,
    /// Transport cost after every iteration.
    pub losses: Vec<f64>,
}

/// OT-means settings.
#[derive(Debug, Clone)]
pub struct OtMeans {
    k: usize,
    n_iters: usize,
    update: CentroidUpdate,
    solver: OtSolver,
}

impl OtMeans {
    /// `k` clusters, `n_iters` outer iterations, barycentric updates.
    pub fn new(k: usize, n_iters: usize) -> OtResult<Self> {
        if k == 0 {
            return Err(OtError::invalid_parameter("k", "must be > 0"));
        }
        if n_iters == 0 {
            return Err(OtError::invalid_parameter("n_iters", "must be > 0"));
        }
        Ok(Self { k, n_iters, update: CentroidUpdate::Barycentric, solver: OtSolver::new(0.0) })
    }

    /// Choose the centroid update.
    pub fn with_update(mut self, update: CentroidUpdate) -> OtResult<Self> {
        if let CentroidUpdate::Weiszfeld { steps: 0 } = update {
            return Err(OtError::invalid_parameter("steps", "Weiszfeld needs at least one step"));
        }
        self.update = update;
        Ok(self)
    }

    /// Fit from centroids drawn from `N(0, 0.25)`.
    pub fn fit<R: Rng + ?Sized>(&self, data: ArrayView2<'_, f64>, rng: &mut R) -> OtResult<OtMeansFit> {
        let init = Array2::from_shape_simple_fn((self.k, data.ncols()), || 0.5 * rng.sample::<f64, _>(StandardNormal));
        self.fit_from(data, init)
    }

    /// Fit from the given `K × D` initial centroids.
    pub fn fit_from(&self, data: ArrayView2<'_, f64>, init: Array2<f64>) -> OtResult<OtMeansFit> {
        if data.nrows() == 0 {
            return Err(OtError::empty_input("OT-means on an empty data set"));
        }
        if init.dim() != (self.k, data.ncols()) {
            return Err(OtError::shape_mismatch(vec![self.k, data.ncols()], init.shape().to_vec()));
        }

        let mut centroids = init;
        let mut losses = Vec::with_capacity(self.n_iters);
        for iteration in 0..self.n_iters {
            let loss = match self.update {
                CentroidUpdate::Barycentric => {
                    let (plan, _) = self.plan(centroids.view(), data)?;
                    centroids = plan.plan.dot(&data) * self.k as f64;
                    let cost = pairwise_distance(centroids.view(), data, BaseMetric::Euclidean)?;
                    (&plan.plan * &cost).sum()
                }
                CentroidUpdate::Weiszfeld { steps } => {
                    for _ in 0..steps {
                        let (plan, cost) = self.plan(centroids.view(), data)?;
                        centroids = weiszfeld_step(data, &cost, &plan.plan, &centroids);
                    }
                    self.plan(centroids.view(), data)?.0.cost
                }
            };
            debug!(iteration, loss, "OT-means iteration");
            losses.push(loss);
        }

        let (plan, _) = self.plan(centroids.view(), data)?;
        let assignment = plan
            .plan
            .columns()
            .into_iter()
            .map(|col| {
                col.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                    .0
            })
            .collect();

        Ok(OtMeansFit { centroids, assignment, losses })
    }

    fn plan(&self, centroids: ArrayView2<'_, f64>, data: ArrayView2<'_, f64>) -> OtResult<(TransportPlan, Array2<f64>)> {
        let cost = pairwise_distance(centroids, data, BaseMetric::Euclidean)?;
        let plan = self.solver.solve(cost.view())?;
        Ok((plan, cost))
    }
}

/// One Weiszfeld update. A centroid with no weighted mass stays put.
fn weiszfeld_step(data: ArrayView2<'_, f64>, cost: &Array2<f64>, plan: &Array2<f64>, previous: &Array2<f64>) -> Array2<f64> {
    let mut weights = plan.clone();
    Zip::from(&mut weights).and(cost).for_each(|w, &c| *w /= c.max(MIN_DISTANCE));
    let numerator = weights.dot(&data);
    let denominator = weights.sum_axis(Axis(1));

    let mut next = previous.clone();
    for (i, mut row) in next.outer_iter_mut().enumerate() {
        if denominator[i] > 0.0 {
            row.assign(&(&numerator.row(i) / denominator[i]));
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_clusters() -> Array2<f64> {
        array![[0.0, 0.0], [0.0, 1.0], [10.0, 0.0], [10.0, 1.0]]
    }

    #[test]
    fn barycentric_finds_cluster_means() {
        let data = two_clusters();
        let fit = OtMeans::new(2, 3).unwrap().fit_from(data.view(), array![[1.0, 0.0], [9.0, 0.0]]).unwrap();
        assert_abs_diff_eq!(fit.centroids[[0, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.centroids[[0, 1]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.centroids[[1, 0]], 10.0, epsilon = 1e-12);
        assert_eq!(fit.assignment, vec![0, 0, 1, 1]);
        // Each point is 0.5 from its centroid.
        assert_abs_diff_eq!(*fit.losses.last().unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn weiszfeld_lands_on_the_segment() {
        let data = two_clusters();
        let fit = OtMeans::new(2, 2)
            .unwrap()
            .with_update(CentroidUpdate::Weiszfeld { steps: 1 })
            .unwrap()
            .fit_from(data.view(), array![[1.0, 0.0], [9.0, 0.0]])
            .unwrap();
        // Any point between the two members is a geometric median.
        assert_abs_diff_eq!(fit.centroids[[0, 0]], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.centroids[[1, 0]], 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(*fit.losses.last().unwrap(), 0.5, epsilon = 1e-9);
        assert_eq!(fit.assignment, vec![0, 0, 1, 1]);
    }

    #[test]
    fn clusters_are_balanced() {
        let mut rng = StdRng::seed_from_u64(8);
        let data = Array2::from_shape_fn((12, 3), |(i, j)| ((i * 7 + j * 3) % 5) as f64);
        let fit = OtMeans::new(3, 4).unwrap().fit(data.view(), &mut rng).unwrap();
        for c in 0..3 {
            assert_eq!(fit.assignment.iter().filter(|&&a| a == c).count(), 4);
        }
        assert_eq!(fit.losses.len(), 4);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(OtMeans::new(0, 1).is_err());
        assert!(OtMeans::new(2, 0).is_err());
        assert!(OtMeans::new(2, 1).unwrap().with_update(CentroidUpdate::Weiszfeld { steps: 0 }).is_err());
        let data = two_clusters();
        assert!(OtMeans::new(3, 1).unwrap().fit_from(data.view(), Array2::zeros((2, 2))).is_err());
    }
}
