//! Integration tests for the sample-set estimators: cost matrices, sliced
//! Wasserstein, the discrete dual and the Fréchet distance.
//!
//! Random inputs come from seeded generators so every run sees the same
//! data.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use ruvector_otgan::dual::DualConfig;
use ruvector_otgan::sliced::duplicate_to_match_lengths;
use ruvector_otgan::{
    discrete_dual, frechet, ot_cost, pairwise_distance, pairwise_distance_batched, swd, BaseMetric, OtError,
};

fn gaussian(rng: &mut impl Rng, n: usize, d: usize) -> Array2<f64> {
    Array2::from_shape_simple_fn((n, d), || rng.sample(StandardNormal))
}

// ---------------------------------------------------------------------------
// Cost matrices
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_batched_equals_unbatched(bx in 1usize..9, by in 1usize..9, seed in 0u64..1000) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let x = gaussian(&mut rng, 5, 3);
        let y = gaussian(&mut rng, 7, 3);
        for metric in [BaseMetric::L2, BaseMetric::L1, BaseMetric::Euclidean] {
            let full = pairwise_distance(x.view(), y.view(), metric).unwrap();
            let blocked = pairwise_distance_batched(x.view(), y.view(), metric, bx, by).unwrap();
            prop_assert_eq!(full.dim(), (5, 7));
            for (a, b) in full.iter().zip(blocked.iter()) {
                prop_assert!((a - b).abs() < 1e-12, "{metric}: {a} vs {b}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sliced Wasserstein
// ---------------------------------------------------------------------------

#[test]
fn swd_of_a_set_with_itself_is_zero() {
    let mut rng = StdRng::seed_from_u64(21);
    let x = gaussian(&mut rng, 30, 4);
    let (d, diag) = swd(x.view(), x.view(), 128, &mut rng).unwrap();
    assert_abs_diff_eq!(d, 0.0, epsilon = 1e-12);
    assert_eq!(diag["SWD"], d);
}

#[test]
fn swd_accepts_unequal_set_sizes() {
    let mut rng = StdRng::seed_from_u64(2);
    let x = gaussian(&mut rng, 5, 3);
    let y = gaussian(&mut rng, 8, 3);
    let (d, _) = swd(x.view(), y.view(), 32, &mut rng).unwrap();
    assert!(d.is_finite() && d >= 0.0);

    // Both projection rows are brought to length 8.
    let (a, b) = duplicate_to_match_lengths(x.t().to_owned(), y.t().to_owned(), &mut rng).unwrap();
    assert_eq!(a.ncols(), 8);
    assert_eq!(b.ncols(), 8);
}

#[test]
fn swd_grows_with_the_shift() {
    let mut rng = StdRng::seed_from_u64(4);
    let x = gaussian(&mut rng, 64, 2);
    let near = x.mapv(|v| v + 0.5);
    let far = x.mapv(|v| v + 3.0);
    let (d_near, _) = swd(x.view(), near.view(), 64, &mut rng).unwrap();
    let (d_far, _) = swd(x.view(), far.view(), 64, &mut rng).unwrap();
    assert!(d_far > d_near, "{d_far} <= {d_near}");
}

// ---------------------------------------------------------------------------
// Discrete dual
// ---------------------------------------------------------------------------

#[test]
fn full_batch_dual_never_exceeds_the_exact_cost() {
    let mut rng = StdRng::seed_from_u64(12);
    let x = gaussian(&mut rng, 8, 2);
    let y = gaussian(&mut rng, 8, 2).mapv(|v| v + 1.0);
    let exact = ot_cost(pairwise_distance(x.view(), y.view(), BaseMetric::L2).unwrap().view(), 0.0).unwrap();

    let config = DualConfig { n_steps: 300, lr: 0.05, ..DualConfig::default() };
    let (estimate, diag) = discrete_dual(x.view(), y.view(), &config, &mut rng).unwrap();
    assert!(estimate <= exact + 1e-9, "dual {estimate} above primal {exact}");
    assert_eq!(diag["dual"], estimate);
}

#[test]
fn dual_rejects_mismatched_dimensions() {
    let mut rng = StdRng::seed_from_u64(0);
    let x = array![[0.0, 1.0]];
    let y = array![[0.0, 1.0, 2.0]];
    let err = discrete_dual(x.view(), y.view(), &DualConfig::default(), &mut rng).unwrap_err();
    assert!(matches!(err, OtError::DimensionMismatch { .. }));
}

// ---------------------------------------------------------------------------
// Fréchet distance
// ---------------------------------------------------------------------------

#[test]
fn frechet_of_a_set_with_itself_is_zero() {
    let mut rng = StdRng::seed_from_u64(5);
    let x = gaussian(&mut rng, 50, 3);
    let (d, diag) = frechet(x.view(), x.view()).unwrap();
    assert_abs_diff_eq!(d, 0.0, epsilon = 1e-9);
    assert_eq!(diag["Frechet-distance"], d);
}

#[test]
fn frechet_sees_a_mean_shift() {
    let mut rng = StdRng::seed_from_u64(2024);
    let x = gaussian(&mut rng, 100, 2);
    let y = gaussian(&mut rng, 100, 2);
    let (same, _) = frechet(x.view(), y.view()).unwrap();
    assert!(same >= -1e-9 && same < 0.5, "same-distribution distance {same}");

    // ‖(3, 4)‖ = 5
    let shifted = &y + &array![3.0, 4.0];
    let (far, _) = frechet(x.view(), shifted.view()).unwrap();
    assert!((far - 25.0).abs() < 3.0, "shifted distance {far}");
}
