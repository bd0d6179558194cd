//! # Optimal-Transport Distances for GAN Training
//!
//! This crate measures how far apart two sample sets are (real data and
//! generator output) with optimal-transport distances. The same metrics
//! serve as generator losses during training and as evaluation scores.
//!
//! ## Architecture
//!
//! ```text
//! "MiniBatchPatchLoss-dist=w1-p=8-s=4"
//!       │
//!       ▼
//! MetricRegistry ──► Box<dyn Metric>
//!                         │
//!            patches / flatten_samples
//!                         │
//!                         ▼
//!                  SampleDistance
//!        ┌──────────┬─────┴──────┬──────────────┐
//!        ▼          ▼            ▼              ▼
//!   w1 (OtSolver)  swd   discrete_dual    fd (frechet)
//!        │
//!   Hungarian | transportation simplex | Sinkhorn
//! ```
//!
//! With the `tch-backend` feature the [`graph`] module rebuilds each loss on
//! `tch` tensors so it can be back-propagated to the generator.
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use ruvector_otgan::registry::MetricRegistry;
//!
//! let registry = MetricRegistry::with_defaults();
//! let mut metric = registry.configure("MiniBatchLoss-dist=w1").unwrap();
//!
//! let real = array![[0.0, 0.0], [1.0, 0.0]].into_dyn();
//! let fake = array![[0.0, 1.0], [1.0, 1.0]].into_dyn();
//! let (value, diagnostics) = metric.compute(real.view(), fake.view()).unwrap();
//! assert!((value - 1.0).abs() < 1e-12);
//! assert!(diagnostics.contains_key("W1-L2"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod distance;
pub mod distribution;
pub mod dual;
pub mod error;
pub mod fid;
pub mod frechet;
pub mod metric;
pub mod ot_means;
pub mod patches;
pub mod registry;
pub mod sliced;
pub mod transport;

#[cfg(feature = "tch-backend")]
pub mod graph;

// Convenient re-exports at the crate root.
pub use config::{EngineConfig, MetricSpec, Options};
pub use distance::{pairwise_distance, pairwise_distance_batched, BaseMetric};
pub use distribution::{SampleDistance, W1Distance};
pub use dual::{discrete_dual, DiscreteDualSolver, DualConfig};
pub use error::{ConfigError, OtError, OtResult, Step};
pub use fid::{FeatureExtractor, FidEvaluator, PixelFeatures};
pub use frechet::{frechet, FrechetEstimator, GaussianStats};
pub use metric::{Metric, MiniBatchLocalPatchLoss, MiniBatchLoss, MiniBatchMSPatchLoss, MiniBatchPatchLoss};
pub use ot_means::{CentroidUpdate, OtMeans, OtMeansFit};
pub use patches::{to_patches, MultiScaleSchedule, PatchGeometry, Patches};
pub use registry::{configure, MetricRegistry};
pub use sliced::swd;
pub use transport::{ot_cost, ot_plan, OtSolver, TransportPlan};

/// Named scalar diagnostics reported next to every metric value.
pub type Diagnostics = std::collections::BTreeMap<String, f64>;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
