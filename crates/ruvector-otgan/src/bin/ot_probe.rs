//! `ot-probe` binary: evaluate a configured metric on synthetic data.
//!
//! Two Gaussian sample sets are drawn, the second shifted by `--shift`
//! along every coordinate, and the metric is evaluated `--steps` times.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ot-probe -- --metric MiniBatchLoss-dist=swd-num_proj=64 --shift 2
//! cargo run --bin ot-probe -- --metric MiniBatchPatchLoss-p=4-s=2 --image-side 16 --json
//! ```

use clap::Parser;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::PathBuf;
use tracing::{error, info};

use ruvector_otgan::config::EngineConfig;
use ruvector_otgan::registry::MetricRegistry;
use ruvector_otgan::Diagnostics;

/// Command-line arguments for the probe binary.
#[derive(Parser, Debug)]
#[command(
    name = "ot-probe",
    version,
    about = "Evaluate an optimal-transport metric on synthetic Gaussian samples",
    long_about = None
)]
struct Args {
    /// Metric configuration string, e.g. `MiniBatchPatchLoss-dist=w1-p=8-s=4`.
    #[arg(short, long, default_value = "MiniBatchLoss-dist=w1")]
    metric: String,

    /// JSON engine configuration supplying metric defaults.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Samples in the real set.
    #[arg(long, default_value_t = 64)]
    n_real: usize,

    /// Samples in the generated set.
    #[arg(long, default_value_t = 64)]
    n_fake: usize,

    /// Feature dimension of flat samples.
    #[arg(long, default_value_t = 2)]
    dim: usize,

    /// Draw square images of this side instead of flat samples.
    #[arg(long)]
    image_side: Option<usize>,

    /// Image channels when `--image-side` is set.
    #[arg(long, default_value_t = 1)]
    channels: usize,

    /// Offset added to every coordinate of the generated set.
    #[arg(long, default_value_t = 1.0)]
    shift: f64,

    /// Number of metric calls (advances multi-scale schedules).
    #[arg(long, default_value_t = 1)]
    steps: usize,

    /// Seed for the synthetic data.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Print the final diagnostics as JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    info!("ot-probe v{}", ruvector_otgan::VERSION);

    let config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading engine configuration from {}", path.display());
            match EngineConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => EngineConfig::default(),
    };
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    let registry = MetricRegistry::with_config(config);
    let mut metric = match registry.configure(&args.metric) {
        Ok(m) => m,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let shape = |n: usize| -> Vec<usize> {
        match args.image_side {
            Some(side) => vec![n, args.channels, side, side],
            None => vec![n, args.dim],
        }
    };
    let mut rng = StdRng::seed_from_u64(args.seed);
    let real = gaussian(&shape(args.n_real), 0.0, &mut rng);
    let fake = gaussian(&shape(args.n_fake), args.shift, &mut rng);
    info!("real {:?}, fake {:?}, metric {}", real.shape(), fake.shape(), metric.name());

    let mut last = Diagnostics::new();
    for step in 0..args.steps.max(1) {
        match metric.compute(real.view(), fake.view()) {
            Ok((value, diagnostics)) => {
                info!(step, value, "{:?}", diagnostics);
                last = diagnostics;
            }
            Err(e) => {
                error!("Metric failed at step {step}: {e}");
                std::process::exit(1);
            }
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&last) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                error!("Failed to serialise diagnostics: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn gaussian(shape: &[usize], shift: f64, rng: &mut StdRng) -> ArrayD<f64> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || shift + rng.sample::<f64, _>(StandardNormal))
}
