//! Error types for the optimal-transport distance engine.
//!
//! Every module returns [`OtResult`]. Configuration problems (metric
//! strings, registry registration, JSON engine configs) live in
//! [`ConfigError`] and convert into [`OtError`] via [`From`].
//!
//! ## Hierarchy
//!
//! ```text
//! OtError (top-level)
//! ├── Config(ConfigError)   (metric strings, registry, config files)
//! ├── shape errors          (DimensionMismatch, ShapeMismatch, EmptyInput)
//! ├── numeric faults        (NonFiniteCost, NumericalInstability, ComplexResidue)
//! └── Unsupported           (metric invoked through the wrong calling convention)
//! ```

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// OtResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type OtResult<T> = Result<T, OtError>;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// The calling convention a metric was invoked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Discriminator (critic) update.
    Discriminator,
    /// Generator update.
    Generator,
    /// Gradient-free evaluation.
    Evaluate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Discriminator => f.write_str("train_d"),
            Step::Generator => f.write_str("train_g"),
            Step::Evaluate => f.write_str("evaluate"),
        }
    }
}

// ---------------------------------------------------------------------------
// OtError
// ---------------------------------------------------------------------------

/// Top-level error type of the distance engine.
#[derive(Debug, Error)]
pub enum OtError {
    /// A metric configuration could not be parsed or bound.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Feature dimensions of the two sample sets differ.
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected feature dimension.
        expected: usize,
        /// Actual feature dimension.
        got: usize,
        /// Where the mismatch was detected.
        context: &'static str,
    },

    /// An array had the wrong shape or rank.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape (0 marks a free axis).
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A computation needs at least one sample but got none.
    #[error("Empty input: {context}")]
    EmptyInput {
        /// What was empty.
        context: String,
    },

    /// A numeric parameter is out of range.
    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// The cost matrix handed to an OT solver contains NaN or infinity.
    #[error("Cost matrix entry ({row}, {col}) is not finite: {value}")]
    NonFiniteCost {
        /// Row of the first offending entry.
        row: usize,
        /// Column of the first offending entry.
        col: usize,
        /// The offending value.
        value: f64,
    },

    /// A numeric routine could not produce a finite result.
    #[error("Numerical instability: {message}")]
    NumericalInstability {
        /// Description of the failure.
        message: String,
    },

    /// The covariance square root kept a non-negligible imaginary part.
    #[error("Imaginary component {magnitude:e} in covariance square root")]
    ComplexResidue {
        /// Largest absolute imaginary part anywhere in the root.
        magnitude: f64,
    },

    /// The transportation simplex hit its pivot cap.
    #[error("Transportation simplex did not terminate after {iterations} pivots")]
    SolverStalled {
        /// Pivots performed.
        iterations: usize,
    },

    /// The metric does not implement the requested calling convention.
    #[error("`{metric}` does not support {step}: {hint}")]
    Unsupported {
        /// Metric name.
        metric: String,
        /// Requested step.
        step: Step,
        /// What the caller should do instead.
        hint: String,
    },

    /// Error raised by the tensor backend.
    #[cfg(feature = "tch-backend")]
    #[error("Tensor backend error: {0}")]
    Backend(#[from] tch::TchError),
}

impl OtError {
    /// Construct an [`OtError::InvalidParameter`].
    pub fn invalid_parameter<S: Into<String>>(name: &'static str, reason: S) -> Self {
        OtError::InvalidParameter { name, reason: reason.into() }
    }

    /// Construct an [`OtError::EmptyInput`].
    pub fn empty_input<S: Into<String>>(context: S) -> Self {
        OtError::EmptyInput { context: context.into() }
    }

    /// Construct an [`OtError::NumericalInstability`].
    pub fn numerical_instability<S: Into<String>>(message: S) -> Self {
        OtError::NumericalInstability { message: message.into() }
    }

    /// Construct an [`OtError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<usize>, actual: Vec<usize>) -> Self {
        OtError::ShapeMismatch { expected, actual }
    }

    /// Construct an [`OtError::Unsupported`].
    pub fn unsupported<S: Into<String>, H: Into<String>>(metric: S, step: Step, hint: H) -> Self {
        OtError::Unsupported { metric: metric.into(), step, hint: hint.into() }
    }

    /// Returns `true` for the explicit "unsupported calling convention" signal.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, OtError::Unsupported { .. })
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced while parsing metric strings, registering factories or
/// loading an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The metric string has no name before the first `-`.
    #[error("Metric spec `{spec}` has an empty name")]
    EmptyName {
        /// The full spec.
        spec: String,
    },

    /// An option segment lacks `=` or has an empty key.
    #[error("Malformed option `{segment}` in metric spec `{spec}` (expected key=value)")]
    MalformedOption {
        /// The offending segment.
        segment: String,
        /// The full spec.
        spec: String,
    },

    /// No factory is registered under this name.
    #[error("Unknown metric `{name}` (known: {known})")]
    UnknownMetric {
        /// Requested name.
        name: String,
        /// Comma-separated registered names.
        known: String,
    },

    /// No sample distance is known under this name.
    #[error("Unknown distance `{name}` (known: w1, swd, discrete_dual, fd)")]
    UnknownDistance {
        /// Requested name.
        name: String,
    },

    /// Options left over after the factory consumed the ones it knows.
    #[error("Metric `{metric}` does not accept option(s) {options}")]
    UnknownOption {
        /// Metric name.
        metric: String,
        /// Comma-separated leftover keys.
        options: String,
    },

    /// A factory name was registered twice or is not a valid name.
    #[error("Cannot register metric `{name}`: {reason}")]
    Registration {
        /// Offending name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A field or option has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read or written.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<F: Into<String>, S: Into<String>>(field: F, reason: S) -> Self {
        ConfigError::InvalidValue { field: field.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
