//! Metric configuration strings and engine-wide defaults.
//!
//! A metric is selected with a hyphen-delimited string:
//!
//! ```text
//! <Name>-<key>=<value>-<key>=<value>...
//! ```
//!
//! [`MetricSpec::parse`] splits such a string into a name and a raw option
//! map. Factories pull typed values out of an [`Options`] view and reject
//! whatever they did not consume. Values may not contain `-`.
//!
//! [`EngineConfig`] carries the defaults those options override. It is
//! serializable via [`serde`] so it can be stored to / restored from JSON.
//!
//! # Example
//!
//! ```rust
//! use ruvector_otgan::config::MetricSpec;
//!
//! let spec: MetricSpec = "MiniBatchPatchLoss-dist=w1-p=8-s=4".parse().unwrap();
//! assert_eq!(spec.name, "MiniBatchPatchLoss");
//! assert_eq!(spec.options["p"], "8");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::distance::BaseMetric;
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// MetricSpec
// ---------------------------------------------------------------------------

/// A parsed metric configuration string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricSpec {
    /// Metric name (the part before the first `-`).
    pub name: String,
    /// Raw option values keyed by option name.
    pub options: BTreeMap<String, String>,
}

impl MetricSpec {
    /// Parse `Name-k=v-k=v`. Duplicate keys keep the last value.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyName`] when nothing precedes the first `-`,
    /// [`ConfigError::MalformedOption`] for a segment without `=` or with an
    /// empty key.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        let mut segments = spec.split('-');
        let name = segments.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName { spec: spec.to_string() });
        }

        let mut options = BTreeMap::new();
        for segment in segments {
            let (key, value) = segment.split_once('=').ok_or_else(|| ConfigError::MalformedOption {
                segment: segment.to_string(),
                spec: spec.to_string(),
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::MalformedOption {
                    segment: segment.to_string(),
                    spec: spec.to_string(),
                });
            }
            if let Some(previous) = options.insert(key.to_string(), value.trim().to_string()) {
                tracing::debug!(key, previous = %previous, "duplicate metric option, keeping last value");
            }
        }

        Ok(Self { name: name.to_string(), options })
    }

    /// Typed view over the options, tagged with the metric name for errors.
    pub fn options(&self) -> Options {
        Options::new(self.name.clone(), self.options.clone())
    }
}

impl FromStr for MetricSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricSpec::parse(s)
    }
}

impl fmt::Display for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.options {
            write!(f, "-{key}={value}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Consumable option map handed to metric factories.
///
/// Each `take*` call removes the key; [`Options::finish`] fails if any key is
/// left, so misspelled options surface as configuration errors.
#[derive(Debug, Clone)]
pub struct Options {
    metric: String,
    values: BTreeMap<String, String>,
}

impl Options {
    /// Wrap raw values for `metric`.
    pub fn new<S: Into<String>>(metric: S, values: BTreeMap<String, String>) -> Self {
        Self { metric: metric.into(), values }
    }

    /// Name of the metric these options belong to.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Remove and return a raw string value.
    pub fn take_str(&mut self, key: &str) -> Option<String> {
        self.values.remove(key).map(|v| strip_quotes(&v).to_string())
    }

    /// Remove and parse a value.
    pub fn take<T>(&mut self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.take_str(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid_value(self.field(key), format!("`{raw}`: {e}"))),
        }
    }

    /// Remove and parse a value, falling back to `default`.
    pub fn take_or<T>(&mut self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.take(key)?.unwrap_or(default))
    }

    /// Remove and parse a boolean (`true`/`false`, `1`/`0`, any case).
    pub fn take_bool_or(&mut self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.take_str(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ConfigError::invalid_value(self.field(key), format!("`{raw}` is not a boolean"))),
            },
        }
    }

    /// Remove and parse a list such as `[64,32,8]` or `['w1','swd']`.
    pub fn take_list<T>(&mut self, key: &str) -> Result<Option<Vec<T>>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.take_str(key) else {
            return Ok(None);
        };
        let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
        if inner.trim().is_empty() {
            return Ok(Some(Vec::new()));
        }
        inner
            .split(',')
            .map(|item| {
                let item = strip_quotes(item.trim());
                item.parse::<T>()
                    .map_err(|e| ConfigError::invalid_value(self.field(key), format!("`{item}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Drop every key that `other` has consumed.
    ///
    /// Used when several sub-metrics draw from copies of one option set: a
    /// key counts as used once any copy took it.
    pub fn retain_unconsumed(&mut self, other: &Options) {
        self.values.retain(|key, _| other.values.contains_key(key));
    }

    /// Whether no options remain.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fail if any option was not consumed.
    pub fn finish(self) -> Result<(), ConfigError> {
        if self.values.is_empty() {
            return Ok(());
        }
        Err(ConfigError::UnknownOption {
            metric: self.metric,
            options: self.values.keys().cloned().collect::<Vec<_>>().join(", "),
        })
    }

    fn field(&self, key: &str) -> String {
        format!("{}.{}", self.metric, key)
    }
}

fn strip_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '\'' || c == '"')
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Engine-wide defaults for every metric the registry builds.
///
/// Per-metric options in the configuration string override these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sinkhorn iteration cap. Default: **1000**.
    pub sinkhorn_max_iterations: usize,

    /// Sinkhorn stopping threshold on the marginal error. Default: **1e-9**.
    pub sinkhorn_threshold: f64,

    /// Pivot cap for the transportation simplex. Default: **1_000_000**.
    pub simplex_max_pivots: usize,

    /// Diagonal offset for the Fréchet regularisation retry. Default: **1e-6**.
    pub frechet_eps: f64,

    /// Largest tolerated imaginary part on the diagonal of the covariance
    /// square root. Default: **1e-3**.
    pub imaginary_tolerance: f64,

    /// Ground cost of `w1` and `discrete_dual` when no `base` option is
    /// given. Stored as `"L2"`, `"L1"` or `"Euclidean"`. Default: **L2**.
    pub base_metric: BaseMetric,

    /// Random projections for sliced Wasserstein. Default: **128**.
    pub num_projections: usize,

    /// Optimisation steps of the discrete dual solver. Default: **500**.
    pub dual_steps: usize,

    /// Adam learning rate of the discrete dual solver. Default: **0.001**.
    pub dual_lr: f64,

    /// Nearest-neighbour chunk size of the discrete dual solver. Default: **256**.
    pub dual_nnb: usize,

    /// Patch side length for patch metrics. Default: **5**.
    pub patch_size: usize,

    /// Patch stride for patch metrics. Default: **1**.
    pub patch_stride: usize,

    /// Seed for every metric's random source; `None` draws from entropy.
    /// Default: **None**.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sinkhorn_max_iterations: 1000,
            sinkhorn_threshold: 1e-9,
            simplex_max_pivots: 1_000_000,
            frechet_eps: 1e-6,
            imaginary_tolerance: 1e-3,
            base_metric: BaseMetric::L2,
            num_projections: 128,
            dual_steps: 500,
            dual_lr: 1e-3,
            dual_nnb: 256,
            patch_size: 5,
            patch_stride: 1,
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::invalid_value("(json)", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate an [`EngineConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: EngineConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this configuration as pretty-printed JSON, creating parent
    /// directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sinkhorn_max_iterations == 0 {
            return Err(ConfigError::invalid_value("sinkhorn_max_iterations", "must be > 0"));
        }
        if !(self.sinkhorn_threshold > 0.0) {
            return Err(ConfigError::invalid_value("sinkhorn_threshold", "must be > 0.0"));
        }
        if self.simplex_max_pivots == 0 {
            return Err(ConfigError::invalid_value("simplex_max_pivots", "must be > 0"));
        }
        if !(self.frechet_eps > 0.0) {
            return Err(ConfigError::invalid_value("frechet_eps", "must be > 0.0"));
        }
        if !(self.imaginary_tolerance >= 0.0) {
            return Err(ConfigError::invalid_value("imaginary_tolerance", "must be >= 0.0"));
        }
        if self.num_projections == 0 {
            return Err(ConfigError::invalid_value("num_projections", "must be > 0"));
        }
        if self.dual_steps == 0 {
            return Err(ConfigError::invalid_value("dual_steps", "must be > 0"));
        }
        if !(self.dual_lr > 0.0) {
            return Err(ConfigError::invalid_value("dual_lr", "must be > 0.0"));
        }
        if self.dual_nnb == 0 {
            return Err(ConfigError::invalid_value("dual_nnb", "must be > 0"));
        }
        if self.patch_size == 0 {
            return Err(ConfigError::invalid_value("patch_size", "must be > 0"));
        }
        if self.patch_stride == 0 {
            return Err(ConfigError::invalid_value("patch_stride", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_name_and_options() {
        let spec = MetricSpec::parse("MiniBatchPatchLoss-dist=w1-p=8-s=4").unwrap();
        assert_eq!(spec.name, "MiniBatchPatchLoss");
        assert_eq!(spec.options.len(), 3);
        assert_eq!(spec.options["dist"], "w1");
        assert_eq!(spec.options["p"], "8");
        assert_eq!(spec.options["s"], "4");
    }

    #[test]
    fn bare_name_has_no_options() {
        let spec = MetricSpec::parse("MiniBatchLoss").unwrap();
        assert_eq!(spec.name, "MiniBatchLoss");
        assert!(spec.options.is_empty());
    }

    #[test]
    fn duplicate_key_keeps_last_value() {
        let spec = MetricSpec::parse("MiniBatchLoss-dist=w1-dist=swd").unwrap();
        assert_eq!(spec.options["dist"], "swd");
    }

    #[test]
    fn missing_equals_is_rejected() {
        let err = MetricSpec::parse("MiniBatchLoss-dist").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedOption { .. }));
    }

    #[test]
    fn empty_name_and_empty_key_are_rejected() {
        assert!(matches!(MetricSpec::parse("-p=3"), Err(ConfigError::EmptyName { .. })));
        assert!(matches!(MetricSpec::parse("X-=3"), Err(ConfigError::MalformedOption { .. })));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let spec = MetricSpec::parse("MiniBatchLoss-dist=swd-num_proj=64").unwrap();
        let again = MetricSpec::parse(&spec.to_string()).unwrap();
        assert_eq!(spec, again);
    }

    #[test]
    fn typed_options_and_leftovers() {
        let spec = MetricSpec::parse("M-p=8-lr=0.01-flag=True-ps=[64, 32,8]-dists=['w1','swd']-typo=1").unwrap();
        let mut opts = spec.options();
        assert_eq!(opts.take_or::<usize>("p", 5).unwrap(), 8);
        assert_eq!(opts.take_or::<usize>("s", 1).unwrap(), 1);
        assert!((opts.take_or::<f64>("lr", 0.0).unwrap() - 0.01).abs() < 1e-15);
        assert!(opts.take_bool_or("flag", false).unwrap());
        assert_eq!(opts.take_list::<usize>("ps").unwrap(), Some(vec![64, 32, 8]));
        assert_eq!(
            opts.take_list::<String>("dists").unwrap(),
            Some(vec!["w1".to_string(), "swd".to_string()])
        );
        let err = opts.finish().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption { ref options, .. } if options == "typo"));
    }

    #[test]
    fn consumption_is_merged_across_copies() {
        let spec = MetricSpec::parse("M-epsilon=1-num_proj=8-typo=1").unwrap();
        let shared = spec.options();
        let mut unused = shared.clone();

        let mut first = shared.clone();
        first.take::<f64>("epsilon").unwrap();
        unused.retain_unconsumed(&first);
        let mut second = shared.clone();
        second.take::<usize>("num_proj").unwrap();
        unused.retain_unconsumed(&second);

        assert!(!unused.is_empty());
        let err = unused.finish().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption { ref options, .. } if options == "typo"));
    }

    #[test]
    fn unparseable_value_names_the_field() {
        let spec = MetricSpec::parse("M-p=eight").unwrap();
        let mut opts = spec.options();
        let err = opts.take::<usize>("p").unwrap_err();
        assert!(err.to_string().contains("M.p"));
    }

    #[test]
    fn default_engine_config_is_valid() {
        EngineConfig::default().validate().expect("default config should be valid");
    }

    #[test]
    fn engine_config_json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("engine.json");

        let mut original = EngineConfig::default();
        original.seed = Some(7);
        original.num_projections = 64;
        original.to_json(&path).expect("serialization should succeed");

        let loaded = EngineConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded, original);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"num_projections": 16}"#).unwrap();
        assert_eq!(cfg.num_projections, 16);
        assert_eq!(cfg.dual_steps, 500);
    }

    #[test]
    fn base_metric_is_stored_by_name() {
        let cfg = EngineConfig::from_json_str(r#"{"base_metric": "Euclidean"}"#).unwrap();
        assert_eq!(cfg.base_metric, BaseMetric::Euclidean);
        let json = serde_json::to_string(&EngineConfig::default()).unwrap();
        assert!(json.contains(r#""base_metric":"L2""#), "{json}");
        assert!(EngineConfig::from_json_str(r#"{"base_metric": "cosine"}"#).is_err());
    }

    #[test]
    fn invalid_engine_values_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.frechet_eps = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.patch_stride = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn malformed_json_file_is_a_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::from_json(&path), Err(ConfigError::ParseError { .. })));
    }
}
