//! Name → factory registry for metrics.
//!
//! A registry is an explicit value: build one with
//! [`MetricRegistry::with_defaults`], add your own factories with
//! [`MetricRegistry::register`], then turn configuration strings into
//! metrics with [`MetricRegistry::configure`].
//!
//! ```rust
//! use ruvector_otgan::registry::MetricRegistry;
//!
//! let registry = MetricRegistry::with_defaults();
//! let metric = registry.configure("MiniBatchPatchLoss-dist=swd-p=8-s=4").unwrap();
//! assert_eq!(metric.name(), "MiniBatchPatchLoss");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::config::{EngineConfig, MetricSpec, Options};
use crate::error::{ConfigError, OtResult};
use crate::metric::{Metric, MiniBatchLocalPatchLoss, MiniBatchLoss, MiniBatchMSPatchLoss, MiniBatchPatchLoss};

/// Builds a metric from its options and the engine defaults.
pub type MetricFactory =
    Box<dyn Fn(&mut Options, &EngineConfig) -> Result<Box<dyn Metric>, ConfigError> + Send + Sync>;

/// Registered metric factories plus the defaults they are built with.
pub struct MetricRegistry {
    config: EngineConfig,
    factories: BTreeMap<String, MetricFactory>,
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("config", &self.config)
            .field("names", &self.names())
            .finish()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MetricRegistry {
    /// An empty registry with default engine settings.
    pub fn new() -> Self {
        Self { config: EngineConfig::default(), factories: BTreeMap::new() }
    }

    /// The built-in metrics with default engine settings.
    pub fn with_defaults() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// The built-in metrics with `config` as defaults.
    pub fn with_config(config: EngineConfig) -> Self {
        let mut registry = Self { config, factories: BTreeMap::new() };
        registry.insert_builtin(MiniBatchLoss::NAME, |o, c| Ok(Box::new(MiniBatchLoss::from_options(o, c)?)));
        registry.insert_builtin(MiniBatchPatchLoss::NAME, |o, c| {
            Ok(Box::new(MiniBatchPatchLoss::from_options(o, c)?))
        });
        registry.insert_builtin(MiniBatchLocalPatchLoss::NAME, |o, c| {
            Ok(Box::new(MiniBatchLocalPatchLoss::from_options(o, c)?))
        });
        registry.insert_builtin(MiniBatchMSPatchLoss::NAME, |o, c| {
            Ok(Box::new(MiniBatchMSPatchLoss::from_options(o, c)?))
        });

        #[cfg(feature = "tch-backend")]
        {
            use crate::graph::{AdversarialFeatureMatchingLoss, WGANLoss};
            registry.insert_builtin(WGANLoss::NAME, |o, _| Ok(Box::new(WGANLoss::from_options(o)?)));
            registry.insert_builtin(AdversarialFeatureMatchingLoss::NAME, |_, _| {
                Ok(Box::new(AdversarialFeatureMatchingLoss::new()))
            });
        }

        registry
    }

    fn insert_builtin<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&mut Options, &EngineConfig) -> Result<Box<dyn Metric>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Engine defaults handed to every factory.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register `factory` under `name`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Registration`] when the name is empty, contains `-`
    /// or is already taken.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), ConfigError>
    where
        F: Fn(&mut Options, &EngineConfig) -> Result<Box<dyn Metric>, ConfigError> + Send + Sync + 'static,
    {
        let reason = if name.trim().is_empty() {
            Some("name is empty")
        } else if name.contains('-') {
            Some("name may not contain `-`")
        } else if self.factories.contains_key(name) {
            Some("name is already registered")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigError::Registration { name: name.to_string(), reason: reason.to_string() });
        }
        self.insert_builtin(name, factory);
        Ok(())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the metric described by a configuration string.
    ///
    /// # Errors
    ///
    /// Parse errors, [`ConfigError::UnknownMetric`] for an unregistered
    /// name, factory errors, and [`ConfigError::UnknownOption`] for options
    /// the factory did not use.
    pub fn configure(&self, spec: &str) -> OtResult<Box<dyn Metric>> {
        let spec = MetricSpec::parse(spec)?;
        self.configure_spec(&spec)
    }

    /// Build a metric from an already parsed spec.
    pub fn configure_spec(&self, spec: &MetricSpec) -> OtResult<Box<dyn Metric>> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| ConfigError::UnknownMetric {
            name: spec.name.clone(),
            known: self.names().join(", "),
        })?;
        let mut options = spec.options();
        let metric = factory(&mut options, &self.config)?;
        options.finish()?;
        debug!(metric = %spec, "configured metric");
        Ok(metric)
    }
}

/// Build a metric with the built-in registry and default settings.
pub fn configure(spec: &str) -> OtResult<Box<dyn Metric>> {
    MetricRegistry::with_defaults().configure(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OtError;
    use crate::Diagnostics;
    use ndarray::ArrayViewD;

    struct Constant(f64);

    impl Metric for Constant {
        fn name(&self) -> &str {
            "Constant"
        }

        fn compute(&mut self, _: ArrayViewD<'_, f64>, _: ArrayViewD<'_, f64>) -> OtResult<(f64, Diagnostics)> {
            Ok((self.0, Diagnostics::new()))
        }

        #[cfg(feature = "tch-backend")]
        fn train_g(
            &mut self,
            _: &dyn crate::graph::Critic,
            _: &tch::Tensor,
            fake: &tch::Tensor,
        ) -> OtResult<(tch::Tensor, Diagnostics)> {
            Ok((fake.sum(tch::Kind::Double) * 0.0 + self.0, Diagnostics::new()))
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = MetricRegistry::with_defaults();
        for name in ["MiniBatchLoss", "MiniBatchPatchLoss", "MiniBatchLocalPatchLoss", "MiniBatchMSPatchLoss"] {
            assert!(registry.contains(name), "{name}");
        }
    }

    #[test]
    fn unknown_metric_lists_known_names() {
        let err = configure("NoSuchLoss-dist=w1").unwrap_err();
        match err {
            OtError::Config(ConfigError::UnknownMetric { name, known }) => {
                assert_eq!(name, "NoSuchLoss");
                assert!(known.contains("MiniBatchLoss"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn leftover_options_are_rejected() {
        let err = configure("MiniBatchLoss-dist=w1-p=8").unwrap_err();
        assert!(matches!(err, OtError::Config(ConfigError::UnknownOption { .. })));
    }

    #[test]
    fn custom_factories_can_be_registered_once() {
        let mut registry = MetricRegistry::new();
        registry
            .register("Constant", |o, _| Ok(Box::new(Constant(o.take_or("value", 1.0)?))))
            .unwrap();
        let mut metric = registry.configure("Constant-value=2.5").unwrap();
        let x = ndarray::Array1::<f64>::zeros(2).into_dyn();
        assert_eq!(metric.evaluate(x.view(), x.view()).unwrap(), 2.5);

        assert!(matches!(
            registry.register("Constant", |_, _| Ok(Box::new(Constant(0.0)))),
            Err(ConfigError::Registration { .. })
        ));
        assert!(registry.register("Bad-Name", |_, _| Ok(Box::new(Constant(0.0)))).is_err());
        assert!(registry.register("", |_, _| Ok(Box::new(Constant(0.0)))).is_err());
    }

    #[test]
    fn engine_config_supplies_defaults() {
        let config = EngineConfig { patch_size: 2, patch_stride: 2, seed: Some(7), ..EngineConfig::default() };
        let registry = MetricRegistry::with_config(config);
        let mut metric = registry.configure("MiniBatchPatchLoss").unwrap();
        let x = ndarray::Array4::<f64>::zeros((1, 1, 4, 4)).into_dyn();
        let (v, _) = metric.compute(x.view(), x.view()).unwrap();
        assert_eq!(v, 0.0);
    }
}
