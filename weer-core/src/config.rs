//! Resampling configuration.
//!
//! Every field has a default, so a configuration file only needs to list
//! what it changes:
//!
//! ```rust
//! use weer_core::config::{ResamplerConfig, ReweightScope};
//!
//! let config = ResamplerConfig::from_toml_str(
//!     r#"
//!     do_thresholds = true
//!     largest_allowed_weight = 0.1
//!
//!     [reweight]
//!     scope = "global"
//!     "#,
//! )
//! .unwrap();
//!
//! assert!(config.do_thresholds);
//! assert_eq!(config.reweight.scope, ReweightScope::Global);
//! assert_eq!(config.reweight.bin_count, 100);
//! ```

use crate::errors::{WeError, WeResult};
use crate::reweight::optimizer::ProjectedGradient;
use crate::reweight::{DEFAULT_BIN_COUNT, DEFAULT_EPSILON};
use crate::subgroup::{IdentityGrouping, SubgroupFunction};
use serde::{Deserialize, Serialize};

/// Where the reweighting step runs relative to the bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReweightScope {
    /// Weights are not corrected
    Disabled,
    /// Each bin is reweighted on its own walkers, preserving the bin's total weight
    PerBin,
    /// All walkers are reweighted together once, before any bin is resampled
    Global,
}

/// What to do when the optimiser does not converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the weights the walkers had before reweighting and continue
    RetainWeights,
    /// Abort the iteration's resampling with the optimisation error
    Abort,
}

/// Settings of the reweighting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReweightSettings {
    pub scope: ReweightScope,
    /// Number of histogram bins for the divergence estimate
    pub bin_count: usize,
    /// Floor added to every histogram bin
    pub epsilon: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub on_failure: FailurePolicy,
}

impl Default for ReweightSettings {
    fn default() -> Self {
        let optimizer = ProjectedGradient::default();
        Self {
            scope: ReweightScope::PerBin,
            bin_count: DEFAULT_BIN_COUNT,
            epsilon: DEFAULT_EPSILON,
            max_iterations: optimizer.max_iterations,
            tolerance: optimizer.tolerance,
            on_failure: FailurePolicy::RetainWeights,
        }
    }
}

impl ReweightSettings {
    pub fn disabled() -> Self {
        Self {
            scope: ReweightScope::Disabled,
            ..Self::default()
        }
    }

    pub fn optimizer(&self) -> ProjectedGradient {
        ProjectedGradient::new(self.max_iterations, self.tolerance)
    }
}

/// Configuration of the population controller.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResamplerConfig {
    /// Adjust walker counts after split/merge when a bin has fewer subgroups than its target.
    ///
    /// When unset the bin keeps whatever count split/merge produced, unless
    /// `do_thresholds` is set: threshold enforcement always restores the target count.
    pub do_adjust_counts: bool,
    /// Split/merge walkers outside the weight bounds after the count has been fixed
    pub do_thresholds: bool,
    pub largest_allowed_weight: f64,
    pub smallest_allowed_weight: f64,
    /// Walkers heavier than `weight_split_threshold * ideal_weight` are split
    pub weight_split_threshold: f64,
    /// The lightest walkers whose cumulative weight is at most
    /// `weight_merge_cutoff * ideal_weight` are merged
    pub weight_merge_cutoff: f64,
    /// Seed for merge representative selection; random when unset
    pub seed: Option<u64>,
    /// Resample bins on the rayon thread pool
    pub parallel: bool,
    /// Tolerance per walker for the ensemble mass checks
    pub mass_tolerance: f64,
    pub subgroup: Box<dyn SubgroupFunction>,
    pub reweight: ReweightSettings,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            do_adjust_counts: true,
            do_thresholds: false,
            largest_allowed_weight: 1.0,
            smallest_allowed_weight: 1e-310,
            weight_split_threshold: 2.0,
            weight_merge_cutoff: 1.0,
            seed: None,
            parallel: false,
            mass_tolerance: 1e-12,
            subgroup: Box::new(IdentityGrouping {}),
            reweight: ReweightSettings::default(),
        }
    }
}

impl ResamplerConfig {
    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(s: &str) -> WeResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| WeError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> WeResult<String> {
        toml::to_string(self)
            .map_err(|e| WeError::Configuration(format!("Cannot serialise configuration: {}", e)))
    }

    /// Check that the settings describe a solvable resampling problem.
    pub fn validate(&self) -> WeResult<()> {
        if !(self.smallest_allowed_weight >= 0.0) || !self.largest_allowed_weight.is_finite() {
            return Err(WeError::Configuration(format!(
                "Weight bounds must be finite and non-negative, got [{}, {}]",
                self.smallest_allowed_weight, self.largest_allowed_weight
            )));
        }
        if self.smallest_allowed_weight > self.largest_allowed_weight {
            return Err(WeError::Configuration(format!(
                "smallest_allowed_weight ({}) is greater than largest_allowed_weight ({})",
                self.smallest_allowed_weight, self.largest_allowed_weight
            )));
        }
        if self.largest_allowed_weight <= 0.0 {
            return Err(WeError::Configuration(
                "largest_allowed_weight must be positive".to_string(),
            ));
        }
        if !(self.weight_split_threshold > 0.0) || !(self.weight_merge_cutoff > 0.0) {
            return Err(WeError::Configuration(format!(
                "weight_split_threshold ({}) and weight_merge_cutoff ({}) must be positive",
                self.weight_split_threshold, self.weight_merge_cutoff
            )));
        }
        if !(self.mass_tolerance >= 0.0) {
            return Err(WeError::Configuration(format!(
                "mass_tolerance must be non-negative, got {}",
                self.mass_tolerance
            )));
        }

        let reweight = &self.reweight;
        if reweight.scope != ReweightScope::Disabled {
            if reweight.bin_count == 0 {
                return Err(WeError::Configuration(
                    "reweight.bin_count must be at least 1".to_string(),
                ));
            }
            if !(reweight.epsilon > 0.0) || !(reweight.tolerance > 0.0) {
                return Err(WeError::Configuration(format!(
                    "reweight.epsilon ({}) and reweight.tolerance ({}) must be positive",
                    reweight.epsilon, reweight.tolerance
                )));
            }
        }
        Ok(())
    }
}
