//! Run configuration for an EM-VAMP fit.
//!
//! Every field has a default, so a configuration file only needs to name what it
//! changes:
//!
//! ```toml
//! max_iter = 200
//! tune_noise_variance = false
//! variances = [1e-4, 0.5, 2.0]
//! ```

use crate::message::VarianceBounds;
use crate::mixture::DEFAULT_NUM_COMPONENTS;
use crate::solver::VampError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Supplied mixture weights must sum to one within this tolerance.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Errors raised while reading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Configuration is invalid: {0}")]
    Invalid(#[from] VampError),
}

/// Settings for one EM-VAMP run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VampConfig {
    /// Number of message-passing rounds. The trajectory has exactly this many entries.
    pub max_iter: usize,
    /// Mixture size when no initial arrays are given. Defaults to 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_components: Option<usize>,
    /// Initial component weights; used verbatim when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    /// Initial component means; used verbatim when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub means: Option<Vec<f64>>,
    /// Initial component variances; used verbatim (subject to the floor) when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variances: Option<Vec<f64>>,
    /// Components whose mean is never re-estimated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_fixed: Option<Vec<bool>>,
    /// Components whose variance is never re-estimated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_fixed: Option<Vec<bool>>,
    /// EM-tune the noise variance.
    pub tune_noise_variance: bool,
    /// EM-tune the mixture prior.
    pub tune_mixture: bool,
    /// Minimum variance of any mixture component.
    pub variance_floor: f64,
    /// Clipping range for extrinsic message variances.
    pub message_variance: VarianceBounds,
}

impl Default for VampConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            num_components: None,
            weights: None,
            means: None,
            variances: None,
            mean_fixed: None,
            variance_fixed: None,
            tune_noise_variance: true,
            tune_mixture: true,
            variance_floor: 1e-6,
            message_variance: VarianceBounds::default(),
        }
    }
}

impl VampConfig {
    /// An adaptive-shrinkage style grid: `num_components` zero-mean components with
    /// variances `(4^(k/K) - 1)^2`, the null component pinned at `1e-4`, every mean
    /// and variance fixed. Only the weights are learned.
    pub fn ash_grid(num_components: usize) -> Self {
        let k = num_components.max(1);
        let mut variances: Vec<f64> = (0..k)
            .map(|j| (4f64.powf(j as f64 / k as f64) - 1.0).powi(2))
            .collect();
        variances[0] = 1e-4;
        Self {
            num_components: Some(k),
            means: Some(vec![0.0; k]),
            variances: Some(variances),
            mean_fixed: Some(vec![true; k]),
            variance_fixed: Some(vec![true; k]),
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Writes the configuration as pretty TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// The number of mixture components implied by the configuration.
    ///
    /// Supplied weight, mean and variance arrays must agree in length with each
    /// other and with `num_components` when that is set.
    pub fn resolved_num_components(&self) -> Result<usize, VampError> {
        let weights = self.weights.as_ref().map(Vec::len);
        let means = self.means.as_ref().map(Vec::len);
        let variances = self.variances.as_ref().map(Vec::len);

        let supplied: Vec<usize> = [weights, means, variances].into_iter().flatten().collect();
        if supplied.windows(2).any(|w| w[0] != w[1]) {
            return Err(VampError::MixtureLengthMismatch {
                weights,
                means,
                variances,
            });
        }

        let k = match (supplied.first(), self.num_components) {
            (Some(&len), Some(requested)) if len != requested => {
                return Err(VampError::InvalidConfig(format!(
                    "num_components is {requested} but the initial mixture arrays have length {len}"
                )));
            }
            (Some(&len), _) => len,
            (None, Some(requested)) => requested,
            (None, None) => DEFAULT_NUM_COMPONENTS,
        };
        if k == 0 {
            return Err(VampError::InvalidConfig(
                "the mixture needs at least one component".to_string(),
            ));
        }
        Ok(k)
    }

    /// Checks everything that can be checked without data.
    pub fn validate(&self) -> Result<(), VampError> {
        if self.max_iter == 0 {
            return Err(VampError::InvalidConfig(
                "max_iter must be at least 1".to_string(),
            ));
        }
        if !(self.variance_floor.is_finite() && self.variance_floor > 0.0) {
            return Err(VampError::InvalidConfig(format!(
                "variance_floor must be positive and finite, got {}",
                self.variance_floor
            )));
        }
        let bounds = &self.message_variance;
        if !(bounds.min > 0.0 && bounds.min < bounds.max && bounds.max.is_finite()) {
            return Err(VampError::InvalidConfig(format!(
                "message variance bounds must satisfy 0 < min < max < inf, got [{}, {}]",
                bounds.min, bounds.max
            )));
        }

        let k = self.resolved_num_components()?;

        if let Some(weights) = &self.weights {
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(VampError::InvalidConfig(
                    "mixture weights must be finite and non-negative".to_string(),
                ));
            }
            let total: f64 = weights.iter().sum();
            if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(VampError::InvalidConfig(format!(
                    "mixture weights must sum to 1, got {total}"
                )));
            }
        }
        if let Some(means) = &self.means {
            if means.iter().any(|m| !m.is_finite()) {
                return Err(VampError::InvalidConfig(
                    "mixture means must be finite".to_string(),
                ));
            }
        }
        if let Some(variances) = &self.variances {
            if variances.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(VampError::InvalidConfig(
                    "mixture variances must be finite and non-negative".to_string(),
                ));
            }
        }
        for (label, mask) in [
            ("mean_fixed", &self.mean_fixed),
            ("variance_fixed", &self.variance_fixed),
        ] {
            if let Some(mask) = mask {
                if mask.len() != k {
                    return Err(VampError::InvalidConfig(format!(
                        "{label} has {} entries but the mixture has {k} components",
                        mask.len()
                    )));
                }
            }
        }
        Ok(())
    }
}
