use crate::algorithms::path_loss::TaylorOrder;
use crate::core::{
    DEFAULT_CONVERGENCE_TOLERANCE, DEFAULT_MAX_EXPANSION_RATIO, DEFAULT_MAX_ITERATIONS,
    DEFAULT_MIN_NEAREST_FINGERPRINTS, DEFAULT_PATH_LOSS_EXPONENT, FALLBACK_RSSI_STANDARD_DEVIATION,
};
use crate::validation::data::{validate_nearest_bounds, validate_positive};
use crate::validation::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// What to do with an unknown source that too few readings reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnderdeterminedSourcePolicy {
    /// Leave the source out of the estimate and carry on with the rest
    Drop,
    /// Fail the whole estimate
    Fail,
}

impl Default for UnderdeterminedSourcePolicy {
    fn default() -> Self {
        UnderdeterminedSourcePolicy::Drop
    }
}

/// Which input uncertainties are propagated into the output covariance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropagationFlags {
    /// Query and fingerprint RSSI variances
    pub rssi_variance: bool,
    /// Path-loss exponent variance
    pub path_loss_exponent_variance: bool,
    /// Fingerprint position covariances
    pub fingerprint_position_covariance: bool,
    /// Known source position covariances
    pub source_position_covariance: bool,
}

impl PropagationFlags {
    pub fn all() -> Self {
        Self {
            rssi_variance: true,
            path_loss_exponent_variance: true,
            fingerprint_position_covariance: true,
            source_position_covariance: true,
        }
    }

    pub fn any(&self) -> bool {
        self.rssi_variance
            || self.path_loss_exponent_variance
            || self.fingerprint_position_covariance
            || self.source_position_covariance
    }
}

/// Estimator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Expansion order of the log-distance relation
    pub taylor_order: TaylorOrder,
    /// Also estimate the positions of unlocated sources
    pub solve_sources: bool,
    /// Minimum number of nearest fingerprints
    pub min_nearest_fingerprints: usize,
    /// Maximum number of nearest fingerprints, unbounded when `None`
    pub max_nearest_fingerprints: Option<usize>,
    /// Remove each fingerprint's mean RSSI when matching
    pub remove_mean_in_matcher: bool,
    /// Remove the per-fingerprint mean from the solver residuals
    pub remove_mean_from_readings: bool,
    /// Path-loss exponent used when a source does not provide one
    pub path_loss_exponent: f64,
    /// Standard deviation of the configured path-loss exponent
    pub path_loss_exponent_std: f64,
    /// Prefer each source's own path-loss exponent when it has one
    pub use_source_path_loss_exponent: bool,
    /// RSSI standard deviation (dB) for readings that carry none
    pub fallback_rssi_std: f64,
    /// Uncertainties propagated into the output covariance
    pub propagation: PropagationFlags,
    pub underdetermined_source_policy: UnderdeterminedSourcePolicy,
    /// Iteration cap of each Levenberg-Marquardt run
    pub max_iterations: usize,
    /// Relative step size under which the solver stops
    pub convergence_tolerance: f64,
    /// Largest `|p − p_i| / |p_i − s|` at which a fingerprint's expansion is used.
    /// Observations are down-weighted by their truncation error as they approach it.
    pub max_expansion_ratio: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            taylor_order: TaylorOrder::default(),
            solve_sources: false,
            min_nearest_fingerprints: DEFAULT_MIN_NEAREST_FINGERPRINTS,
            max_nearest_fingerprints: None,
            remove_mean_in_matcher: true,
            remove_mean_from_readings: false,
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            path_loss_exponent_std: 0.0,
            use_source_path_loss_exponent: true,
            fallback_rssi_std: FALLBACK_RSSI_STANDARD_DEVIATION,
            propagation: PropagationFlags::default(),
            underdetermined_source_policy: UnderdeterminedSourcePolicy::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            convergence_tolerance: DEFAULT_CONVERGENCE_TOLERANCE,
            max_expansion_ratio: DEFAULT_MAX_EXPANSION_RATIO,
        }
    }
}

impl EstimatorConfig {
    /// Check every parameter, returning the first violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_nearest_bounds(self.min_nearest_fingerprints, self.max_nearest_fingerprints)?;
        validate_positive("path_loss_exponent", self.path_loss_exponent)?;
        validate_positive("fallback_rssi_std", self.fallback_rssi_std)?;
        validate_positive("convergence_tolerance", self.convergence_tolerance)?;

        if !(self.path_loss_exponent_std.is_finite() && self.path_loss_exponent_std >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                parameter: "path_loss_exponent_std".to_string(),
                value: self.path_loss_exponent_std.to_string(),
                reason: "must be finite and non-negative".to_string(),
            });
        }

        if !(self.max_expansion_ratio > 0.0 && self.max_expansion_ratio <= 1.0) {
            return Err(ConfigError::InvalidParameter {
                parameter: "max_expansion_ratio".to_string(),
                value: self.max_expansion_ratio.to_string(),
                reason: "must lie in (0, 1]".to_string(),
            });
        }

        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidParameter {
                parameter: "max_iterations".to_string(),
                value: "0".to_string(),
                reason: "at least one iteration is required".to_string(),
            });
        }

        Ok(())
    }

    /// Load and validate a configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            message: format!("Failed to read config file '{}': {}", path_str, e),
        })?;

        let config: EstimatorConfig = serde_json::from_str(&content).map_err(|e| ConfigError::Serialization {
            message: format!("Failed to parse config file '{}': {}", path_str, e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate and write the configuration as pretty-printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.validate()?;
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialization {
            message: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(&path, content).map_err(|e| ConfigError::Io {
            message: format!("Failed to write config file '{}': {}", path_str, e),
        })
    }
}
