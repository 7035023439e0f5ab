//! Physical constants and estimator defaults

/// Speed of light in vacuum (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Path-loss exponent of free-space propagation
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// RSSI standard deviation (dB) assumed for readings that carry none
pub const FALLBACK_RSSI_STANDARD_DEVIATION: f64 = 1.0;

/// Minimum number of nearest fingerprints used by default
pub const DEFAULT_MIN_NEAREST_FINGERPRINTS: usize = 1;

/// Iteration cap of the non-linear solver
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Relative step size under which the solver is considered converged
pub const DEFAULT_CONVERGENCE_TOLERANCE: f64 = 1e-10;

/// Largest ratio |p − p_i| / |p_i − s| at which an expanded observation is trusted
pub const DEFAULT_MAX_EXPANSION_RATIO: f64 = 0.5;
