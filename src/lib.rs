//! RSSI Fingerprint Positioning
//!
//! Estimates the position of a device from received signal strengths by
//! matching them against a calibration set of located fingerprints and
//! refining the match with a Taylor-order non-linear least-squares solver.
//! Unlocated radio sources can be estimated jointly, and input uncertainty
//! can be propagated into the output covariance.

pub mod core;
pub mod algorithms;
pub mod validation;
pub mod utils;
pub mod api;

// Re-export commonly used types
pub use core::{
    Covariance, Fingerprint, LocatedFingerprint, Position, Position2, Position3, RadioSource, Reading,
    SourceLocation,
};
pub use algorithms::{
    EstimatedSource, FingerprintMatch, NearestFingerprintMatcher, PathLossModel, PositionSolver, TaylorOrder,
};
pub use utils::{EstimatorConfig, PropagationFlags, UnderdeterminedSourcePolicy};
pub use validation::{ConfigError, CovarianceError, EstimationError, EstimatorError, EstimatorResult};
pub use api::{
    CallbackListener, EstimatorListener, EstimatorState, EstimatorType, FingerprintPositionEstimator,
    PositionEstimate,
};
