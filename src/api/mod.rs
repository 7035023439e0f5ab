//! Estimator controller and its public types
//!
//! [`FingerprintPositionEstimator`] wraps the matcher and the solver in a
//! readiness/locking state machine and notifies an [`EstimatorListener`]
//! around every estimate.

pub mod callback;
pub mod estimator;
pub mod types;

pub use callback::{CallbackListener, EstimatorCallback, EstimatorListener};
pub use estimator::FingerprintPositionEstimator;
pub use types::{EstimatorState, EstimatorType, PositionEstimate};
