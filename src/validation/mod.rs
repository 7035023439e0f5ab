//! Input validation and error types

pub mod data;
pub mod error;

pub use error::{ConfigError, CovarianceError, EstimationError, EstimatorError, EstimatorResult};
