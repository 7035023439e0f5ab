//! Error taxonomy of the fingerprint position estimator

use thiserror::Error;

/// Result type for estimator operations
pub type EstimatorResult<T> = Result<T, EstimatorError>;

/// Missing or invalid input, detected synchronously
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Parameter outside its valid range
    #[error("Invalid parameter {parameter}={value}: {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Required input not provided
    #[error("Missing required input: {input}")]
    MissingInput { input: String },

    /// A fingerprint holds two readings of the same source
    #[error("Fingerprint contains more than one reading for source {source_id}")]
    DuplicateReading { source_id: String },

    /// Located fingerprint without readings
    #[error("Located fingerprint must contain at least one reading")]
    EmptyFingerprint,

    /// Estimator inputs are incomplete
    #[error("Estimator is not ready: {reason}")]
    NotReady { reason: String },

    /// Configuration file could not be read or written
    #[error("Configuration I/O error: {message}")]
    Io { message: String },

    /// Configuration file could not be parsed or produced
    #[error("Configuration serialization error: {message}")]
    Serialization { message: String },
}

/// Failure of an estimate that was correctly configured
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    /// Too few calibration fingerprints share a source with the query
    #[error("Insufficient matching fingerprints: {available} available, {required} required")]
    InsufficientMatches { available: usize, required: usize },

    /// No (fingerprint, source) pair could contribute a residual
    #[error("No usable observations between matched fingerprints and query")]
    NoObservations,

    /// Iteration cap reached before convergence
    #[error("Solver did not converge after {iterations} iterations (cost {cost:.6e})")]
    NotConverged { iterations: usize, cost: f64 },

    /// Normal equations could not be solved
    #[error("Singular system while solving {context}")]
    SingularSystem { context: String },

    /// Unknown source referenced by too few readings
    #[error("Source {source_id} is under-determined: {readings} readings, at least {required} required")]
    UnderdeterminedSource {
        source_id: String,
        readings: usize,
        required: usize,
    },
}

/// Failure of the output covariance; the point estimate stays usable
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CovarianceError {
    /// Information matrix is rank deficient
    #[error("Information matrix is singular (condition estimate {condition:.3e})")]
    Singular { condition: f64 },

    /// Propagated covariance has a negative eigenvalue
    #[error("Propagated covariance is not positive semi-definite (min eigenvalue {min_eigenvalue:.3e})")]
    NotPositiveSemidefinite { min_eigenvalue: f64 },
}

/// Errors returned by the estimator controller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Mutation or re-entrant estimate while an estimate is in flight
    #[error("Estimator is locked while an estimation is in progress")]
    Locked,

    #[error(transparent)]
    Estimation(#[from] EstimationError),
}

impl EstimatorError {
    pub fn is_locked(&self) -> bool {
        matches!(self, EstimatorError::Locked)
    }

    pub fn is_config(&self) -> bool {
        matches!(self, EstimatorError::Config(_))
    }

    pub fn is_estimation(&self) -> bool {
        matches!(self, EstimatorError::Estimation(_))
    }
}
