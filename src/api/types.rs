//! Result and state types exposed by the estimator

use crate::algorithms::matcher::FingerprintMatch;
use crate::algorithms::path_loss::TaylorOrder;
use crate::algorithms::solver::{EstimatedSource, Solution};
use crate::core::{Covariance, LocatedFingerprint, Position};
use crate::validation::error::CovarianceError;
use serde::{Deserialize, Serialize};

/// Lifecycle of an estimator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorState {
    /// Some required input is missing
    Unready,
    /// All inputs present, `estimate()` may be called
    Ready,
    /// An estimate is in flight; mutations are rejected
    Estimating,
}

/// Solver variant, determined by the Taylor order in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorType {
    FirstOrder,
    SecondOrder,
    ThirdOrder,
}

impl From<TaylorOrder> for EstimatorType {
    fn from(order: TaylorOrder) -> Self {
        match order {
            TaylorOrder::First => EstimatorType::FirstOrder,
            TaylorOrder::Second => EstimatorType::SecondOrder,
            TaylorOrder::Third => EstimatorType::ThirdOrder,
        }
    }
}

impl EstimatorType {
    pub fn taylor_order(&self) -> TaylorOrder {
        match self {
            EstimatorType::FirstOrder => TaylorOrder::First,
            EstimatorType::SecondOrder => TaylorOrder::Second,
            EstimatorType::ThirdOrder => TaylorOrder::Third,
        }
    }
}

/// Published result of one estimate
///
/// Each call to `estimate()` produces a fresh value that replaces the
/// previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEstimate<const D: usize> {
    position: Position<D>,
    covariance: Option<Covariance<D>>,
    covariance_error: Option<CovarianceError>,
    chi_sq: f64,
    iterations: usize,
    observations: usize,
    matches: Vec<FingerprintMatch>,
    matched_fingerprints: Vec<LocatedFingerprint<D>>,
    estimated_sources: Vec<EstimatedSource<D>>,
    dropped_sources: Vec<String>,
}

impl<const D: usize> PositionEstimate<D> {
    pub(crate) fn new(
        solution: Solution<D>,
        matches: Vec<FingerprintMatch>,
        fingerprints: &[LocatedFingerprint<D>],
    ) -> Self {
        let matched_fingerprints = matches.iter().map(|m| fingerprints[m.index].clone()).collect();
        Self {
            position: solution.position,
            covariance: solution.covariance,
            covariance_error: solution.covariance_error,
            chi_sq: solution.chi_sq,
            iterations: solution.iterations,
            observations: solution.observations,
            matches,
            matched_fingerprints,
            estimated_sources: solution.estimated_sources,
            dropped_sources: solution.dropped_sources,
        }
    }

    pub fn position(&self) -> &Position<D> {
        &self.position
    }

    /// Position covariance, when propagation was requested and succeeded
    pub fn covariance(&self) -> Option<&Covariance<D>> {
        self.covariance.as_ref()
    }

    /// Why the covariance is missing although propagation was requested
    pub fn covariance_error(&self) -> Option<&CovarianceError> {
        self.covariance_error.as_ref()
    }

    /// Weighted residual sum of squares
    pub fn chi_sq(&self) -> f64 {
        self.chi_sq
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Number of residuals that took part in the solve
    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Matcher output, closest first
    pub fn matches(&self) -> &[FingerprintMatch] {
        &self.matches
    }

    /// Working set of calibration fingerprints, closest first
    pub fn matched_fingerprints(&self) -> &[LocatedFingerprint<D>] {
        &self.matched_fingerprints
    }

    /// Unlocated sources resolved in joint mode
    pub fn estimated_sources(&self) -> &[EstimatedSource<D>] {
        &self.estimated_sources
    }

    /// Unlocated sources left out for lack of readings
    pub fn dropped_sources(&self) -> &[String] {
        &self.dropped_sources
    }
}
