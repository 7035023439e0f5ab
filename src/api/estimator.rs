//! Fingerprint position estimator controller
//!
//! Holds the estimator inputs, enforces the Unready/Ready/Estimating state
//! machine and notifies the listener around each estimate.

use crate::algorithms::matcher::NearestFingerprintMatcher;
use crate::algorithms::path_loss::TaylorOrder;
use crate::algorithms::solver::{PositionSolver, SolverInput};
use crate::api::callback::EstimatorListener;
use crate::api::types::{EstimatorState, EstimatorType, PositionEstimate};
use crate::core::{Fingerprint, LocatedFingerprint, Position, RadioSource};
use crate::utils::config::{EstimatorConfig, PropagationFlags, UnderdeterminedSourcePolicy};
use crate::validation::data::{readiness_issue, validate_located_fingerprints, validate_query, validate_sources};
use crate::validation::error::{ConfigError, EstimationError, EstimatorError, EstimatorResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Everything an estimate reads, snapshotted when it starts
#[derive(Clone)]
struct EstimatorInputs<const D: usize> {
    config: EstimatorConfig,
    located_fingerprints: Arc<Vec<LocatedFingerprint<D>>>,
    query: Option<Fingerprint<D>>,
    sources: Vec<Arc<RadioSource<D>>>,
    initial_position: Option<Position<D>>,
    initial_source_positions: HashMap<String, Position<D>>,
    listener: Option<Arc<dyn EstimatorListener<D>>>,
}

impl<const D: usize> EstimatorInputs<D> {
    fn readiness_issue(&self) -> Option<String> {
        readiness_issue(&self.located_fingerprints, self.query.as_ref(), &self.sources)
    }
}

/// Clears the lock flag when dropped
struct EstimatingGuard<'a>(&'a AtomicBool);

impl Drop for EstimatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Estimates a device position from a query fingerprint and a calibration set
///
/// All setters take `&self` so that listeners can hold a reference to the
/// estimator; while an estimate is in flight every setter and `estimate()`
/// itself fail with [`EstimatorError::Locked`] without mutating anything.
pub struct FingerprintPositionEstimator<const D: usize> {
    inputs: Mutex<EstimatorInputs<D>>,
    locked: AtomicBool,
    last_estimate: Mutex<Option<PositionEstimate<D>>>,
}

impl<const D: usize> Default for FingerprintPositionEstimator<D> {
    fn default() -> Self {
        Self::with_config(EstimatorConfig::default())
    }
}

impl<const D: usize> FingerprintPositionEstimator<D> {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_config(config: EstimatorConfig) -> Self {
        Self {
            inputs: Mutex::new(EstimatorInputs {
                config,
                located_fingerprints: Arc::new(Vec::new()),
                query: None,
                sources: Vec::new(),
                initial_position: None,
                initial_source_positions: HashMap::new(),
                listener: None,
            }),
            locked: AtomicBool::new(false),
            last_estimate: Mutex::new(None),
        }
    }

    /// Estimator with a validated configuration
    pub fn from_config(config: EstimatorConfig) -> EstimatorResult<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    /// Estimator with all inputs supplied up front
    pub fn with_inputs(
        located_fingerprints: Vec<LocatedFingerprint<D>>,
        query: Fingerprint<D>,
        sources: Vec<Arc<RadioSource<D>>>,
        config: EstimatorConfig,
    ) -> EstimatorResult<Self> {
        let estimator = Self::from_config(config)?;
        estimator.set_located_fingerprints(located_fingerprints)?;
        estimator.set_query(query)?;
        estimator.set_sources(sources)?;
        Ok(estimator)
    }

    fn lock_inputs(&self) -> MutexGuard<'_, EstimatorInputs<D>> {
        self.inputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_last_estimate(&self) -> MutexGuard<'_, Option<PositionEstimate<D>>> {
        self.last_estimate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a mutation unless an estimate is in flight
    fn update<F>(&self, mutate: F) -> EstimatorResult<()>
    where
        F: FnOnce(&mut EstimatorInputs<D>) -> Result<(), ConfigError>,
    {
        let mut inputs = self.lock_inputs();
        if self.locked.load(Ordering::SeqCst) {
            return Err(EstimatorError::Locked);
        }
        mutate(&mut inputs)?;
        Ok(())
    }

    /// Apply a configuration change, keeping the old one if it fails validation
    fn update_config<F>(&self, change: F) -> EstimatorResult<()>
    where
        F: FnOnce(&mut EstimatorConfig),
    {
        self.update(|inputs| {
            let mut config = inputs.config.clone();
            change(&mut config);
            config.validate()?;
            inputs.config = config;
            Ok(())
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.lock_inputs().readiness_issue().is_none()
    }

    pub fn state(&self) -> EstimatorState {
        if self.is_locked() {
            EstimatorState::Estimating
        } else if self.is_ready() {
            EstimatorState::Ready
        } else {
            EstimatorState::Unready
        }
    }

    pub fn estimator_type(&self) -> EstimatorType {
        EstimatorType::from(self.lock_inputs().config.taylor_order)
    }

    /// Whether unlocated sources are estimated along with the position
    pub fn solves_sources(&self) -> bool {
        self.lock_inputs().config.solve_sources
    }

    pub fn config(&self) -> EstimatorConfig {
        self.lock_inputs().config.clone()
    }

    pub fn set_config(&self, config: EstimatorConfig) -> EstimatorResult<()> {
        self.update_config(|current| *current = config)
    }

    pub fn set_taylor_order(&self, order: TaylorOrder) -> EstimatorResult<()> {
        self.update_config(|config| config.taylor_order = order)
    }

    pub fn set_solve_sources(&self, solve_sources: bool) -> EstimatorResult<()> {
        self.update_config(|config| config.solve_sources = solve_sources)
    }

    /// Bounds on the number of nearest fingerprints; `max` of `None` keeps all
    pub fn set_nearest_fingerprints(&self, min: usize, max: Option<usize>) -> EstimatorResult<()> {
        self.update_config(|config| {
            config.min_nearest_fingerprints = min;
            config.max_nearest_fingerprints = max;
        })
    }

    pub fn set_remove_mean_in_matcher(&self, remove: bool) -> EstimatorResult<()> {
        self.update_config(|config| config.remove_mean_in_matcher = remove)
    }

    pub fn set_remove_mean_from_readings(&self, remove: bool) -> EstimatorResult<()> {
        self.update_config(|config| config.remove_mean_from_readings = remove)
    }

    pub fn set_path_loss_exponent(&self, exponent: f64) -> EstimatorResult<()> {
        self.update_config(|config| config.path_loss_exponent = exponent)
    }

    pub fn set_use_source_path_loss_exponent(&self, use_source: bool) -> EstimatorResult<()> {
        self.update_config(|config| config.use_source_path_loss_exponent = use_source)
    }

    pub fn set_fallback_rssi_std(&self, std_dev: f64) -> EstimatorResult<()> {
        self.update_config(|config| config.fallback_rssi_std = std_dev)
    }

    pub fn set_propagation(&self, flags: PropagationFlags) -> EstimatorResult<()> {
        self.update_config(|config| config.propagation = flags)
    }

    pub fn set_underdetermined_source_policy(&self, policy: UnderdeterminedSourcePolicy) -> EstimatorResult<()> {
        self.update_config(|config| config.underdetermined_source_policy = policy)
    }

    pub fn located_fingerprints(&self) -> Arc<Vec<LocatedFingerprint<D>>> {
        self.lock_inputs().located_fingerprints.clone()
    }

    pub fn set_located_fingerprints(&self, fingerprints: Vec<LocatedFingerprint<D>>) -> EstimatorResult<()> {
        self.update(|inputs| {
            validate_located_fingerprints(&fingerprints)?;
            inputs.located_fingerprints = Arc::new(fingerprints);
            Ok(())
        })
    }

    pub fn query(&self) -> Option<Fingerprint<D>> {
        self.lock_inputs().query.clone()
    }

    pub fn set_query(&self, query: Fingerprint<D>) -> EstimatorResult<()> {
        self.update(|inputs| {
            validate_query(&query)?;
            inputs.query = Some(query);
            Ok(())
        })
    }

    pub fn sources(&self) -> Vec<Arc<RadioSource<D>>> {
        self.lock_inputs().sources.clone()
    }

    pub fn set_sources(&self, sources: Vec<Arc<RadioSource<D>>>) -> EstimatorResult<()> {
        self.update(|inputs| {
            validate_sources(&sources)?;
            inputs.sources = sources;
            Ok(())
        })
    }

    pub fn initial_position(&self) -> Option<Position<D>> {
        self.lock_inputs().initial_position
    }

    /// Only start point of the solver; the matched centroid and the closest matches are tried when `None`
    pub fn set_initial_position(&self, position: Option<Position<D>>) -> EstimatorResult<()> {
        self.update(|inputs| {
            if let Some(p) = &position {
                if !p.is_finite() {
                    return Err(ConfigError::InvalidParameter {
                        parameter: "initial_position".to_string(),
                        value: format!("{:?}", p.coords.as_slice()),
                        reason: "must be finite".to_string(),
                    });
                }
            }
            inputs.initial_position = position;
            Ok(())
        })
    }

    pub fn initial_source_positions(&self) -> HashMap<String, Position<D>> {
        self.lock_inputs().initial_source_positions.clone()
    }

    /// Seeds for unlocated sources in joint mode, keyed by source id
    pub fn set_initial_source_positions(&self, positions: HashMap<String, Position<D>>) -> EstimatorResult<()> {
        self.update(|inputs| {
            if let Some((id, p)) = positions.iter().find(|(_, p)| !p.is_finite()) {
                return Err(ConfigError::InvalidParameter {
                    parameter: "initial_source_positions".to_string(),
                    value: format!("{}: {:?}", id, p.coords.as_slice()),
                    reason: "must be finite".to_string(),
                });
            }
            inputs.initial_source_positions = positions;
            Ok(())
        })
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn EstimatorListener<D>>>) -> EstimatorResult<()> {
        self.update(|inputs| {
            inputs.listener = listener;
            Ok(())
        })
    }

    /// Result of the last successful estimate
    pub fn last_estimate(&self) -> Option<PositionEstimate<D>> {
        self.lock_last_estimate().clone()
    }

    pub fn estimated_position(&self) -> Option<Position<D>> {
        self.lock_last_estimate().as_ref().map(|e| *e.position())
    }

    /// Run the matcher and the solver on the current inputs
    ///
    /// On failure the previous result stays readable through
    /// [`last_estimate`](Self::last_estimate).
    pub fn estimate(&self) -> EstimatorResult<PositionEstimate<D>> {
        let inputs = {
            let inputs = self.lock_inputs();
            if self.locked.load(Ordering::SeqCst) {
                return Err(EstimatorError::Locked);
            }
            if let Some(reason) = inputs.readiness_issue() {
                return Err(ConfigError::NotReady { reason }.into());
            }
            self.locked.store(true, Ordering::SeqCst);
            inputs.clone()
        };
        let guard = EstimatingGuard(&self.locked);

        if let Some(listener) = &inputs.listener {
            listener.on_estimate_start(self);
        }

        let outcome = Self::compute(&inputs);
        match &outcome {
            Ok(estimate) => {
                info!(
                    position = ?estimate.position().coords.as_slice(),
                    chi_sq = estimate.chi_sq(),
                    iterations = estimate.iterations(),
                    matches = estimate.matches().len(),
                    has_covariance = estimate.covariance().is_some(),
                    "Position estimate published"
                );
                *self.lock_last_estimate() = Some(estimate.clone());
            }
            Err(e) => warn!(error = %e, "Position estimate failed"),
        }

        if let Some(listener) = &inputs.listener {
            listener.on_estimate_end(self);
        }
        drop(guard);

        outcome.map_err(EstimatorError::from)
    }

    fn compute(inputs: &EstimatorInputs<D>) -> Result<PositionEstimate<D>, EstimationError> {
        let config = &inputs.config;
        let query = inputs.query.as_ref().ok_or(EstimationError::NoObservations)?;
        let fingerprints = inputs.located_fingerprints.as_slice();

        let matcher = NearestFingerprintMatcher {
            min_matches: config.min_nearest_fingerprints,
            max_matches: config.max_nearest_fingerprints,
            remove_mean: config.remove_mean_in_matcher,
        };
        let matches = matcher.find_nearest(fingerprints, query)?;

        let solution = PositionSolver::new(config).solve(&SolverInput {
            fingerprints,
            matches: &matches,
            query,
            sources: &inputs.sources,
            initial_position: inputs.initial_position,
            initial_source_positions: &inputs.initial_source_positions,
        })?;

        Ok(PositionEstimate::new(solution, matches, fingerprints))
    }
}
