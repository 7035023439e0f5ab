//! Non-linear fingerprint position solver
//!
//! Each (matched fingerprint, shared source) pair contributes one residual
//! comparing the query RSSI with the RSSI predicted at the candidate
//! position from that fingerprint's own reading:
//!
//! `r = q − f_i + slope·T(p − p_i, p_i − s)`
//!
//! where `T` is the truncated log-distance expansion. Residuals are weighted
//! by the inverse of the RSSI variance plus the squared truncation-error
//! bound of their expansion, so fingerprints far from the candidate position
//! (relative to their distance from the source) fade out and drop to zero
//! weight past `max_expansion_ratio`. Because the weights move with the
//! position, each start point is refined by reweighted Levenberg-Marquardt
//! passes. Without a caller seed, the matched centroid and the closest
//! matched fingerprints are all tried and the lowest reduced chi-square wins.
//!
//! Unlocated sources can be added to the parameter vector, in which case the
//! position and those sources are estimated jointly.

use crate::algorithms::covariance::{
    check_positive_semidefinite, diagonal_block, invert_information, least_squares_sensitivity,
    propagate, InputCovariance,
};
use crate::algorithms::matcher::FingerprintMatch;
use crate::algorithms::path_loss::{dbm_to_watts, LogDistanceExpansion, PathLossModel};
use crate::core::{Covariance, Fingerprint, LocatedFingerprint, Position, RadioSource};
use crate::utils::config::{EstimatorConfig, UnderdeterminedSourcePolicy};
use crate::validation::error::{CovarianceError, EstimationError};
use nalgebra::{DMatrix, DVector, SVector};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e12;
/// Reweighting passes per start point
const REWEIGHT_PASSES: usize = 10;
/// Matched fingerprints tried as start points besides the centroid
const FINGERPRINT_STARTS: usize = 4;

/// Everything the solver reads for one estimate
#[derive(Debug, Clone, Copy)]
pub struct SolverInput<'a, const D: usize> {
    /// Calibration set the matches index into
    pub fingerprints: &'a [LocatedFingerprint<D>],
    /// Working set selected by the matcher
    pub matches: &'a [FingerprintMatch],
    pub query: &'a Fingerprint<D>,
    /// Sources that may be used; readings are resolved against them by id
    pub sources: &'a [Arc<RadioSource<D>>],
    pub initial_position: Option<Position<D>>,
    /// Seeds for unlocated sources in joint mode
    pub initial_source_positions: &'a HashMap<String, Position<D>>,
}

/// Unlocated source whose position was estimated jointly
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatedSource<const D: usize> {
    /// Source located at its estimated position
    pub source: Arc<RadioSource<D>>,
    /// Number of matched readings that referenced it
    pub readings: usize,
}

/// Solver output
#[derive(Debug, Clone, PartialEq)]
pub struct Solution<const D: usize> {
    pub position: Position<D>,
    /// Position covariance, `None` when propagation is disabled or failed
    pub covariance: Option<Covariance<D>>,
    pub covariance_error: Option<CovarianceError>,
    /// Weighted residual sum of squares
    pub chi_sq: f64,
    pub iterations: usize,
    /// Number of residuals used
    pub observations: usize,
    pub estimated_sources: Vec<EstimatedSource<D>>,
    /// Ids of unlocated sources left out for lack of readings
    pub dropped_sources: Vec<String>,
}

/// Source taking part in the problem
#[derive(Debug, Clone)]
struct SourceSlot<const D: usize> {
    source: Arc<RadioSource<D>>,
    exponent: f64,
    exponent_variance: f64,
    query_rssi: f64,
    query_variance: f64,
    /// First parameter index of an estimated source
    parameter_offset: Option<usize>,
    seed: SVector<f64, D>,
    readings: usize,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    /// Ordinal of the matched fingerprint
    group: usize,
    fingerprint: usize,
    slot: usize,
    fingerprint_rssi: f64,
    fingerprint_variance: f64,
}

/// Residual derivatives with respect to the solver inputs
#[derive(Debug, Clone, Copy)]
struct InputPartials<const D: usize> {
    exponent: f64,
    fingerprint_position: SVector<f64, D>,
    source_position: SVector<f64, D>,
}

struct Linearization<const D: usize> {
    residuals: DVector<f64>,
    jacobian: DMatrix<f64>,
    partials: Vec<InputPartials<D>>,
}

/// Outcome of refining one start point
struct Refinement<const D: usize> {
    x: DVector<f64>,
    linearization: Linearization<D>,
    sqrt_weights: DVector<f64>,
    iterations: usize,
    chi_sq: f64,
    /// Reduced chi-square, infinite without spare degrees of freedom
    score: f64,
}

struct Problem<'a, const D: usize> {
    config: &'a EstimatorConfig,
    fingerprints: &'a [LocatedFingerprint<D>],
    group_fingerprints: Vec<usize>,
    slots: Vec<SourceSlot<D>>,
    observations: Vec<Observation>,
    parameters: usize,
}

/// Weighted non-linear least-squares position solver
#[derive(Debug, Clone)]
pub struct PositionSolver<'a> {
    config: &'a EstimatorConfig,
}

impl<'a> PositionSolver<'a> {
    pub fn new(config: &'a EstimatorConfig) -> Self {
        Self { config }
    }

    /// Refine a position (and, in joint mode, unlocated sources) from the matches
    pub fn solve<const D: usize>(&self, input: &SolverInput<'_, D>) -> Result<Solution<D>, EstimationError> {
        let (problem, dropped_sources) = Problem::build(self.config, input)?;

        let starts = start_points(input);
        if starts.is_empty() {
            return Err(EstimationError::NoObservations);
        }

        let mut best: Option<Refinement<D>> = None;
        let mut first_error = None;
        for (index, start) in starts.iter().enumerate() {
            match problem.refine(problem.initial_parameters(start)) {
                Ok(refinement) => {
                    debug!(
                        start = index,
                        score = refinement.score,
                        chi_sq = refinement.chi_sq,
                        iterations = refinement.iterations,
                        "Refined start point"
                    );
                    if best.as_ref().map_or(true, |b| refinement.score < b.score) {
                        best = Some(refinement);
                    }
                }
                Err(e) => {
                    debug!(start = index, error = %e, "Start point failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        let Some(best) = best else {
            return Err(first_error.unwrap_or(EstimationError::NoObservations));
        };
        let x = &best.x;

        let position = Position::new(SVector::from_fn(|i, _| x[i]));

        let (covariance, covariance_error) = if self.config.propagation.any() {
            match problem.propagate_covariance(&best.linearization, &best.sqrt_weights) {
                Ok(full) => (Some(full), None),
                Err(e) => {
                    warn!(error = %e, "Covariance propagation failed, publishing position only");
                    (None, Some(e))
                }
            }
        } else {
            (None, None)
        };

        let estimated_sources = problem
            .slots
            .iter()
            .filter_map(|slot| {
                let offset = slot.parameter_offset?;
                let estimate = Position::new(SVector::from_fn(|i, _| x[offset + i]));
                let block = covariance.as_ref().map(|c| diagonal_block::<D>(c, offset));
                Some(EstimatedSource {
                    source: Arc::new(slot.source.with_estimated_position(estimate, block)),
                    readings: slot.readings,
                })
            })
            .collect();

        Ok(Solution {
            position,
            covariance: covariance.as_ref().map(|c| diagonal_block::<D>(c, 0)),
            covariance_error,
            chi_sq: best.chi_sq,
            iterations: best.iterations,
            observations: problem.observations.len(),
            estimated_sources,
            dropped_sources,
        })
    }
}

/// Caller seed alone, else the matched centroid followed by the closest matched fingerprints
fn start_points<const D: usize>(input: &SolverInput<'_, D>) -> Vec<SVector<f64, D>> {
    if let Some(p) = input.initial_position {
        return vec![p.coords];
    }
    let mut starts: Vec<SVector<f64, D>> =
        Position::centroid(input.matches.iter().map(|m| input.fingerprints[m.index].position()))
            .map(|c| c.coords)
            .into_iter()
            .collect();
    for m in input.matches.iter().take(FINGERPRINT_STARTS) {
        let p = input.fingerprints[m.index].position().coords;
        if !starts.contains(&p) {
            starts.push(p);
        }
    }
    starts
}

fn variance(std_dev: Option<f64>, fallback: f64) -> f64 {
    let s = std_dev.unwrap_or(fallback);
    s * s
}

impl<'a, const D: usize> Problem<'a, D> {
    /// Resolve readings into observations and lay out the parameter vector
    fn build(
        config: &'a EstimatorConfig,
        input: &SolverInput<'a, D>,
    ) -> Result<(Self, Vec<String>), EstimationError> {
        let supplied: HashMap<&str, &Arc<RadioSource<D>>> =
            input.sources.iter().map(|s| (s.id(), s)).collect();

        // (group, fingerprint, reading index, source)
        let mut candidates = Vec::new();
        let mut unknown_counts: HashMap<&str, usize> = HashMap::new();

        for (group, m) in input.matches.iter().enumerate() {
            let fingerprint = &input.fingerprints[m.index];
            for (reading_index, reading) in fingerprint.readings().iter().enumerate() {
                if input.query.reading_for(reading.source_id()).is_none() {
                    continue;
                }
                let Some(source) = supplied.get(reading.source_id()) else {
                    debug!(source_id = reading.source_id(), "Skipping reading of unsupplied source");
                    continue;
                };
                match source.position() {
                    Some(s) => {
                        if (fingerprint.position().coords - s.coords).norm_squared() <= f64::EPSILON {
                            debug!(
                                source_id = source.id(),
                                fingerprint = m.index,
                                "Skipping fingerprint collocated with its source"
                            );
                            continue;
                        }
                    }
                    None if config.solve_sources => {
                        *unknown_counts.entry(source.id()).or_insert(0) += 1;
                    }
                    None => {
                        debug!(source_id = source.id(), "Skipping reading of unlocated source");
                        continue;
                    }
                }
                candidates.push((group, m.index, reading_index, *source));
            }
        }

        let mut dropped = Vec::new();
        let mut unknown_ids: Vec<&str> = unknown_counts.keys().copied().collect();
        unknown_ids.sort_unstable();
        for id in unknown_ids {
            let readings = unknown_counts[id];
            if readings > D {
                continue;
            }
            match config.underdetermined_source_policy {
                UnderdeterminedSourcePolicy::Fail => {
                    return Err(EstimationError::UnderdeterminedSource {
                        source_id: id.to_string(),
                        readings,
                        required: D + 1,
                    });
                }
                UnderdeterminedSourcePolicy::Drop => {
                    warn!(source_id = id, readings, required = D + 1, "Dropping under-determined source");
                    dropped.push(id.to_string());
                }
            }
        }
        candidates.retain(|(_, _, _, source)| !dropped.iter().any(|id| id == source.id()));

        if candidates.is_empty() {
            return Err(EstimationError::NoObservations);
        }

        let mut slot_index: HashMap<&str, usize> = HashMap::new();
        let mut slots: Vec<SourceSlot<D>> = Vec::new();
        let mut observations = Vec::with_capacity(candidates.len());
        let mut parameters = D;

        for &(group, fingerprint_index, reading_index, source) in &candidates {
            let slot = match slot_index.get(source.id()) {
                Some(&slot) => slot,
                None => {
                    let query_reading = input
                        .query
                        .reading_for(source.id())
                        .ok_or(EstimationError::NoObservations)?;
                    let (exponent, exponent_std) = match source.path_loss_exponent() {
                        Some(n) if config.use_source_path_loss_exponent => {
                            (n, source.path_loss_exponent_std().unwrap_or(0.0))
                        }
                        _ => (config.path_loss_exponent, config.path_loss_exponent_std),
                    };
                    let parameter_offset = if source.is_located() {
                        None
                    } else {
                        parameters += D;
                        Some(parameters - D)
                    };
                    slots.push(SourceSlot {
                        source: source.clone(),
                        exponent,
                        exponent_variance: exponent_std * exponent_std,
                        query_rssi: query_reading.rssi_dbm,
                        query_variance: variance(query_reading.rssi_std, config.fallback_rssi_std),
                        parameter_offset,
                        seed: source.position().map(|p| p.coords).unwrap_or_else(SVector::<f64, D>::zeros),
                        readings: 0,
                    });
                    slot_index.insert(source.id(), slots.len() - 1);
                    slots.len() - 1
                }
            };
            slots[slot].readings += 1;

            let reading = &input.fingerprints[fingerprint_index].readings()[reading_index];
            observations.push(Observation {
                group,
                fingerprint: fingerprint_index,
                slot,
                fingerprint_rssi: reading.rssi_dbm,
                fingerprint_variance: variance(reading.rssi_std, config.fallback_rssi_std),
            });
        }

        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.parameter_offset.is_none() {
                continue;
            }
            slot.seed = match input.initial_source_positions.get(slot.source.id()) {
                Some(p) => p.coords,
                None => power_weighted_centroid(input.fingerprints, &observations, index)
                    .unwrap_or(slot.seed),
            };
        }

        debug!(
            observations = observations.len(),
            sources = slots.len(),
            parameters,
            dropped = dropped.len(),
            "Built fingerprint observations"
        );

        Ok((
            Self {
                config,
                fingerprints: input.fingerprints,
                group_fingerprints: input.matches.iter().map(|m| m.index).collect(),
                slots,
                observations,
                parameters,
            },
            dropped,
        ))
    }

    fn source_position(&self, slot: &SourceSlot<D>, x: &DVector<f64>) -> SVector<f64, D> {
        match slot.parameter_offset {
            Some(offset) => SVector::from_fn(|i, _| x[offset + i]),
            None => slot.seed,
        }
    }

    /// Parameter vector for a position start, with estimated sources at their seeds
    fn initial_parameters(&self, start: &SVector<f64, D>) -> DVector<f64> {
        let mut x = DVector::zeros(self.parameters);
        x.rows_mut(0, D).copy_from(start);
        for slot in &self.slots {
            if let Some(offset) = slot.parameter_offset {
                x.rows_mut(offset, D).copy_from(&slot.seed);
            }
        }
        x
    }

    /// Residuals and parameter Jacobian at `x`, mean-removed when configured
    fn linearize(&self, x: &DVector<f64>, sqrt_weights: &DVector<f64>) -> Linearization<D> {
        let n = self.observations.len();
        let p = SVector::<f64, D>::from_fn(|i, _| x[i]);
        let mut residuals = DVector::zeros(n);
        let mut jacobian = DMatrix::zeros(n, self.parameters);
        let mut partials = Vec::with_capacity(n);

        for (row, obs) in self.observations.iter().enumerate() {
            let slot = &self.slots[obs.slot];
            let p_i = self.fingerprints[obs.fingerprint].position().coords;
            let s = self.source_position(slot, x);
            let slope = PathLossModel::new(slot.exponent).slope();

            residuals[row] = slot.query_rssi - obs.fingerprint_rssi;
            let mut partial = InputPartials {
                exponent: 0.0,
                fingerprint_position: SVector::zeros(),
                source_position: SVector::zeros(),
            };

            if let Some(e) = LogDistanceExpansion::evaluate(&(p - p_i), &(p_i - s), self.config.taylor_order) {
                residuals[row] += slope * e.value;
                for k in 0..D {
                    jacobian[(row, k)] = slope * e.d_offset[k];
                }
                if let Some(offset) = slot.parameter_offset {
                    for k in 0..D {
                        jacobian[(row, offset + k)] = -slope * e.d_reference[k];
                    }
                }
                partial = InputPartials {
                    exponent: PathLossModel::slope_derivative() * e.value,
                    fingerprint_position: (e.d_reference - e.d_offset) * slope,
                    source_position: -e.d_reference * slope,
                };
            }
            partials.push(partial);
        }

        if self.config.remove_mean_from_readings {
            self.center_vector(&mut residuals, sqrt_weights);
            self.center_rows(&mut jacobian, sqrt_weights);
        }

        Linearization {
            residuals,
            jacobian,
            partials,
        }
    }

    /// Each row's share of its fingerprint group's total weight
    fn group_shares(&self, sqrt_weights: &DVector<f64>) -> Vec<f64> {
        let mut totals = vec![0.0; self.group_fingerprints.len()];
        for (obs, w) in self.observations.iter().zip(sqrt_weights.iter()) {
            totals[obs.group] += w * w;
        }
        self.observations
            .iter()
            .zip(sqrt_weights.iter())
            .map(|(obs, w)| {
                let total = totals[obs.group];
                if total > 0.0 {
                    w * w / total
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Subtract each fingerprint group's weighted mean from its rows
    fn center_rows(&self, matrix: &mut DMatrix<f64>, sqrt_weights: &DVector<f64>) {
        let shares = self.group_shares(sqrt_weights);
        let mut means = DMatrix::<f64>::zeros(self.group_fingerprints.len(), matrix.ncols());
        for (row, obs) in self.observations.iter().enumerate() {
            for col in 0..matrix.ncols() {
                means[(obs.group, col)] += shares[row] * matrix[(row, col)];
            }
        }
        for (row, obs) in self.observations.iter().enumerate() {
            for col in 0..matrix.ncols() {
                matrix[(row, col)] -= means[(obs.group, col)];
            }
        }
    }

    fn center_vector(&self, vector: &mut DVector<f64>, sqrt_weights: &DVector<f64>) {
        let shares = self.group_shares(sqrt_weights);
        let mut means = vec![0.0; self.group_fingerprints.len()];
        for (row, obs) in self.observations.iter().enumerate() {
            means[obs.group] += shares[row] * vector[row];
        }
        for (row, obs) in self.observations.iter().enumerate() {
            vector[row] -= means[obs.group];
        }
    }

    fn base_variance(&self, obs: &Observation) -> f64 {
        self.slots[obs.slot].query_variance + obs.fingerprint_variance
    }

    /// Square-root weights `1/σ_eff` at `x`
    ///
    /// `σ_eff²` adds the squared truncation bound (in dB) of the observation's
    /// expansion to its RSSI variance. Observations of estimated sources keep
    /// the RSSI variance alone, their source moves with the solve.
    fn sqrt_weights(&self, x: &DVector<f64>) -> DVector<f64> {
        let p = SVector::<f64, D>::from_fn(|i, _| x[i]);
        let order = self.config.taylor_order;
        let radius = self.config.max_expansion_ratio;

        DVector::from_iterator(
            self.observations.len(),
            self.observations.iter().map(|obs| {
                let slot = &self.slots[obs.slot];
                let base = self.base_variance(obs);
                if slot.parameter_offset.is_some() {
                    return 1.0 / base.sqrt();
                }
                let p_i = self.fingerprints[obs.fingerprint].position().coords;
                let ratio = (p - p_i).norm() / (p_i - slot.seed).norm();
                let bound = order.truncation_bound(ratio, radius);
                if !bound.is_finite() {
                    return 0.0;
                }
                let truncation = PathLossModel::new(slot.exponent).slope() * bound;
                1.0 / (base + truncation * truncation).sqrt()
            }),
        )
    }

    /// Weighted observation count, less one per fingerprint group when residuals are centered
    fn effective_observations(&self, sqrt_weights: &DVector<f64>) -> f64 {
        let mut per_group = vec![0.0; self.group_fingerprints.len()];
        for (obs, w) in self.observations.iter().zip(sqrt_weights.iter()) {
            per_group[obs.group] += w * w * self.base_variance(obs);
        }
        if self.config.remove_mean_from_readings {
            per_group.iter().map(|v| (v - 1.0).max(0.0)).sum()
        } else {
            per_group.iter().sum()
        }
    }

    fn weigh_rows(matrix: &DMatrix<f64>, sqrt_weights: &DVector<f64>) -> DMatrix<f64> {
        let mut weighted = matrix.clone();
        for (row, w) in sqrt_weights.iter().enumerate() {
            for col in 0..weighted.ncols() {
                weighted[(row, col)] *= w;
            }
        }
        weighted
    }

    /// Reweighted minimization from one start point
    fn refine(&self, mut x: DVector<f64>) -> Result<Refinement<D>, EstimationError> {
        let tolerance = self.config.convergence_tolerance;
        let mut iterations = 0;

        for pass in 1..=REWEIGHT_PASSES {
            let sqrt_weights = self.sqrt_weights(&x);
            let (next, used) = self.minimize(x.clone(), &sqrt_weights)?;
            iterations += used;
            let moved = (&next - &x).norm();
            x = next;
            debug!(pass, moved, "Reweighting pass");
            if moved <= tolerance * (x.norm() + tolerance) {
                break;
            }
        }

        let sqrt_weights = self.sqrt_weights(&x);
        let linearization = self.linearize(&x, &sqrt_weights);
        let chi_sq = linearization.residuals.component_mul(&sqrt_weights).norm_squared();
        let dof = self.effective_observations(&sqrt_weights) - self.parameters as f64;
        let score = if dof > 0.0 { chi_sq / dof } else { f64::INFINITY };

        Ok(Refinement {
            x,
            linearization,
            sqrt_weights,
            iterations,
            chi_sq,
            score,
        })
    }

    /// Levenberg-Marquardt minimization of the residuals under fixed weights
    fn minimize(
        &self,
        mut x: DVector<f64>,
        sqrt_weights: &DVector<f64>,
    ) -> Result<(DVector<f64>, usize), EstimationError> {
        let tolerance = self.config.convergence_tolerance;

        let mut current = self.linearize(&x, sqrt_weights);
        let mut cost = current.residuals.component_mul(sqrt_weights).norm_squared();
        let mut lambda = INITIAL_DAMPING;

        for iteration in 1..=self.config.max_iterations {
            let a = Self::weigh_rows(&current.jacobian, sqrt_weights);
            let r = current.residuals.component_mul(sqrt_weights);
            let at = a.transpose();
            let hessian = &at * &a;
            let gradient = &at * &r;

            let scale = (hessian.trace() / self.parameters as f64).max(f64::MIN_POSITIVE);
            let mut damped = hessian;
            for i in 0..self.parameters {
                damped[(i, i)] += lambda * scale;
            }

            let step = solve_linear_system(damped, &(-gradient)).ok_or_else(|| EstimationError::SingularSystem {
                context: format!("damped normal equations at iteration {}", iteration),
            })?;
            let step_norm = step.norm();
            let small_step = step_norm <= tolerance * (x.norm() + tolerance);

            let candidate_x = &x + &step;
            let candidate = self.linearize(&candidate_x, sqrt_weights);
            let candidate_cost = candidate.residuals.component_mul(sqrt_weights).norm_squared();

            debug!(iteration, cost, candidate_cost, lambda, step_norm, "Solver iteration");

            if candidate_cost.is_finite() && candidate_cost <= cost {
                x = candidate_x;
                current = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(MIN_DAMPING);
                if small_step {
                    return Ok((x, iteration));
                }
            } else {
                lambda *= 10.0;
                if small_step || lambda > MAX_DAMPING {
                    return Ok((x, iteration));
                }
            }
        }

        Err(EstimationError::NotConverged {
            iterations: self.config.max_iterations,
            cost,
        })
    }

    /// Joint covariance of all parameters at the converged linearization
    fn propagate_covariance(
        &self,
        linearization: &Linearization<D>,
        sqrt_weights: &DVector<f64>,
    ) -> Result<DMatrix<f64>, CovarianceError> {
        let flags = self.config.propagation;
        let mut input = InputCovariance::new();
        // (row, column, ∂r/∂input)
        let mut entries: Vec<(usize, usize, f64)> = Vec::new();

        let rows_of_slot = |slot: usize| {
            self.observations
                .iter()
                .enumerate()
                .filter(move |(_, obs)| obs.slot == slot)
                .map(|(row, _)| row)
        };

        if flags.rssi_variance {
            for (index, slot) in self.slots.iter().enumerate() {
                let column = input.push_variance(slot.query_variance);
                entries.extend(rows_of_slot(index).map(|row| (row, column, 1.0)));
            }
            for (row, obs) in self.observations.iter().enumerate() {
                let column = input.push_variance(obs.fingerprint_variance);
                entries.push((row, column, -1.0));
            }
        }

        if flags.path_loss_exponent_variance {
            for (index, slot) in self.slots.iter().enumerate() {
                let column = input.push_variance(slot.exponent_variance);
                entries.extend(rows_of_slot(index).map(|row| (row, column, linearization.partials[row].exponent)));
            }
        }

        if flags.fingerprint_position_covariance {
            for (group, &fingerprint) in self.group_fingerprints.iter().enumerate() {
                let Some(cov) = self.fingerprints[fingerprint].position_covariance() else {
                    continue;
                };
                let rows: Vec<usize> = self
                    .observations
                    .iter()
                    .enumerate()
                    .filter(|(_, obs)| obs.group == group)
                    .map(|(row, _)| row)
                    .collect();
                if rows.is_empty() {
                    continue;
                }
                let column = input.push_position(cov);
                for row in rows {
                    let partial = linearization.partials[row].fingerprint_position;
                    entries.extend((0..D).map(|k| (row, column + k, partial[k])));
                }
            }
        }

        if flags.source_position_covariance {
            for (index, slot) in self.slots.iter().enumerate() {
                if slot.parameter_offset.is_some() {
                    continue;
                }
                let Some(cov) = slot.source.position_covariance() else {
                    continue;
                };
                let column = input.push_position(cov);
                for row in rows_of_slot(index) {
                    let partial = linearization.partials[row].source_position;
                    entries.extend((0..D).map(|k| (row, column + k, partial[k])));
                }
            }
        }

        let a = Self::weigh_rows(&linearization.jacobian, sqrt_weights);

        if input.is_empty() {
            invert_information(&(a.transpose() * &a))?;
            return Ok(DMatrix::zeros(self.parameters, self.parameters));
        }

        let mut b = DMatrix::zeros(self.observations.len(), input.dimension());
        for (row, column, value) in entries {
            b[(row, column)] += value;
        }
        if self.config.remove_mean_from_readings {
            self.center_rows(&mut b, sqrt_weights);
        }
        let b = Self::weigh_rows(&b, sqrt_weights);

        let sensitivity = least_squares_sensitivity(&a, &b)?;
        let covariance = propagate(&sensitivity, &input.to_matrix());
        check_positive_semidefinite(&covariance)?;

        debug!(
            inputs = input.dimension(),
            parameters = self.parameters,
            "Propagated input covariance"
        );
        Ok(covariance)
    }
}

/// Centroid of the fingerprints reading a slot, weighted by received power in watts
fn power_weighted_centroid<const D: usize>(
    fingerprints: &[LocatedFingerprint<D>],
    observations: &[Observation],
    slot: usize,
) -> Option<SVector<f64, D>> {
    let mut sum = SVector::<f64, D>::zeros();
    let mut total = 0.0;
    for obs in observations.iter().filter(|obs| obs.slot == slot) {
        let w = dbm_to_watts(obs.fingerprint_rssi);
        sum += fingerprints[obs.fingerprint].position().coords * w;
        total += w;
    }
    if total > 0.0 {
        Some(sum / total)
    } else {
        None
    }
}

/// Cholesky solve with an SVD fallback
fn solve_linear_system(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(cholesky) = matrix.clone().cholesky() {
        return Some(cholesky.solve(rhs));
    }
    matrix.svd(true, true).solve(rhs, 1e-12).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::path_loss::TaylorOrder;
    use crate::core::{Reading, SourceLocation};
    use crate::utils::config::PropagationFlags;
    use nalgebra::Matrix2;

    const PTE: f64 = -40.0;

    fn located_source(id: &str, x: f64, y: f64) -> Arc<RadioSource<2>> {
        Arc::new(RadioSource::located(id, 2.4e9, SourceLocation::new(Position::xy(x, y))))
    }

    fn rssi(source_at: Position<2>, at: &Position<2>) -> f64 {
        PathLossModel::free_space().received_power_dbm(PTE, source_at.distance_to(at))
    }

    fn fingerprint(sources: &[(Arc<RadioSource<2>>, Position<2>)], at: Position<2>) -> LocatedFingerprint<2> {
        let readings = sources.iter().map(|(s, p)| Reading::new(s.clone(), rssi(*p, &at))).collect();
        LocatedFingerprint::new(readings, at).unwrap()
    }

    fn query(sources: &[(Arc<RadioSource<2>>, Position<2>)], at: Position<2>, bias: f64) -> Fingerprint<2> {
        Fingerprint::new(
            sources
                .iter()
                .map(|(s, p)| Reading::new(s.clone(), rssi(*p, &at) + bias))
                .collect(),
        )
        .unwrap()
    }

    fn all_matches(n: usize) -> Vec<FingerprintMatch> {
        (0..n)
            .map(|index| FingerprintMatch {
                index,
                distance: 0.0,
                shared_sources: 0,
            })
            .collect()
    }

    fn known_sources() -> Vec<(Arc<RadioSource<2>>, Position<2>)> {
        [(10.0, 15.0), (85.0, 20.0), (50.0, 90.0)]
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| (located_source(&format!("s{}", i), x, y), Position::xy(x, y)))
            .collect()
    }

    fn cluster() -> Vec<Position<2>> {
        let mut positions = Vec::new();
        for y in [52.0, 60.0] {
            for x in [41.0, 47.0, 53.0] {
                positions.push(Position::xy(x, y));
            }
        }
        positions
    }

    fn solve_with(
        config: &EstimatorConfig,
        sources: &[(Arc<RadioSource<2>>, Position<2>)],
        fingerprints: &[LocatedFingerprint<2>],
        query: &Fingerprint<2>,
        seeds: &HashMap<String, Position<2>>,
    ) -> Result<Solution<2>, EstimationError> {
        let supplied: Vec<_> = sources.iter().map(|(s, _)| s.clone()).collect();
        let matches = all_matches(fingerprints.len());
        PositionSolver::new(config).solve(&SolverInput {
            fingerprints,
            matches: &matches,
            query,
            sources: &supplied,
            initial_position: None,
            initial_source_positions: seeds,
        })
    }

    #[test]
    fn test_recovers_position_for_every_order() {
        let sources = known_sources();
        let fingerprints: Vec<_> = cluster().into_iter().map(|p| fingerprint(&sources, p)).collect();
        let truth = Position::xy(47.0, 56.0);
        let q = query(&sources, truth, 0.0);

        for (order, bound) in [(TaylorOrder::First, 3.0), (TaylorOrder::Second, 1.0), (TaylorOrder::Third, 0.5)] {
            let config = EstimatorConfig {
                taylor_order: order,
                remove_mean_from_readings: false,
                ..EstimatorConfig::default()
            };
            let solution = solve_with(&config, &sources, &fingerprints, &q, &HashMap::new()).unwrap();
            let error = solution.position.distance_to(&truth);
            assert!(error < bound, "{:?} error {} exceeds {}", order, error, bound);
            assert_eq!(solution.observations, 18);
            assert!(solution.chi_sq >= 0.0);
            assert!(solution.covariance.is_none());
            assert!(solution.covariance_error.is_none());
        }
    }

    #[test]
    fn test_distant_fingerprint_gets_no_weight() {
        let sources = known_sources();
        let mut positions = cluster();
        positions.push(Position::xy(20.0, 25.0));
        let fingerprints: Vec<_> = positions.into_iter().map(|p| fingerprint(&sources, p)).collect();
        let truth = Position::xy(47.0, 56.0);
        let q = query(&sources, truth, 0.0);
        let config = EstimatorConfig::default();

        let with_distant = solve_with(&config, &sources, &fingerprints, &q, &HashMap::new()).unwrap();
        let cluster_only = solve_with(&config, &sources, &fingerprints[..6], &q, &HashMap::new()).unwrap();
        assert_eq!(with_distant.observations, 21);
        assert!(with_distant.position.distance_to(&truth) < 0.05);
        assert!(with_distant.position.distance_to(&cluster_only.position) < 1e-4);

        let supplied: Vec<_> = sources.iter().map(|(s, _)| s.clone()).collect();
        let matches = all_matches(fingerprints.len());
        let seeds = HashMap::new();
        let input = SolverInput {
            fingerprints: &fingerprints,
            matches: &matches,
            query: &q,
            sources: &supplied,
            initial_position: None,
            initial_source_positions: &seeds,
        };
        let (problem, _) = Problem::build(&config, &input).unwrap();
        let weights = problem.sqrt_weights(&problem.initial_parameters(&with_distant.position.coords));
        assert!(weights.rows(0, 18).iter().all(|w| *w > 0.0));
        assert!(weights.rows(18, 3).iter().all(|w| *w == 0.0));
    }

    #[test]
    fn test_start_points() {
        let sources = known_sources();
        let fingerprints: Vec<_> = cluster().into_iter().map(|p| fingerprint(&sources, p)).collect();
        let supplied: Vec<_> = sources.iter().map(|(s, _)| s.clone()).collect();
        let matches = all_matches(fingerprints.len());
        let seeds = HashMap::new();
        let q = query(&sources, Position::xy(47.0, 56.0), 0.0);
        let mut input = SolverInput {
            fingerprints: &fingerprints,
            matches: &matches,
            query: &q,
            sources: &supplied,
            initial_position: None,
            initial_source_positions: &seeds,
        };

        let starts = start_points(&input);
        assert_eq!(starts.len(), 1 + FINGERPRINT_STARTS);
        assert!((starts[0] - Position::xy(47.0, 56.0).coords).norm() < 1e-12);
        assert_eq!(starts[1], fingerprints[0].position().coords);

        input.initial_position = Some(Position::xy(10.0, 10.0));
        assert_eq!(start_points(&input), vec![Position::xy(10.0, 10.0).coords]);
    }

    #[test]
    fn test_residual_mean_removal_cancels_query_offset() {
        let sources = known_sources();
        let fingerprints: Vec<_> = cluster().into_iter().map(|p| fingerprint(&sources, p)).collect();
        let truth = Position::xy(52.0, 54.0);
        let q = query(&sources, truth, 7.5);

        let config = EstimatorConfig {
            remove_mean_from_readings: true,
            ..EstimatorConfig::default()
        };
        let solution = solve_with(&config, &sources, &fingerprints, &q, &HashMap::new()).unwrap();
        assert!(solution.position.distance_to(&truth) < 0.5);
    }

    #[test]
    fn test_no_observations_without_located_sources() {
        let unknown = Arc::new(RadioSource::<2>::new("u", 2.4e9));
        let fingerprints =
            vec![LocatedFingerprint::new(vec![Reading::new(unknown.clone(), -60.0)], Position::xy(1.0, 1.0)).unwrap()];
        let q = Fingerprint::new(vec![Reading::new(unknown.clone(), -62.0)]).unwrap();
        let sources = vec![(unknown, Position::origin())];

        let result = solve_with(&EstimatorConfig::default(), &sources, &fingerprints, &q, &HashMap::new());
        assert_eq!(result.unwrap_err(), EstimationError::NoObservations);
    }

    #[test]
    fn test_covariance_propagation() {
        let mut sources = known_sources();
        let cov = Matrix2::new(0.5, 0.1, 0.1, 0.4);
        sources[0].0 = Arc::new(RadioSource::located(
            "s0",
            2.4e9,
            SourceLocation::new(Position::xy(10.0, 15.0))
                .with_covariance(cov)
                .with_path_loss_exponent(2.0, Some(0.1)),
        ));
        let fingerprints: Vec<_> = cluster()
            .into_iter()
            .map(|p| fingerprint(&sources, p).with_covariance(Matrix2::identity() * 0.01))
            .collect();
        let q = query(&sources, Position::xy(45.0, 55.0), 0.0);

        let config = EstimatorConfig {
            propagation: PropagationFlags::all(),
            ..EstimatorConfig::default()
        };
        let solution = solve_with(&config, &sources, &fingerprints, &q, &HashMap::new()).unwrap();
        let covariance = solution.covariance.expect("covariance propagated");
        assert!(solution.covariance_error.is_none());
        assert!((covariance - covariance.transpose()).norm() < 1e-12);
        assert!(covariance[(0, 0)] > 0.0 && covariance[(1, 1)] > 0.0);
        assert!(covariance.symmetric_eigenvalues().iter().all(|v| *v >= -1e-12));

        let rssi_only = EstimatorConfig {
            propagation: PropagationFlags {
                rssi_variance: true,
                ..PropagationFlags::default()
            },
            ..EstimatorConfig::default()
        };
        let smaller = solve_with(&rssi_only, &sources, &fingerprints, &q, &HashMap::new())
            .unwrap()
            .covariance
            .unwrap();
        assert!(smaller.trace() <= covariance.trace() + 1e-12);
    }

    fn joint_scenario(
        unknown_in: usize,
    ) -> (Vec<(Arc<RadioSource<2>>, Position<2>)>, Vec<LocatedFingerprint<2>>, Fingerprint<2>, Position<2>) {
        let mut sources = known_sources();
        let u_at = Position::xy(90.0, 80.0);
        sources.push((Arc::new(RadioSource::new("u", 2.4e9)), u_at));

        let known = &sources[..3];
        let fingerprints = cluster()
            .into_iter()
            .enumerate()
            .map(|(i, p)| if i < unknown_in { fingerprint(&sources, p) } else { fingerprint(known, p) })
            .collect();
        let truth = Position::xy(47.0, 56.0);
        (sources.clone(), fingerprints, query(&sources, truth, 0.0), truth)
    }

    #[test]
    fn test_underdetermined_source_dropped_or_fatal() {
        let (sources, fingerprints, q, truth) = joint_scenario(2);
        let config = EstimatorConfig {
            solve_sources: true,
            ..EstimatorConfig::default()
        };
        let solution = solve_with(&config, &sources, &fingerprints, &q, &HashMap::new()).unwrap();
        assert!(solution.estimated_sources.is_empty());
        assert_eq!(solution.dropped_sources, vec!["u".to_string()]);
        assert!(solution.position.distance_to(&truth) < 0.5);

        let strict = EstimatorConfig {
            underdetermined_source_policy: UnderdeterminedSourcePolicy::Fail,
            ..config
        };
        assert_eq!(
            solve_with(&strict, &sources, &fingerprints, &q, &HashMap::new()).unwrap_err(),
            EstimationError::UnderdeterminedSource {
                source_id: "u".to_string(),
                readings: 2,
                required: 3,
            }
        );
    }

    #[test]
    fn test_joint_estimate_includes_resolvable_source() {
        let (sources, fingerprints, q, truth) = joint_scenario(3);
        let config = EstimatorConfig {
            solve_sources: true,
            max_iterations: 500,
            convergence_tolerance: 1e-8,
            ..EstimatorConfig::default()
        };
        let seeds = HashMap::from([("u".to_string(), Position::xy(90.0, 80.0))]);
        let solution = solve_with(&config, &sources, &fingerprints, &q, &seeds).unwrap();

        assert!(solution.dropped_sources.is_empty());
        assert_eq!(solution.estimated_sources.len(), 1);
        let estimated = &solution.estimated_sources[0];
        assert_eq!(estimated.source.id(), "u");
        assert_eq!(estimated.readings, 3);
        assert!(estimated.source.is_located());
        assert!(solution.position.distance_to(&truth) < 0.5);
    }

    #[test]
    fn test_unlocated_sources_ignored_outside_joint_mode() {
        let (sources, fingerprints, q, truth) = joint_scenario(6);
        let solution =
            solve_with(&EstimatorConfig::default(), &sources, &fingerprints, &q, &HashMap::new()).unwrap();
        assert!(solution.estimated_sources.is_empty());
        assert!(solution.dropped_sources.is_empty());
        assert_eq!(solution.observations, 18);
        assert!(solution.position.distance_to(&truth) < 0.5);
    }

    #[test]
    fn test_power_weighted_seed_favours_strongest_reading() {
        let (_, fingerprints, _, _) = joint_scenario(6);
        let observations: Vec<Observation> = [(0, -50.0), (1, -70.0), (2, -70.0)]
            .iter()
            .map(|&(fingerprint, rssi)| Observation {
                group: fingerprint,
                fingerprint,
                slot: 0,
                fingerprint_rssi: rssi,
                fingerprint_variance: 1.0,
            })
            .collect();
        let seed = power_weighted_centroid(&fingerprints, &observations, 0).unwrap();
        let strongest = fingerprints[0].position().coords;
        assert!((seed - strongest).norm() < 1.0);
        assert!((seed - strongest).norm() > 0.0);
    }
}
