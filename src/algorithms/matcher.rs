//! Nearest-fingerprint matching in RSSI space

use crate::core::{Fingerprint, LocatedFingerprint};
use crate::validation::error::{ConfigError, EstimationError};
use crate::validation::data::validate_nearest_bounds;
use std::cmp::Ordering;
use tracing::debug;

/// Calibration fingerprint selected for a query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintMatch {
    /// Index into the calibration set
    pub index: usize,
    /// Sum of squared RSSI differences over shared sources
    pub distance: f64,
    /// Number of sources shared with the query
    pub shared_sources: usize,
}

/// Ranks calibration fingerprints by RSSI similarity to a query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestFingerprintMatcher {
    /// Minimum number of matches, fewer is an estimation failure
    pub min_matches: usize,
    /// Maximum number of matches, all candidates when `None`
    pub max_matches: Option<usize>,
    /// Subtract each fingerprint's mean RSSI before differencing
    pub remove_mean: bool,
}

impl Default for NearestFingerprintMatcher {
    fn default() -> Self {
        Self {
            min_matches: 1,
            max_matches: None,
            remove_mean: false,
        }
    }
}

impl NearestFingerprintMatcher {
    pub fn new(min_matches: usize, max_matches: Option<usize>, remove_mean: bool) -> Result<Self, ConfigError> {
        validate_nearest_bounds(min_matches, max_matches)?;
        Ok(Self {
            min_matches,
            max_matches,
            remove_mean,
        })
    }

    /// Squared RSSI distance between a candidate and the query
    ///
    /// Returns `None` when the two share no source.
    pub fn distance<const D: usize>(
        &self,
        candidate: &Fingerprint<D>,
        query: &Fingerprint<D>,
    ) -> Option<(f64, usize)> {
        let (candidate_mean, query_mean) = if self.remove_mean {
            (candidate.mean_rssi()?, query.mean_rssi()?)
        } else {
            (0.0, 0.0)
        };

        let mut sum = 0.0;
        let mut shared = 0usize;
        for reading in candidate.readings() {
            if let Some(query_reading) = query.reading_for(reading.source_id()) {
                let diff = (reading.rssi_dbm - candidate_mean) - (query_reading.rssi_dbm - query_mean);
                sum += diff * diff;
                shared += 1;
            }
        }

        if shared == 0 {
            None
        } else {
            Some((sum, shared))
        }
    }

    /// Closest-first subset of the calibration set
    pub fn find_nearest<const D: usize>(
        &self,
        fingerprints: &[LocatedFingerprint<D>],
        query: &Fingerprint<D>,
    ) -> Result<Vec<FingerprintMatch>, EstimationError> {
        let mut matches: Vec<FingerprintMatch> = fingerprints
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| {
                self.distance(candidate.fingerprint(), query)
                    .map(|(distance, shared_sources)| FingerprintMatch {
                        index,
                        distance,
                        shared_sources,
                    })
            })
            .collect();

        if matches.len() < self.min_matches {
            return Err(EstimationError::InsufficientMatches {
                available: matches.len(),
                required: self.min_matches,
            });
        }

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });

        if let Some(max) = self.max_matches {
            matches.truncate(max);
        }

        debug!(
            candidates = fingerprints.len(),
            selected = matches.len(),
            remove_mean = self.remove_mean,
            best_distance = ?matches.first().map(|m| m.distance),
            "Selected nearest fingerprints"
        );

        Ok(matches)
    }
}
