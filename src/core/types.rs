//! Core data types for fingerprint positioning

use crate::validation::error::ConfigError;
use nalgebra::{SMatrix, SVector};
use std::collections::HashSet;
use std::sync::Arc;

/// Square covariance matrix matching the position dimension
pub type Covariance<const D: usize> = SMatrix<f64, D, D>;

/// Cartesian position with a fixed number of coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position<const D: usize> {
    pub coords: SVector<f64, D>,
}

/// Planar position
pub type Position2 = Position<2>;
/// Spatial position
pub type Position3 = Position<3>;

impl<const D: usize> Position<D> {
    pub fn new(coords: SVector<f64, D>) -> Self {
        Self { coords }
    }

    /// Build a position from a slice, `None` when the length does not match `D`
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        if values.len() != D {
            return None;
        }
        Some(Self::new(SVector::from_column_slice(values)))
    }

    pub fn origin() -> Self {
        Self::new(SVector::zeros())
    }

    pub fn dimension(&self) -> usize {
        D
    }

    /// Euclidean distance to another position
    pub fn distance_to(&self, other: &Position<D>) -> f64 {
        (self.coords - other.coords).norm()
    }

    pub fn is_finite(&self) -> bool {
        self.coords.iter().all(|c| c.is_finite())
    }

    /// Centroid of a set of positions, `None` for an empty set
    pub fn centroid<'a, I>(positions: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Position<D>>,
    {
        let mut sum = SVector::<f64, D>::zeros();
        let mut count = 0usize;
        for position in positions {
            sum += position.coords;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(Self::new(sum / count as f64))
    }
}

impl Position<2> {
    pub fn xy(x: f64, y: f64) -> Self {
        Self::new(SVector::<f64, 2>::new(x, y))
    }
}

impl Position<3> {
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self::new(SVector::<f64, 3>::new(x, y, z))
    }
}

/// Known placement and propagation parameters of a radio source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation<const D: usize> {
    /// Source position
    pub position: Position<D>,
    /// Uncertainty of the source position
    pub position_covariance: Option<Covariance<D>>,
    /// Transmitted power (dBm)
    pub transmitted_power_dbm: Option<f64>,
    /// Source-specific path-loss exponent
    pub path_loss_exponent: Option<f64>,
    /// Standard deviation of the path-loss exponent
    pub path_loss_exponent_std: Option<f64>,
}

impl<const D: usize> SourceLocation<D> {
    pub fn new(position: Position<D>) -> Self {
        Self {
            position,
            position_covariance: None,
            transmitted_power_dbm: None,
            path_loss_exponent: None,
            path_loss_exponent_std: None,
        }
    }

    pub fn with_covariance(mut self, covariance: Covariance<D>) -> Self {
        self.position_covariance = Some(covariance);
        self
    }

    pub fn with_transmitted_power(mut self, power_dbm: f64) -> Self {
        self.transmitted_power_dbm = Some(power_dbm);
        self
    }

    pub fn with_path_loss_exponent(mut self, exponent: f64, std_dev: Option<f64>) -> Self {
        self.path_loss_exponent = Some(exponent);
        self.path_loss_exponent_std = std_dev;
        self
    }
}

/// Radio transmitter identified by a stable id
///
/// Sources are immutable once built and shared by reference between the
/// readings that observe them.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioSource<const D: usize> {
    id: String,
    frequency_hz: f64,
    location: Option<SourceLocation<D>>,
}

impl<const D: usize> RadioSource<D> {
    /// Source whose position is unknown
    pub fn new(id: impl Into<String>, frequency_hz: f64) -> Self {
        Self {
            id: id.into(),
            frequency_hz,
            location: None,
        }
    }

    /// Source with a known location
    pub fn located(id: impl Into<String>, frequency_hz: f64, location: SourceLocation<D>) -> Self {
        Self {
            id: id.into(),
            frequency_hz,
            location: Some(location),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn location(&self) -> Option<&SourceLocation<D>> {
        self.location.as_ref()
    }

    pub fn is_located(&self) -> bool {
        self.location.is_some()
    }

    pub fn position(&self) -> Option<&Position<D>> {
        self.location.as_ref().map(|l| &l.position)
    }

    pub fn position_covariance(&self) -> Option<&Covariance<D>> {
        self.location.as_ref().and_then(|l| l.position_covariance.as_ref())
    }

    pub fn path_loss_exponent(&self) -> Option<f64> {
        self.location.as_ref().and_then(|l| l.path_loss_exponent)
    }

    pub fn path_loss_exponent_std(&self) -> Option<f64> {
        self.location.as_ref().and_then(|l| l.path_loss_exponent_std)
    }

    /// Copy of this source located at an estimated position
    ///
    /// Propagation parameters of an existing location are kept.
    pub fn with_estimated_position(
        &self,
        position: Position<D>,
        covariance: Option<Covariance<D>>,
    ) -> Self {
        let mut location = self
            .location
            .clone()
            .unwrap_or_else(|| SourceLocation::new(position));
        location.position = position;
        location.position_covariance = covariance;
        Self {
            id: self.id.clone(),
            frequency_hz: self.frequency_hz,
            location: Some(location),
        }
    }
}

/// RSSI measured from one radio source
#[derive(Debug, Clone, PartialEq)]
pub struct Reading<const D: usize> {
    pub source: Arc<RadioSource<D>>,
    /// Received signal strength (dBm)
    pub rssi_dbm: f64,
    /// Standard deviation of the RSSI (dB)
    pub rssi_std: Option<f64>,
}

impl<const D: usize> Reading<D> {
    pub fn new(source: Arc<RadioSource<D>>, rssi_dbm: f64) -> Self {
        Self {
            source,
            rssi_dbm,
            rssi_std: None,
        }
    }

    pub fn with_std(source: Arc<RadioSource<D>>, rssi_dbm: f64, rssi_std: f64) -> Self {
        Self {
            source,
            rssi_dbm,
            rssi_std: Some(rssi_std),
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }
}

/// Readings captured at a single place, at most one per source
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint<const D: usize> {
    readings: Vec<Reading<D>>,
}

impl<const D: usize> Fingerprint<D> {
    pub fn new(readings: Vec<Reading<D>>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for reading in &readings {
            if !seen.insert(reading.source_id()) {
                return Err(ConfigError::DuplicateReading {
                    source_id: reading.source_id().to_string(),
                });
            }
            if !reading.rssi_dbm.is_finite() {
                return Err(ConfigError::InvalidParameter {
                    parameter: "rssi_dbm".to_string(),
                    value: reading.rssi_dbm.to_string(),
                    reason: format!("reading for source {} must be finite", reading.source_id()),
                });
            }
            if let Some(std_dev) = reading.rssi_std {
                if !(std_dev.is_finite() && std_dev >= 0.0) {
                    return Err(ConfigError::InvalidParameter {
                        parameter: "rssi_std".to_string(),
                        value: std_dev.to_string(),
                        reason: "standard deviation must be finite and non-negative".to_string(),
                    });
                }
            }
        }
        Ok(Self { readings })
    }

    pub fn readings(&self) -> &[Reading<D>] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Reading of the given source, if present
    pub fn reading_for(&self, source_id: &str) -> Option<&Reading<D>> {
        self.readings.iter().find(|r| r.source_id() == source_id)
    }

    /// Mean RSSI over all readings
    pub fn mean_rssi(&self) -> Option<f64> {
        if self.readings.is_empty() {
            return None;
        }
        Some(self.readings.iter().map(|r| r.rssi_dbm).sum::<f64>() / self.readings.len() as f64)
    }
}

/// Fingerprint recorded at a known position
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedFingerprint<const D: usize> {
    fingerprint: Fingerprint<D>,
    position: Position<D>,
    position_covariance: Option<Covariance<D>>,
}

impl<const D: usize> LocatedFingerprint<D> {
    pub fn new(readings: Vec<Reading<D>>, position: Position<D>) -> Result<Self, ConfigError> {
        if readings.is_empty() {
            return Err(ConfigError::EmptyFingerprint);
        }
        if !position.is_finite() {
            return Err(ConfigError::InvalidParameter {
                parameter: "position".to_string(),
                value: format!("{:?}", position.coords.as_slice()),
                reason: "fingerprint position must be finite".to_string(),
            });
        }
        Ok(Self {
            fingerprint: Fingerprint::new(readings)?,
            position,
            position_covariance: None,
        })
    }

    pub fn with_covariance(mut self, covariance: Covariance<D>) -> Self {
        self.position_covariance = Some(covariance);
        self
    }

    pub fn fingerprint(&self) -> &Fingerprint<D> {
        &self.fingerprint
    }

    pub fn readings(&self) -> &[Reading<D>] {
        self.fingerprint.readings()
    }

    pub fn position(&self) -> &Position<D> {
        &self.position
    }

    pub fn position_covariance(&self) -> Option<&Covariance<D>> {
        self.position_covariance.as_ref()
    }
}
