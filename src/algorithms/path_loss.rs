//! Log-distance path-loss model
//!
//! Received power follows `Pr = Pt·K / d^n`, with `K = (c / 4πf)²` for
//! free-space propagation. In logarithmic units this becomes
//! `RSSI(d) = Pte − 10·n·log10(d)`, where `Pte` is the equivalent
//! transmitted power (transmitted power plus `10·log10(K)`).
//!
//! Comparing two places that observe the same source removes `Pte`:
//! `RSSI(p) = RSSI(p_i) − (10·n / ln 10)·[ln|p − s| − ln|p_i − s|]`.
//! The fingerprint solver uses a truncated Taylor expansion of the bracket
//! around the fingerprint position `p_i`.

use crate::core::{DEFAULT_PATH_LOSS_EXPONENT, SPEED_OF_LIGHT};
use nalgebra::SVector;
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_10, PI};

/// Number of terms kept when expanding the log-distance relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaylorOrder {
    First,
    Second,
    Third,
}

impl TaylorOrder {
    pub fn terms(&self) -> usize {
        match self {
            TaylorOrder::First => 1,
            TaylorOrder::Second => 2,
            TaylorOrder::Third => 3,
        }
    }

    pub fn from_terms(terms: usize) -> Option<Self> {
        match terms {
            1 => Some(TaylorOrder::First),
            2 => Some(TaylorOrder::Second),
            3 => Some(TaylorOrder::Third),
            _ => None,
        }
    }

    /// Upper bound on the truncation error of the expansion of `ln|r + δ| − ln|r|`
    /// for `ratio = |δ| / |r|`, valid while `ratio < radius <= 1`.
    ///
    /// The series is bounded term by term by `ratio^k / k`, so the tail after the
    /// kept terms is at most `ratio^(m+1) / ((m+1)(1 − ratio))`. The radius tightens
    /// the denominator; beyond it the bound is infinite.
    pub fn truncation_bound(&self, ratio: f64, radius: f64) -> f64 {
        if !(ratio < radius) {
            return f64::INFINITY;
        }
        let next = (self.terms() + 1) as f64;
        ratio.powf(next) / (next * (1.0 - ratio / radius))
    }
}

impl Default for TaylorOrder {
    fn default() -> Self {
        TaylorOrder::Third
    }
}

/// Convert a power in dBm to watts
pub fn dbm_to_watts(dbm: f64) -> f64 {
    10f64.powf((dbm - 30.0) / 10.0)
}

/// Convert a power in watts to dBm
pub fn watts_to_dbm(watts: f64) -> f64 {
    10.0 * watts.log10() + 30.0
}

/// Power-law attenuation with a configurable exponent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossModel {
    /// Path-loss exponent `n`
    pub exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self::free_space()
    }
}

impl PathLossModel {
    pub fn new(exponent: f64) -> Self {
        Self { exponent }
    }

    pub fn free_space() -> Self {
        Self::new(DEFAULT_PATH_LOSS_EXPONENT)
    }

    /// RSSI change (dB) per unit change of `ln(distance)`, i.e. `10·n / ln 10`
    pub fn slope(&self) -> f64 {
        10.0 * self.exponent / LN_10
    }

    /// Derivative of [`slope`](Self::slope) with respect to the exponent
    pub fn slope_derivative() -> f64 {
        10.0 / LN_10
    }

    /// Free-space constant `K = (c / 4πf)²`
    pub fn friis_constant(frequency_hz: f64) -> f64 {
        let k = SPEED_OF_LIGHT / (4.0 * PI * frequency_hz);
        k * k
    }

    /// Equivalent transmitted power `Pt + 10·log10(K)` in dBm
    pub fn equivalent_transmitted_power_dbm(transmitted_power_dbm: f64, frequency_hz: f64) -> f64 {
        transmitted_power_dbm + 10.0 * Self::friis_constant(frequency_hz).log10()
    }

    /// Received power (dBm) at a distance from the source
    pub fn received_power_dbm(&self, equivalent_transmitted_power_dbm: f64, distance: f64) -> f64 {
        equivalent_transmitted_power_dbm - 10.0 * self.exponent * distance.log10()
    }

    /// Distance at which the given RSSI is received
    pub fn distance(&self, equivalent_transmitted_power_dbm: f64, rssi_dbm: f64) -> f64 {
        10f64.powf((equivalent_transmitted_power_dbm - rssi_dbm) / (10.0 * self.exponent))
    }

    /// RSSI at `distance` given the RSSI observed at `reference_distance`
    pub fn rssi_relative(&self, reference_rssi_dbm: f64, reference_distance: f64, distance: f64) -> f64 {
        reference_rssi_dbm - 10.0 * self.exponent * (distance / reference_distance).log10()
    }
}

/// Truncated expansion of `ln|p − s| − ln|p_i − s|` around `p_i`
///
/// With `δ = p − p_i`, `r = p_i − s`, `a = r·δ` and `q = |r|²`:
/// - 1st order: `a/q`
/// - 2nd order: `+ |δ|²/(2q) − a²/q²`
/// - 3rd order: `− a·|δ|²/q² + 4a³/(3q³)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogDistanceExpansion<const D: usize> {
    /// Value of the truncated expansion
    pub value: f64,
    /// Gradient with respect to the offset `δ`
    pub d_offset: SVector<f64, D>,
    /// Gradient with respect to the reference vector `r`
    pub d_reference: SVector<f64, D>,
}

impl<const D: usize> LogDistanceExpansion<D> {
    /// Evaluate the expansion; `None` when the fingerprint sits on the source
    pub fn evaluate(
        offset: &SVector<f64, D>,
        reference: &SVector<f64, D>,
        order: TaylorOrder,
    ) -> Option<Self> {
        let q = reference.norm_squared();
        if !(q > f64::EPSILON) {
            return None;
        }
        let a = reference.dot(offset);
        let dd = offset.norm_squared();
        let q2 = q * q;
        let q3 = q2 * q;

        let mut value = a / q;
        let mut d_offset = reference / q;
        let mut d_reference = offset / q - reference * (2.0 * a / q2);

        if order.terms() >= 2 {
            value += dd / (2.0 * q) - a * a / q2;
            d_offset += offset / q - reference * (2.0 * a / q2);
            d_reference += reference * (-dd / q2 + 4.0 * a * a / q3) - offset * (2.0 * a / q2);
        }

        if order.terms() >= 3 {
            let q4 = q3 * q;
            value += -a * dd / q2 + 4.0 * a * a * a / (3.0 * q3);
            d_offset += reference * (-dd / q2 + 4.0 * a * a / q3) - offset * (2.0 * a / q2);
            d_reference += offset * (-dd / q2 + 4.0 * a * a / q3)
                + reference * (4.0 * a * dd / q3 - 8.0 * a * a * a / q4);
        }

        Some(Self {
            value,
            d_offset,
            d_reference,
        })
    }
}
