//! First-order covariance propagation
//!
//! A weighted least-squares estimate `x̂` of residuals `r(x, m)` responds to
//! small input changes `dm` as `dx = −(AᵀWA)⁻¹·AᵀW·B·dm`, with `A = ∂r/∂x`
//! and `B = ∂r/∂m`. Propagating an input covariance `Cin` through that
//! sensitivity `G` gives `Cov = G·Cin·Gᵀ`.

use crate::core::Covariance;
use crate::validation::error::CovarianceError;
use nalgebra::{DMatrix, SMatrix};

/// Smallest accepted ratio between the extreme eigenvalues of an information matrix
const MIN_RECIPROCAL_CONDITION: f64 = 1e-12;

/// Relative tolerance on negative eigenvalues of a propagated covariance
const PSD_TOLERANCE: f64 = 1e-9;

/// Block-diagonal input covariance assembled column by column
#[derive(Debug, Clone, Default)]
pub struct InputCovariance {
    blocks: Vec<DMatrix<f64>>,
    dimension: usize,
}

impl InputCovariance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scalar variance, returning its column
    pub fn push_variance(&mut self, variance: f64) -> usize {
        self.push_block(DMatrix::from_element(1, 1, variance))
    }

    /// Append a square covariance block, returning its first column
    pub fn push_block(&mut self, block: DMatrix<f64>) -> usize {
        let column = self.dimension;
        self.dimension += block.nrows();
        self.blocks.push(block);
        column
    }

    /// Append a position covariance, returning its first column
    pub fn push_position<const D: usize>(&mut self, covariance: &Covariance<D>) -> usize {
        self.push_block(DMatrix::from_fn(D, D, |i, j| covariance[(i, j)]))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.dimension == 0
    }

    /// Dense block-diagonal matrix
    pub fn to_matrix(&self) -> DMatrix<f64> {
        let mut matrix = DMatrix::zeros(self.dimension, self.dimension);
        let mut offset = 0;
        for block in &self.blocks {
            let n = block.nrows();
            matrix.view_mut((offset, offset), (n, n)).copy_from(block);
            offset += n;
        }
        matrix
    }
}

/// Invert a symmetric information matrix `AᵀWA`
///
/// Rank-deficient matrices are rejected rather than pseudo-inverted.
pub fn invert_information(information: &DMatrix<f64>) -> Result<DMatrix<f64>, CovarianceError> {
    let eigen = information.clone().symmetric_eigen();
    let max = eigen.eigenvalues.iter().cloned().fold(0.0_f64, f64::max);
    let min = eigen.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);

    if !(max > 0.0) || !(min > max * MIN_RECIPROCAL_CONDITION) {
        let condition = if min > 0.0 { max / min } else { f64::INFINITY };
        return Err(CovarianceError::Singular { condition });
    }

    let inverse_values = eigen.eigenvalues.map(|v| 1.0 / v);
    let vectors = &eigen.eigenvectors;
    Ok(vectors * DMatrix::from_diagonal(&inverse_values) * vectors.transpose())
}

/// Sensitivity `G = (AᵀA)⁻¹·AᵀB` of a least-squares estimate to its inputs
///
/// Both Jacobians must already be scaled by the square-root weights.
pub fn least_squares_sensitivity(
    weighted_jacobian: &DMatrix<f64>,
    weighted_input_jacobian: &DMatrix<f64>,
) -> Result<DMatrix<f64>, CovarianceError> {
    let at = weighted_jacobian.transpose();
    let information_inverse = invert_information(&(&at * weighted_jacobian))?;
    Ok(information_inverse * at * weighted_input_jacobian)
}

/// `G·Cin·Gᵀ`, symmetrized
pub fn propagate(sensitivity: &DMatrix<f64>, input_covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let covariance = sensitivity * input_covariance * sensitivity.transpose();
    (&covariance + covariance.transpose()) * 0.5
}

/// Reject covariances with eigenvalues below the numerical tolerance
pub fn check_positive_semidefinite(covariance: &DMatrix<f64>) -> Result<(), CovarianceError> {
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(CovarianceError::NotPositiveSemidefinite {
            min_eigenvalue: f64::NAN,
        });
    }
    if covariance.is_empty() {
        return Ok(());
    }
    let eigenvalues = covariance.clone().symmetric_eigenvalues();
    let min = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_abs = eigenvalues.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));

    if min < -PSD_TOLERANCE * max_abs.max(f64::MIN_POSITIVE) {
        return Err(CovarianceError::NotPositiveSemidefinite { min_eigenvalue: min });
    }
    Ok(())
}

/// Extract a `D×D` diagonal block starting at `offset`
pub fn diagonal_block<const D: usize>(covariance: &DMatrix<f64>, offset: usize) -> SMatrix<f64, D, D> {
    SMatrix::<f64, D, D>::from_fn(|i, j| covariance[(offset + i, offset + j)])
}
