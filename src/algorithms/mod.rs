//! Core positioning algorithms

pub mod covariance;
pub mod matcher;
pub mod path_loss;
pub mod solver;

pub use matcher::{FingerprintMatch, NearestFingerprintMatcher};
pub use path_loss::{LogDistanceExpansion, PathLossModel, TaylorOrder};
pub use solver::{EstimatedSource, PositionSolver, Solution, SolverInput};
