//! Core types and constants for fingerprint positioning

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
