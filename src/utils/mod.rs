//! Estimator configuration

pub mod config;

pub use config::{EstimatorConfig, PropagationFlags, UnderdeterminedSourcePolicy};
