//! Estimate lifecycle notifications
//!
//! Listeners are invoked synchronously on the thread calling `estimate()`:
//! `on_estimate_start` before any computation and `on_estimate_end` after
//! the result is published, on success and failure alike. The estimator is
//! locked during both calls, so any setter or nested `estimate()` issued
//! from a listener is rejected with `EstimatorError::Locked`.

use crate::api::estimator::FingerprintPositionEstimator;

/// Observer of an estimator's estimate calls
pub trait EstimatorListener<const D: usize>: Send + Sync {
    fn on_estimate_start(&self, estimator: &FingerprintPositionEstimator<D>);

    fn on_estimate_end(&self, estimator: &FingerprintPositionEstimator<D>);
}

/// Callback function type for estimate notifications
pub type EstimatorCallback<const D: usize> = Box<dyn Fn(&FingerprintPositionEstimator<D>) + Send + Sync>;

/// Listener built from closures
#[derive(Default)]
pub struct CallbackListener<const D: usize> {
    on_start: Option<EstimatorCallback<D>>,
    on_end: Option<EstimatorCallback<D>>,
}

impl<const D: usize> CallbackListener<D> {
    pub fn new() -> Self {
        Self {
            on_start: None,
            on_end: None,
        }
    }

    pub fn on_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FingerprintPositionEstimator<D>) + Send + Sync + 'static,
    {
        self.on_start = Some(Box::new(callback));
        self
    }

    pub fn on_end<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FingerprintPositionEstimator<D>) + Send + Sync + 'static,
    {
        self.on_end = Some(Box::new(callback));
        self
    }
}

impl<const D: usize> EstimatorListener<D> for CallbackListener<D> {
    fn on_estimate_start(&self, estimator: &FingerprintPositionEstimator<D>) {
        if let Some(callback) = &self.on_start {
            callback(estimator);
        }
    }

    fn on_estimate_end(&self, estimator: &FingerprintPositionEstimator<D>) {
        if let Some(callback) = &self.on_end {
            callback(estimator);
        }
    }
}
