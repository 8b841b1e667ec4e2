//! Reporting of resampling events.
//!
//! The controller never writes domain events to a global logger itself; it
//! reports them to a [`ResamplingObserver`] passed into each resampling call.
//! [`LogObserver`] forwards everything to the `log` facade and
//! [`RecordingObserver`] keeps the events for later inspection.

use crate::config::FailurePolicy;
use crate::controller::IterationSummary;
use crate::errors::WeError;
use log::{debug, warn};
use std::sync::Mutex;

/// A walker left outside the configured weight bounds after threshold enforcement.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdViolation {
    pub bin_index: usize,
    pub weight: f64,
    pub parent_id: i64,
    pub smallest_allowed_weight: f64,
    pub largest_allowed_weight: f64,
}

impl std::fmt::Display for ThresholdViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "walker with weight {:e} (parent {}) in bin {} is outside [{:e}, {:e}]",
            self.weight,
            self.parent_id,
            self.bin_index,
            self.smallest_allowed_weight,
            self.largest_allowed_weight
        )
    }
}

/// Receives events from one resampling call.
///
/// Bins may be processed on several threads, so implementations must be
/// `Send + Sync`. All methods default to doing nothing.
///
/// `bin_resampled` and `threshold_violation` are only called once every bin
/// of the call has been resampled successfully, in bin order.
/// `reweight_failed` is called as the failure happens, so it may precede an
/// error that discards the iteration.
pub trait ResamplingObserver: Send + Sync {
    fn bin_resampled(&self, _bin_index: usize, _subgroups: usize, _walkers: usize) {}

    fn threshold_violation(&self, _violation: &ThresholdViolation) {}

    /// `bin_index` is `None` when reweighting ran over the whole ensemble.
    fn reweight_failed(&self, _bin_index: Option<usize>, _error: &WeError, _policy: FailurePolicy) {}

    fn iteration_complete(&self, _summary: &IterationSummary) {}
}

/// Forwards events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ResamplingObserver for LogObserver {
    fn bin_resampled(&self, bin_index: usize, subgroups: usize, walkers: usize) {
        debug!(
            "bin {}: resampled {} subgroups into {} walkers",
            bin_index, subgroups, walkers
        );
    }

    fn threshold_violation(&self, violation: &ThresholdViolation) {
        warn!(
            "Unable to fulfill threshold conditions: {}. The given threshold range is likely too small.",
            violation
        );
    }

    fn reweight_failed(&self, bin_index: Option<usize>, error: &WeError, policy: FailurePolicy) {
        match bin_index {
            Some(i) => warn!("Reweighting of bin {} failed ({:?}): {}", i, policy, error),
            None => warn!("Ensemble reweighting failed ({:?}): {}", policy, error),
        }
    }

    fn iteration_complete(&self, summary: &IterationSummary) {
        debug!("Total number of subgroups: {}", summary.total_subgroups);
        debug!("Total number of particles: {}", summary.total_particles);
    }
}

/// Event captured by a [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResamplingEvent {
    BinResampled {
        bin_index: usize,
        subgroups: usize,
        walkers: usize,
    },
    ThresholdViolation(ThresholdViolation),
    ReweightFailed {
        bin_index: Option<usize>,
        error: WeError,
        policy: FailurePolicy,
    },
    IterationComplete {
        total_subgroups: usize,
        total_particles: usize,
    },
}

/// Stores every event it receives.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ResamplingEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ResamplingEvent) {
        // A poisoned lock only means another recorder thread panicked; keep recording
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<ResamplingEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn threshold_violations(&self) -> Vec<ThresholdViolation> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ResamplingEvent::ThresholdViolation(v) => Some(v),
                _ => None,
            })
            .collect()
    }
}

impl ResamplingObserver for RecordingObserver {
    fn bin_resampled(&self, bin_index: usize, subgroups: usize, walkers: usize) {
        self.push(ResamplingEvent::BinResampled {
            bin_index,
            subgroups,
            walkers,
        });
    }

    fn threshold_violation(&self, violation: &ThresholdViolation) {
        self.push(ResamplingEvent::ThresholdViolation(violation.clone()));
    }

    fn reweight_failed(&self, bin_index: Option<usize>, error: &WeError, policy: FailurePolicy) {
        self.push(ResamplingEvent::ReweightFailed {
            bin_index,
            error: error.clone(),
            policy,
        });
    }

    fn iteration_complete(&self, summary: &IterationSummary) {
        self.push(ResamplingEvent::IterationComplete {
            total_subgroups: summary.total_subgroups,
            total_particles: summary.total_particles,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.bin_resampled(0, 2, 4);
        observer.threshold_violation(&ThresholdViolation {
            bin_index: 0,
            weight: 0.5,
            parent_id: 3,
            smallest_allowed_weight: 0.0,
            largest_allowed_weight: 0.1,
        });

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            ResamplingEvent::BinResampled { walkers: 4, .. }
        ));
        assert_eq!(observer.threshold_violations().len(), 1);
        assert_eq!(observer.threshold_violations()[0].parent_id, 3);
    }

    #[test]
    fn test_violation_display() {
        let violation = ThresholdViolation {
            bin_index: 2,
            weight: 0.5,
            parent_id: 3,
            smallest_allowed_weight: 1e-3,
            largest_allowed_weight: 0.1,
        };
        assert_eq!(
            violation.to_string(),
            "walker with weight 5e-1 (parent 3) in bin 2 is outside [1e-3, 1e-1]"
        );
    }
}
