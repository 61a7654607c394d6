//! Early-stopping conditions.
//!
//! Each condition is an independent predicate. The training loop asks every condition of a
//! kind in order and stops on the first one that fires.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    MaxEpochs { epochs: usize },
    EpochTimeExceeded { elapsed: Duration, limit: Duration },
    TargetScoreReached { score: f64, target: f64 },
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::MaxEpochs { epochs } => {
                write!(f, "reached the maximum of {epochs} epochs")
            }
            TerminationReason::EpochTimeExceeded { elapsed, limit } => write!(
                f,
                "epoch ran for {:.1}s, over the {:.1}s limit",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            ),
            TerminationReason::TargetScoreReached { score, target } => {
                write!(f, "score {score:.4} reached target {target:.4}")
            }
            TerminationReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Checked once per evaluated epoch.
pub trait EpochTerminationCondition: Send + Sync {
    fn terminate(&self, epochs_completed: usize, score: f64) -> Option<TerminationReason>;
}

/// Checked after every mini-batch.
pub trait IterationTerminationCondition: Send + Sync {
    fn terminate(&self, epoch_elapsed: Duration) -> Option<TerminationReason>;
}

pub struct MaxEpochs(pub usize);

impl EpochTerminationCondition for MaxEpochs {
    fn terminate(&self, epochs_completed: usize, _score: f64) -> Option<TerminationReason> {
        (epochs_completed >= self.0).then_some(TerminationReason::MaxEpochs { epochs: self.0 })
    }
}

pub struct TargetScore(pub f64);

impl EpochTerminationCondition for TargetScore {
    fn terminate(&self, _epochs_completed: usize, score: f64) -> Option<TerminationReason> {
        (score <= self.0).then_some(TerminationReason::TargetScoreReached {
            score,
            target: self.0,
        })
    }
}

/// Cooperative stop: another thread sets the flag, the loop notices between epochs.
#[derive(Clone, Default)]
pub struct Cancelled(pub Arc<AtomicBool>);

impl Cancelled {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EpochTerminationCondition for Cancelled {
    fn terminate(&self, _epochs_completed: usize, _score: f64) -> Option<TerminationReason> {
        self.0
            .load(Ordering::SeqCst)
            .then_some(TerminationReason::Cancelled)
    }
}

pub struct MaxEpochTime(pub Duration);

impl IterationTerminationCondition for MaxEpochTime {
    fn terminate(&self, epoch_elapsed: Duration) -> Option<TerminationReason> {
        (epoch_elapsed > self.0).then_some(TerminationReason::EpochTimeExceeded {
            elapsed: epoch_elapsed,
            limit: self.0,
        })
    }
}

pub fn first_epoch_termination(
    conditions: &[Box<dyn EpochTerminationCondition>],
    epochs_completed: usize,
    score: f64,
) -> Option<TerminationReason> {
    conditions
        .iter()
        .find_map(|c| c.terminate(epochs_completed, score))
}

pub fn first_iteration_termination(
    conditions: &[Box<dyn IterationTerminationCondition>],
    epoch_elapsed: Duration,
) -> Option<TerminationReason> {
    conditions.iter().find_map(|c| c.terminate(epoch_elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_epochs_fires_at_the_ceiling() {
        let c = MaxEpochs(3);
        assert_eq!(c.terminate(2, 0.5), None);
        assert_eq!(
            c.terminate(3, 0.5),
            Some(TerminationReason::MaxEpochs { epochs: 3 })
        );
    }

    #[test]
    fn epoch_time_fires_only_when_exceeded() {
        let c = MaxEpochTime(Duration::from_secs(60));
        assert_eq!(c.terminate(Duration::from_secs(60)), None);
        assert!(matches!(
            c.terminate(Duration::from_secs(61)),
            Some(TerminationReason::EpochTimeExceeded { .. })
        ));
    }

    #[test]
    fn first_true_wins_in_declaration_order() {
        let cancel = Cancelled::default();
        let conditions: Vec<Box<dyn EpochTerminationCondition>> = vec![
            Box::new(MaxEpochs(10)),
            Box::new(TargetScore(0.1)),
            Box::new(cancel.clone()),
        ];
        assert_eq!(first_epoch_termination(&conditions, 1, 0.5), None);

        cancel.cancel();
        assert_eq!(
            first_epoch_termination(&conditions, 1, 0.5),
            Some(TerminationReason::Cancelled)
        );
        assert!(matches!(
            first_epoch_termination(&conditions, 1, 0.05),
            Some(TerminationReason::TargetScoreReached { .. })
        ));
        assert_eq!(
            first_epoch_termination(&conditions, 10, 0.05),
            Some(TerminationReason::MaxEpochs { epochs: 10 })
        );
    }
}
