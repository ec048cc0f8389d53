//! Overload feedback: turn the work queue's overload signal into local fee
//! adjustments.
use std::sync::Arc;
use tracing::{info, Level};

/// The process's work queue, as seen by the load manager.
pub trait WorkQueue: Send + Sync {
    /// Whether the queue currently cannot keep pace with demand.
    fn is_overloaded(&self) -> bool;

    /// Structured view of the queue, logged when overloaded.
    fn diagnostic_snapshot(&self) -> serde_json::Value;
}

/// Owner of the local admission fee.
///
/// Both operations report whether the fee value actually changed. Step size
/// and hysteresis are entirely up to the implementation.
pub trait FeeTracker: Send + Sync {
    fn raise_local_fee(&self) -> bool;
    fn lower_local_fee(&self) -> bool;
}

/// Receives a notification whenever the local fee changes.
pub trait FeeChangeListener: Send + Sync {
    fn fee_changed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeDirection {
    Raise,
    Lower,
}

/// Result of one feedback step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeStep {
    pub overloaded: bool,
    pub direction: FeeDirection,
    pub changed: bool,
}

/// Bang-bang controller: raise the fee while overloaded, lower it otherwise.
pub struct FeeController {
    work_queue: Arc<dyn WorkQueue>,
    fee_tracker: Arc<dyn FeeTracker>,
    listener: Arc<dyn FeeChangeListener>,
}

impl FeeController {
    pub fn new(
        work_queue: Arc<dyn WorkQueue>,
        fee_tracker: Arc<dyn FeeTracker>,
        listener: Arc<dyn FeeChangeListener>,
    ) -> Self {
        Self {
            work_queue,
            fee_tracker,
            listener,
        }
    }

    /// Query overload once, adjust the fee, and notify on change.
    pub fn step(&self) -> FeeStep {
        let overloaded = self.work_queue.is_overloaded();

        let direction = if overloaded {
            if tracing::enabled!(Level::INFO) {
                let snapshot = self.work_queue.diagnostic_snapshot();
                info!(queue = %snapshot, "work queue overloaded");
            }
            FeeDirection::Raise
        } else {
            FeeDirection::Lower
        };

        let changed = match direction {
            FeeDirection::Raise => self.fee_tracker.raise_local_fee(),
            FeeDirection::Lower => self.fee_tracker.lower_local_fee(),
        };

        if changed {
            self.listener.fee_changed();
        }

        FeeStep {
            overloaded,
            direction,
            changed,
        }
    }
}
