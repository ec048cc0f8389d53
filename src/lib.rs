//! Load manager watchdog for node-style server processes.
//!
//! A single background thread ticks once per second. Each tick advances the
//! process clock, checks whether the rest of the process has stalled, and
//! raises or lowers the local admission fee depending on whether the work
//! queue is overloaded.
pub mod clock;
pub mod config;
pub mod deadlock;
pub mod fee_track;
pub mod feedback;
pub mod job_queue;
pub mod lifecycle;
pub mod load_manager;
pub mod pacer;
pub mod stats;

pub use clock::{ManualUpdates, ProcessClock};
pub use config::LoadMgrConfig;
pub use deadlock::{DeadlockDetector, StallThresholds, StallVerdict};
pub use feedback::{FeeChangeListener, FeeController, FeeTracker, WorkQueue};
pub use lifecycle::{LifecycleState, StopObserver, Stoppable};
pub use load_manager::{Collaborators, LoadManager, LoadManagerError, LoadManagerSettings};
pub use stats::StatsSnapshot;
