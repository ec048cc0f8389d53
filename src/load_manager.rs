//! The load manager: a once-per-second watchdog thread that advances the
//! process clock, checks for deadlock, and steers the local fee from the work
//! queue's overload signal.
//!
//! Concurrency contract: the deadlock lock covers only the clock advance and
//! the stall check. The fee step runs outside it, so a liveness check-in from
//! another thread never waits on the fee tracker, and a check-in that lands
//! after the stall check of one tick is first seen by the next tick.
use crate::clock::{ClockError, ManualUpdates, ProcessClock};
use crate::deadlock::{fatal_stall, DeadlockDetector, StallThresholds, StallVerdict};
use crate::feedback::{FeeChangeListener, FeeController, FeeStep, FeeTracker, WorkQueue};
use crate::lifecycle::{LifecycleState, StopObserver, StopToken, Stoppable};
use crate::pacer::{MonotonicTime, Pace, Pacer, TimeSource};
use crate::stats::{StatsSnapshot, WatchdogStats};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

const THREAD_NAME: &str = "loadmgr";

/// Tunables for the watchdog loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadManagerSettings {
    /// Nominal tick period. Each tick counts as one second of process time.
    pub period: Duration,
    pub thresholds: StallThresholds,
}

impl LoadManagerSettings {
    /// Reject settings the watchdog loop cannot run with.
    pub fn validate(&self) -> Result<(), LoadManagerError> {
        let t = &self.thresholds;
        if self.period.is_zero() {
            return Err(LoadManagerError::InvalidSettings(
                "tick period must be non-zero".into(),
            ));
        }
        if t.report_interval_secs <= 0 {
            return Err(LoadManagerError::InvalidSettings(format!(
                "report_interval_secs must be > 0, got {}",
                t.report_interval_secs
            )));
        }
        if t.fatal_stall_secs <= t.report_interval_secs {
            return Err(LoadManagerError::InvalidSettings(format!(
                "fatal_stall_secs ({}) must exceed report_interval_secs ({})",
                t.fatal_stall_secs, t.report_interval_secs
            )));
        }
        Ok(())
    }
}

impl Default for LoadManagerSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            thresholds: StallThresholds::default(),
        }
    }
}

/// External services the load manager drives. None of them are owned.
#[derive(Clone)]
pub struct Collaborators {
    pub work_queue: Arc<dyn WorkQueue>,
    pub fee_tracker: Arc<dyn FeeTracker>,
    pub listener: Arc<dyn FeeChangeListener>,
}

/// Errors from constructing or starting a [`LoadManager`].
#[derive(Debug)]
pub enum LoadManagerError {
    /// The process clock could not be switched to manual updates.
    Clock { source: ClockError },
    /// `on_start` was called outside the `Created`/`Prepared` states.
    AlreadyStarted { state: LifecycleState },
    /// The watchdog thread could not be spawned.
    Spawn { source: std::io::Error },
    /// Period or stall thresholds are out of range.
    InvalidSettings(String),
}

impl std::fmt::Display for LoadManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadManagerError::Clock { source } => {
                write!(f, "failed to take over process clock: {}", source)
            }
            LoadManagerError::AlreadyStarted { state } => {
                write!(f, "load manager cannot start from state {:?}", state)
            }
            LoadManagerError::Spawn { source } => {
                write!(f, "failed to spawn load manager thread: {}", source)
            }
            LoadManagerError::InvalidSettings(msg) => {
                write!(f, "invalid load manager settings: {}", msg)
            }
        }
    }
}

impl std::error::Error for LoadManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadManagerError::Clock { source } => Some(source),
            LoadManagerError::AlreadyStarted { .. } => None,
            LoadManagerError::Spawn { source } => Some(source),
            LoadManagerError::InvalidSettings(_) => None,
        }
    }
}

/// What a single tick did. Used by the loop and by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub verdict: StallVerdict,
    /// `None` when a collaborator panicked during the fee step.
    pub fee: Option<FeeStep>,
}

/// State shared between the owning handle and the watchdog thread.
struct Shared {
    detector: Arc<DeadlockDetector>,
    controller: FeeController,
    stats: WatchdogStats,
    state: Mutex<LifecycleState>,
    stop: StopToken,
    observer: Arc<dyn StopObserver>,
    stopped_signalled: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire the stopped signal at most once.
    fn signal_stopped(&self) {
        *self.state() = LifecycleState::Stopped;
        if !self.stopped_signalled.swap(true, Ordering::AcqRel) {
            debug!("load manager stopped");
            self.observer.stopped(THREAD_NAME);
        }
    }

    /// Steps 2 and 3 of the loop: clock and deadlock check under the
    /// detector's lock, then the fee step outside it.
    fn tick(&self, manual: &ManualUpdates) -> TickReport {
        self.stats.record_tick();

        let verdict = self.detector.tick(manual);
        match verdict {
            StallVerdict::Healthy => {}
            StallVerdict::Stalled { report, .. } => {
                if report {
                    self.stats.record_stall_warning();
                }
            }
            StallVerdict::Fatal { secs } => fatal_stall(secs),
        }

        // Collaborator panics are contained to this tick.
        let fee = match panic::catch_unwind(AssertUnwindSafe(|| self.controller.step())) {
            Ok(step) => {
                self.stats.record_fee_step(&step);
                Some(step)
            }
            Err(_) => {
                self.stats.record_collaborator_failure();
                error!("fee adjustment panicked; skipping this tick");
                None
            }
        };

        TickReport { verdict, fee }
    }

    fn run<T: TimeSource>(&self, manual: &ManualUpdates, time: &T, period: Duration) {
        // Fires the stopped signal on every exit path, unwinding included.
        let _stopped = StoppedOnExit(self);
        let mut pacer = Pacer::new(period, time.now());

        while !self.stop.is_requested() {
            self.tick(manual);

            match pacer.next(time.now()) {
                Pace::Sleep(remaining) => time.sleep(remaining, &self.stop),
                Pace::Resync => {
                    self.stats.record_time_jump();
                    warn!("time jump");
                }
            }
        }
    }
}

struct StoppedOnExit<'a>(&'a Shared);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("load manager thread unwinding");
        }
        self.0.signal_stopped();
    }
}

/// Background watchdog coordinating overload throttling and deadlock
/// detection.
///
/// The process clock is held in manual-update mode from construction until
/// the manager is dropped. Dropping joins the watchdog thread before the
/// clock is released.
pub struct LoadManager<T: TimeSource = MonotonicTime> {
    shared: Arc<Shared>,
    manual: Option<Arc<ManualUpdates>>,
    time: Arc<T>,
    period: Duration,
    thread: Option<JoinHandle<()>>,
}

impl LoadManager<MonotonicTime> {
    pub fn new(
        clock: Arc<ProcessClock>,
        collaborators: Collaborators,
        observer: Arc<dyn StopObserver>,
        settings: LoadManagerSettings,
    ) -> Result<Self, LoadManagerError> {
        Self::with_time_source(clock, collaborators, observer, settings, MonotonicTime)
    }
}

impl<T: TimeSource> LoadManager<T> {
    pub fn with_time_source(
        clock: Arc<ProcessClock>,
        collaborators: Collaborators,
        observer: Arc<dyn StopObserver>,
        settings: LoadManagerSettings,
        time: T,
    ) -> Result<Self, LoadManagerError> {
        settings.validate()?;
        let manual = clock
            .begin_manual_updates()
            .map_err(|source| LoadManagerError::Clock { source })?;

        let shared = Shared {
            detector: Arc::new(DeadlockDetector::new(clock, settings.thresholds)),
            controller: FeeController::new(
                collaborators.work_queue,
                collaborators.fee_tracker,
                collaborators.listener,
            ),
            stats: WatchdogStats::default(),
            state: Mutex::new(LifecycleState::Created),
            stop: StopToken::new(),
            observer,
            stopped_signalled: AtomicBool::new(false),
        };

        Ok(Self {
            shared: Arc::new(shared),
            manual: Some(Arc::new(manual)),
            time: Arc::new(time),
            period: settings.period,
            thread: None,
        })
    }

    /// Liveness check-in; see [`DeadlockDetector::reset`].
    pub fn reset_deadlock_detector(&self) {
        self.shared.detector.reset();
    }

    /// Arm deadlock detection. Call once startup has completed.
    pub fn activate_deadlock_detector(&self) {
        self.shared.detector.activate();
    }

    /// Handle for other threads that need to check in or arm the detector.
    pub fn deadlock_detector(&self) -> Arc<DeadlockDetector> {
        Arc::clone(&self.shared.detector)
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn is_thread_running(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Running | LifecycleState::StopRequested
        ) && self.thread.is_some()
    }

    fn spawn(&mut self) -> Result<(), LoadManagerError> {
        let manual = match &self.manual {
            Some(manual) => Arc::clone(manual),
            None => {
                return Err(LoadManagerError::AlreadyStarted {
                    state: self.state(),
                })
            }
        };
        let shared = Arc::clone(&self.shared);
        let time = Arc::clone(&self.time);
        let period = self.period;

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || shared.run(&manual, time.as_ref(), period))
            .map_err(|source| LoadManagerError::Spawn { source })?;

        self.thread = Some(handle);
        Ok(())
    }
}

impl<T: TimeSource> Stoppable for LoadManager<T> {
    type Error = LoadManagerError;

    fn name(&self) -> &str {
        THREAD_NAME
    }

    fn on_prepare(&mut self) -> Result<(), LoadManagerError> {
        let mut state = self.shared.state();
        let current = *state;
        match current {
            LifecycleState::Created => {
                *state = LifecycleState::Prepared;
                Ok(())
            }
            LifecycleState::Prepared => Ok(()),
            other => Err(LoadManagerError::AlreadyStarted { state: other }),
        }
    }

    fn on_start(&mut self) -> Result<(), LoadManagerError> {
        self.on_prepare()?;
        {
            let mut state = self.shared.state();
            if *state != LifecycleState::Prepared {
                return Err(LoadManagerError::AlreadyStarted { state: *state });
            }
            *state = LifecycleState::Running;
        }

        debug!(period_ms = self.period.as_millis() as u64, "starting load manager");
        self.shared.stats.mark_started();
        if let Err(e) = self.spawn() {
            *self.shared.state() = LifecycleState::Prepared;
            return Err(e);
        }
        Ok(())
    }

    fn on_stop(&self) {
        if self.is_thread_running() {
            let mut state = self.shared.state();
            if *state == LifecycleState::Running {
                debug!("stopping load manager");
                *state = LifecycleState::StopRequested;
            }
            drop(state);
            self.shared.stop.request();
        } else if self.state() != LifecycleState::StopRequested {
            self.shared.signal_stopped();
        }
    }
}

impl<T: TimeSource> Drop for LoadManager<T> {
    fn drop(&mut self) {
        self.shared.stop.request();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("load manager thread panicked");
            }
        }
        // Release manual clock mode only once the thread can no longer tick.
        self.manual.take();
    }
}
