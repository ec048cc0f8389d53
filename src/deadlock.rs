//! Deadlock detection: measure how long it has been since the rest of the
//! process last checked in, and escalate when that stall grows too long.
use crate::clock::{ManualUpdates, ProcessClock};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

/// Stall thresholds, in seconds of process clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallThresholds {
    /// Stalls are reported once per this many seconds, starting at this value.
    pub report_interval_secs: i64,
    /// A stall this long means deadlock resolution itself has failed.
    pub fatal_stall_secs: i64,
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self {
            report_interval_secs: 10,
            fatal_stall_secs: 500,
        }
    }
}

/// Outcome of a single per-tick stall check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// Detector unarmed, or stall below the reporting interval.
    Healthy,
    /// Armed and stalled; `report` is set on ticks that logged a warning.
    Stalled { secs: i64, report: bool },
    /// Armed and stalled past the fatal ceiling.
    Fatal { secs: i64 },
}

#[derive(Debug)]
struct DetectorState {
    armed: bool,
    baseline: i64,
}

/// Tracks the liveness baseline and armed flag under a single lock.
///
/// The same lock covers the watchdog's clock advance, so a stall is always
/// computed from an `(elapsed, baseline)` pair that no other thread can tear.
#[derive(Debug)]
pub struct DeadlockDetector {
    clock: Arc<ProcessClock>,
    thresholds: StallThresholds,
    state: Mutex<DetectorState>,
}

impl DeadlockDetector {
    /// Create an unarmed detector whose baseline is the clock's current reading.
    pub fn new(clock: Arc<ProcessClock>, thresholds: StallThresholds) -> Self {
        let baseline = clock.elapsed_seconds();
        Self {
            clock,
            thresholds,
            state: Mutex::new(DetectorState {
                armed: false,
                baseline,
            }),
        }
    }

    /// Liveness check-in. Any thread may call this whenever it completes a
    /// unit of work.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.baseline = self.clock.elapsed_seconds();
    }

    /// Arm the detector. There is no way to disarm it again.
    pub fn activate(&self) {
        let mut state = self.lock();
        if !state.armed {
            state.armed = true;
            tracing::debug!("deadlock detector armed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    pub fn thresholds(&self) -> StallThresholds {
        self.thresholds
    }

    /// Seconds since the last check-in, as of right now.
    pub fn current_stall(&self) -> i64 {
        let state = self.lock();
        self.clock.elapsed_seconds() - state.baseline
    }

    /// Advance the clock one second and judge the resulting stall.
    ///
    /// Logs one warning on every tick whose stall is a multiple of the
    /// reporting interval. The caller owns the fatal path.
    pub fn tick(&self, manual: &ManualUpdates) -> StallVerdict {
        debug_assert!(Arc::ptr_eq(manual.clock(), &self.clock));

        let state = self.lock();
        manual.increment_elapsed_time();
        let stall = manual.elapsed_seconds() - state.baseline;
        let verdict = self.judge(state.armed, stall);

        if let StallVerdict::Stalled { secs, report: true } = verdict {
            warn!(stall_secs = secs, "server stalled for {secs} seconds");
        }
        verdict
    }

    fn judge(&self, armed: bool, stall: i64) -> StallVerdict {
        let interval = self.thresholds.report_interval_secs;
        if !armed || stall < interval {
            return StallVerdict::Healthy;
        }
        if stall >= self.thresholds.fatal_stall_secs {
            return StallVerdict::Fatal { secs: stall };
        }
        StallVerdict::Stalled {
            secs: stall,
            report: stall % interval == 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Terminate the process after an unrecoverable stall.
pub fn fatal_stall(secs: i64) -> ! {
    error!(
        stall_secs = secs,
        "server stalled for {secs} seconds; deadlock resolution has failed, aborting"
    );
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (DeadlockDetector, ManualUpdates) {
        let clock = Arc::new(ProcessClock::new());
        let manual = clock.begin_manual_updates().unwrap();
        let detector = DeadlockDetector::new(clock, StallThresholds::default());
        (detector, manual)
    }

    fn run(detector: &DeadlockDetector, manual: &ManualUpdates, ticks: usize) -> Vec<StallVerdict> {
        (0..ticks).map(|_| detector.tick(manual)).collect()
    }

    fn reported(verdicts: &[StallVerdict]) -> Vec<i64> {
        verdicts
            .iter()
            .filter_map(|v| match v {
                StallVerdict::Stalled { secs, report: true } => Some(*secs),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unarmed_detector_never_escalates() {
        let (detector, manual) = setup();
        let verdicts = run(&detector, &manual, 600);
        assert!(verdicts.iter().all(|v| *v == StallVerdict::Healthy));
        assert_eq!(detector.current_stall(), 600);
    }

    #[test]
    fn test_armed_reports_only_on_multiples_of_interval() {
        let (detector, manual) = setup();
        detector.activate();
        let verdicts = run(&detector, &manual, 45);
        assert_eq!(reported(&verdicts), vec![10, 20, 30, 40]);
        // Stall 15 is stalled but silent.
        assert_eq!(
            verdicts[14],
            StallVerdict::Stalled {
                secs: 15,
                report: false
            }
        );
        assert_eq!(verdicts[8], StallVerdict::Healthy);
    }

    #[test]
    fn test_armed_25_seconds_reports_twice() {
        let (detector, manual) = setup();
        detector.activate();
        let verdicts = run(&detector, &manual, 25);
        assert_eq!(reported(&verdicts), vec![10, 20]);
    }

    #[test]
    fn test_reset_sets_baseline_to_current_elapsed() {
        let (detector, manual) = setup();
        run(&detector, &manual, 37);
        assert_eq!(detector.current_stall(), 37);

        detector.reset();
        assert_eq!(detector.current_stall(), 0);
        assert_eq!(detector.tick(&manual), StallVerdict::Healthy);
        assert_eq!(detector.current_stall(), 1);
    }

    #[test]
    fn test_reset_restarts_reporting_cadence() {
        let (detector, manual) = setup();
        detector.activate();
        run(&detector, &manual, 15);
        detector.reset();
        let verdicts = run(&detector, &manual, 12);
        assert_eq!(reported(&verdicts), vec![10]);
    }

    #[test]
    fn test_fatal_on_exact_tick_stall_reaches_ceiling() {
        let (detector, manual) = setup();
        detector.activate();
        let verdicts = run(&detector, &manual, 500);
        assert_eq!(verdicts[498], StallVerdict::Stalled { secs: 499, report: false });
        assert_eq!(verdicts[499], StallVerdict::Fatal { secs: 500 });
        assert!(verdicts[..499]
            .iter()
            .all(|v| !matches!(v, StallVerdict::Fatal { .. })));
    }

    #[test]
    fn test_activation_mid_stall_takes_effect_next_tick() {
        let (detector, manual) = setup();
        run(&detector, &manual, 19);
        assert!(!detector.is_armed());
        detector.activate();
        assert!(detector.is_armed());
        assert_eq!(
            detector.tick(&manual),
            StallVerdict::Stalled {
                secs: 20,
                report: true
            }
        );
    }

    #[test]
    fn test_custom_thresholds() {
        let clock = Arc::new(ProcessClock::new());
        let manual = clock.begin_manual_updates().unwrap();
        let detector = DeadlockDetector::new(
            clock,
            StallThresholds {
                report_interval_secs: 3,
                fatal_stall_secs: 8,
            },
        );
        detector.activate();
        let verdicts = run(&detector, &manual, 8);
        assert_eq!(reported(&verdicts), vec![3, 6]);
        assert_eq!(verdicts[7], StallVerdict::Fatal { secs: 8 });
    }

    #[test]
    fn test_resets_from_other_threads() {
        let (detector, manual) = setup();
        let detector = Arc::new(detector);
        detector.activate();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        detector.reset();
                    }
                })
            })
            .collect();

        for _ in 0..9 {
            assert_eq!(detector.tick(&manual), StallVerdict::Healthy);
        }
        for worker in workers {
            worker.join().unwrap();
        }
        detector.reset();
        assert!(detector.current_stall() >= 0);
    }
}
