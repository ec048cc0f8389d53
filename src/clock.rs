//! Process uptime clock with a manual-update mode.
//!
//! Outside manual mode the clock reports whole seconds since it was created.
//! While a [`ManualUpdates`] guard is alive the clock only moves when the guard
//! holder calls [`ManualUpdates::increment_elapsed_time`], so every reader in
//! the process sees the watchdog's notion of time instead of the wall clock.
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Errors raised when entering manual mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// Another guard already owns the manual counter.
    AlreadyManual,
}

impl std::fmt::Display for ClockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockError::AlreadyManual => {
                write!(f, "process clock is already in manual-update mode")
            }
        }
    }
}

impl std::error::Error for ClockError {}

/// Elapsed-seconds counter shared by the whole process.
#[derive(Debug)]
pub struct ProcessClock {
    start: Instant,
    /// Set while some guard owns the counter.
    claimed: AtomicBool,
    /// Readers consult `elapsed` instead of `start` while this is set.
    manual: AtomicBool,
    elapsed: AtomicI64,
}

impl ProcessClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            claimed: AtomicBool::new(false),
            manual: AtomicBool::new(false),
            elapsed: AtomicI64::new(0),
        }
    }

    /// Seconds elapsed according to the active time source.
    pub fn elapsed_seconds(&self) -> i64 {
        if self.manual.load(Ordering::Acquire) {
            self.elapsed.load(Ordering::Acquire)
        } else {
            self.automatic_seconds()
        }
    }

    /// Whether a manual-update guard is currently active.
    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::Acquire)
    }

    /// Switch the clock into manual-update mode.
    ///
    /// The manual counter starts from the current automatic reading, so time
    /// never moves backward on entry. Dropping the returned guard restores the
    /// automatic source.
    pub fn begin_manual_updates(self: &Arc<Self>) -> Result<ManualUpdates, ClockError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ClockError::AlreadyManual);
        }

        let seed = self.automatic_seconds();
        self.elapsed.store(seed, Ordering::Release);
        self.manual.store(true, Ordering::Release);
        tracing::debug!(elapsed_secs = seed, "process clock entered manual mode");

        Ok(ManualUpdates {
            clock: Arc::clone(self),
        })
    }

    fn automatic_seconds(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_secs()).unwrap_or(i64::MAX)
    }
}

impl Default for ProcessClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive writer of a [`ProcessClock`] while in manual mode.
#[derive(Debug)]
pub struct ManualUpdates {
    clock: Arc<ProcessClock>,
}

impl ManualUpdates {
    /// Advance the clock by exactly one second.
    pub fn increment_elapsed_time(&self) {
        self.clock.elapsed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn elapsed_seconds(&self) -> i64 {
        self.clock.elapsed_seconds()
    }

    pub fn clock(&self) -> &Arc<ProcessClock> {
        &self.clock
    }
}

impl Drop for ManualUpdates {
    fn drop(&mut self) {
        self.clock.manual.store(false, Ordering::Release);
        self.clock.claimed.store(false, Ordering::Release);
        tracing::debug!("process clock left manual mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_is_automatic() {
        let clock = ProcessClock::new();
        assert!(!clock.is_manual());
        assert_eq!(clock.elapsed_seconds(), 0);
    }

    #[test]
    fn test_increment_advances_by_exactly_one() {
        let clock = Arc::new(ProcessClock::new());
        let manual = clock.begin_manual_updates().unwrap();
        let before = clock.elapsed_seconds();

        for step in 1..=5 {
            manual.increment_elapsed_time();
            assert_eq!(clock.elapsed_seconds(), before + step);
        }
    }

    #[test]
    fn test_manual_mode_ignores_wall_clock() {
        let clock = Arc::new(ProcessClock::new());
        let manual = clock.begin_manual_updates().unwrap();
        let frozen = clock.elapsed_seconds();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(clock.elapsed_seconds(), frozen);
        assert_eq!(manual.elapsed_seconds(), frozen);
    }

    #[test]
    fn test_second_guard_is_rejected() {
        let clock = Arc::new(ProcessClock::new());
        let _manual = clock.begin_manual_updates().unwrap();
        assert_eq!(
            clock.begin_manual_updates().unwrap_err(),
            ClockError::AlreadyManual
        );
    }

    #[test]
    fn test_dropping_guard_restores_automatic_source() {
        let clock = Arc::new(ProcessClock::new());
        {
            let manual = clock.begin_manual_updates().unwrap();
            for _ in 0..100 {
                manual.increment_elapsed_time();
            }
            assert!(clock.is_manual());
            assert!(clock.elapsed_seconds() >= 100);
        }
        assert!(!clock.is_manual());
        assert!(clock.elapsed_seconds() < 100);

        // The clock can be claimed again once released.
        assert!(clock.begin_manual_updates().is_ok());
    }

    #[test]
    fn test_concurrent_readers_see_non_decreasing_values() {
        let clock = Arc::new(ProcessClock::new());
        let manual = clock.begin_manual_updates().unwrap();

        let reader = {
            let clock = Arc::clone(&clock);
            std::thread::spawn(move || {
                let mut last = clock.elapsed_seconds();
                for _ in 0..10_000 {
                    let now = clock.elapsed_seconds();
                    assert!(now >= last);
                    last = now;
                }
            })
        };

        for _ in 0..1_000 {
            manual.increment_elapsed_time();
        }
        reader.join().unwrap();
    }
}
