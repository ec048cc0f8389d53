//! Fixed-period pacing with drift correction.
//!
//! The loop keeps a running target instant and advances it by one period per
//! tick. If the time left until the new target is negative (we fell behind or
//! the clock jumped forward) or longer than a period (the clock jumped back),
//! the target is resynchronised to now instead of sleeping a stale duration.
use crate::lifecycle::StopToken;
use std::time::{Duration, Instant};

/// Source of "now" and of interruptible sleeps for the watchdog loop.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Wait for `duration`, returning early if `stop` is requested.
    fn sleep(&self, duration: Duration, stop: &StopToken);
}

/// Real monotonic time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicTime;

impl TimeSource for MonotonicTime {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, stop: &StopToken) {
        stop.wait_timeout(duration);
    }
}

/// What the loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Sleep this long, then tick again.
    Sleep(Duration),
    /// Time jumped; the target was reset to now and the loop ticks again at once.
    Resync,
}

#[derive(Debug, Clone)]
pub struct Pacer {
    period: Duration,
    target: Instant,
}

impl Pacer {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            target: now,
        }
    }

    pub fn target(&self) -> Instant {
        self.target
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Advance the target one period and decide how to reach it from `now`.
    pub fn next(&mut self, now: Instant) -> Pace {
        self.target += self.period;
        match self.target.checked_duration_since(now) {
            Some(remaining) if remaining <= self.period => Pace::Sleep(remaining),
            _ => {
                self.target = now;
                Pace::Resync
            }
        }
    }
}
