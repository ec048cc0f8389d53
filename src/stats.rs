//! Running counters for the load manager, readable from any thread.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::feedback::{FeeDirection, FeeStep};

#[derive(Debug, Default)]
pub struct WatchdogStats {
    started_at: Mutex<Option<DateTime<Utc>>>,
    ticks: AtomicU64,
    stall_warnings: AtomicU64,
    time_jumps: AtomicU64,
    fee_raises: AtomicU64,
    fee_lowers: AtomicU64,
    fee_notifications: AtomicU64,
    collaborator_failures: AtomicU64,
}

/// Point-in-time copy of [`WatchdogStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub stall_warnings: u64,
    pub time_jumps: u64,
    pub fee_raises: u64,
    pub fee_lowers: u64,
    pub fee_notifications: u64,
    pub collaborator_failures: u64,
}

impl WatchdogStats {
    pub fn mark_started(&self) {
        let mut started = self
            .started_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *started = Some(Utc::now());
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall_warning(&self) {
        self.stall_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_time_jump(&self) {
        self.time_jumps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fee_step(&self, step: &FeeStep) {
        match step.direction {
            FeeDirection::Raise => self.fee_raises.fetch_add(1, Ordering::Relaxed),
            FeeDirection::Lower => self.fee_lowers.fetch_add(1, Ordering::Relaxed),
        };
        if step.changed {
            self.fee_notifications.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_collaborator_failure(&self) {
        self.collaborator_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let started_at = *self
            .started_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        StatsSnapshot {
            started_at,
            ticks: self.ticks.load(Ordering::Relaxed),
            stall_warnings: self.stall_warnings.load(Ordering::Relaxed),
            time_jumps: self.time_jumps.load(Ordering::Relaxed),
            fee_raises: self.fee_raises.load(Ordering::Relaxed),
            fee_lowers: self.fee_lowers.load(Ordering::Relaxed),
            fee_notifications: self.fee_notifications.load(Ordering::Relaxed),
            collaborator_failures: self.collaborator_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_steps_split_by_direction() {
        let stats = WatchdogStats::default();
        stats.record_fee_step(&FeeStep {
            overloaded: true,
            direction: FeeDirection::Raise,
            changed: true,
        });
        stats.record_fee_step(&FeeStep {
            overloaded: false,
            direction: FeeDirection::Lower,
            changed: false,
        });
        let snap = stats.snapshot();
        assert_eq!(snap.fee_raises, 1);
        assert_eq!(snap.fee_lowers, 1);
        assert_eq!(snap.fee_notifications, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = WatchdogStats::default();
        stats.record_tick();
        stats.mark_started();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["ticks"], 1);
        assert!(json["started_at"].is_string());
    }
}
