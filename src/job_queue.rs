//! Backlog-counting work queue used by the host binary.
use crate::feedback::WorkQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks outstanding jobs and reports overload when the backlog exceeds a
/// fixed threshold.
#[derive(Debug)]
pub struct JobQueue {
    overload_threshold: u64,
    backlog: AtomicU64,
    peak_backlog: AtomicU64,
    completed: AtomicU64,
}

impl JobQueue {
    pub fn new(overload_threshold: u64) -> Self {
        Self {
            overload_threshold,
            backlog: AtomicU64::new(0),
            peak_backlog: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self) {
        let backlog = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_backlog.fetch_max(backlog, Ordering::AcqRel);
    }

    /// Mark one job finished. Returns `false` if there was nothing queued.
    pub fn complete(&self) -> bool {
        let updated = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if updated {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        updated
    }

    /// One second of synthetic load: submit `arrivals` jobs, then retire up
    /// to `service` of them. Returns the resulting backlog.
    pub fn pump(&self, arrivals: u64, service: u64) -> u64 {
        for _ in 0..arrivals {
            self.enqueue();
        }
        for _ in 0..service {
            if !self.complete() {
                break;
            }
        }
        self.backlog()
    }

    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::Acquire)
    }
}

impl WorkQueue for JobQueue {
    fn is_overloaded(&self) -> bool {
        self.backlog() > self.overload_threshold
    }

    fn diagnostic_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "backlog": self.backlog(),
            "overload_threshold": self.overload_threshold,
            "peak_backlog": self.peak_backlog.load(Ordering::Acquire),
            "completed": self.completed.load(Ordering::Relaxed),
        })
    }
}
