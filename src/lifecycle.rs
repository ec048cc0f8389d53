//! Start/stop lifecycle plumbing shared by long-running components.
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lifecycle states of a stoppable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Prepared,
    Running,
    StopRequested,
    Stopped,
}

/// Parent node notified when a child component has fully stopped.
pub trait StopObserver: Send + Sync {
    fn stopped(&self, name: &str);
}

/// A component driven by a parent's start/stop orchestration.
pub trait Stoppable {
    type Error;

    fn name(&self) -> &str;

    fn on_prepare(&mut self) -> Result<(), Self::Error>;

    fn on_start(&mut self) -> Result<(), Self::Error>;

    /// Ask the component to stop. Completion is reported through the
    /// component's [`StopObserver`], possibly from another thread.
    fn on_stop(&self);
}

/// Cooperative cancellation flag that can also interrupt a timed wait.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any waiter.
    pub fn request(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Wait up to `timeout`, returning early if a stop is requested.
    ///
    /// Returns `true` when a stop has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = lock(flag);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_token_starts_clear() {
        let token = StopToken::new();
        assert!(!token.is_requested());
    }

    #[test]
    fn test_wait_times_out_without_request() {
        let token = StopToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_request_interrupts_wait() {
        let token = StopToken::new();
        let waker = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.request();
        });

        let start = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_after_request_returns_immediately() {
        let token = StopToken::new();
        token.request();
        assert!(token.is_requested());
        assert!(token.wait_timeout(Duration::from_secs(10)));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&LifecycleState::StopRequested).unwrap();
        assert_eq!(json, "\"stop_requested\"");
    }
}
