//! Signal handling for graceful shutdown.
//!
//! SIGINT (Ctrl-C) and SIGTERM both request a cooperative stop of the load
//! manager; the process exits once the watchdog thread reports it has stopped.
use std::sync::Arc;
use tokio::sync::Notify;

use loadmgr::lifecycle::StopObserver;

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

/// Bridges the watchdog thread's stopped signal into the async runtime.
pub struct StoppedNotifier {
    notify: Arc<Notify>,
}

impl StoppedNotifier {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

impl StopObserver for StoppedNotifier {
    fn stopped(&self, name: &str) {
        tracing::debug!(component = name, "component stopped");
        // notify_one stores a permit if nobody is waiting yet.
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopped_before_wait_is_not_lost() {
        let notify = Arc::new(Notify::new());
        let notifier = StoppedNotifier::new(notify.clone());
        notifier.stopped("loadmgr");
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .expect("permit stored");
    }

    #[tokio::test]
    async fn test_stopped_from_other_thread_wakes_waiter() {
        let notify = Arc::new(Notify::new());
        let notifier = StoppedNotifier::new(notify.clone());
        let waiter = tokio::spawn({
            let notify = notify.clone();
            async move { notify.notified().await }
        });
        std::thread::spawn(move || notifier.stopped("loadmgr"))
            .join()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
