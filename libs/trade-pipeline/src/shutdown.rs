//! Cooperative cancellation for supervised tasks.
//!
//! One controller per shutdown stage; every task holds its own signal
//! clone and must wind down within the grace period.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Owning side: fires the signal once.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Task side: checked in every supervised loop.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested (or the controller is gone).
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    /// Sleep that wakes early on shutdown. Returns false if interrupted.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// Await named tasks, aborting whatever is still running after `grace`.
pub async fn join_with_grace(tasks: Vec<(&'static str, JoinHandle<()>)>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for (name, handle) in tasks {
        let abort = handle.abort_handle();
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_cancelled() => {}
            Ok(Err(err)) => warn!(task = name, error = %err, "task ended with panic"),
            Err(_) => {
                warn!(task = name, "task exceeded shutdown grace, aborting");
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_fires_once_for_all_clones() {
        let controller = ShutdownController::new();
        let mut a = controller.signal();
        let mut b = controller.signal();
        assert!(!a.is_shutdown());

        controller.shutdown();
        a.cancelled().await;
        b.cancelled().await;
        assert!(a.is_shutdown() && b.is_shutdown());
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_shutdown() {
        let controller = ShutdownController::new();
        let mut signal = controller.signal();

        let handle = tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.shutdown();

        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_join_with_grace_aborts_stuck_task() {
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(600)).await;
        });
        let started = std::time::Instant::now();
        join_with_grace(vec![("stuck", stuck)], Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
