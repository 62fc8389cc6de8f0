//! Shared abort signal for in-flight network requests.
//!
//! Navigating away aborts every request holding the current signal and
//! installs a fresh one, so later requests never inherit an aborted signal.

use parking_lot::Mutex;
use tokio::sync::watch;

/// Owner of the current abort signal.
#[derive(Debug)]
pub struct AbortController {
    tx: Mutex<watch::Sender<bool>>,
}

/// A handle observing one generation of the abort signal.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    /// Creates a controller with a live signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Mutex::new(tx) }
    }

    /// The current signal.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.lock().subscribe(),
        }
    }

    /// Aborts the current signal and installs a fresh one.
    pub fn navigate(&self) {
        let mut tx = self.tx.lock();
        tx.send_replace(true);
        *tx = watch::channel(false).0;
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// True once the signal fired.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the signal fires. Never resolves if the controller is
    /// dropped without aborting.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                if *self.rx.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn navigate_aborts_old_signal_only() {
        let controller = AbortController::new();
        let mut old = controller.signal();
        controller.navigate();

        assert!(old.is_aborted());
        old.aborted().await;
        assert!(!controller.signal().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_controller_never_fires() {
        let controller = AbortController::new();
        let mut old = controller.signal();
        drop(controller);

        let waited = tokio::time::timeout(Duration::from_secs(5), old.aborted()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn navigate_wakes_waiters() {
        let controller = std::sync::Arc::new(AbortController::new());
        let mut signal = controller.signal();
        let trigger = controller.clone();
        tokio::spawn(async move { trigger.navigate() });
        signal.aborted().await;
        assert!(signal.is_aborted());
    }
}
