//! Process-wide cancellation signal.
//!
//! A single [`ShutdownHandle`] is held by the daemon's signal handler;
//! clones of [`ShutdownSignal`] are captured by every long-running loop
//! and observed inside `tokio::select!` at each waiting site.

use tokio::sync::watch;

/// Creates a linked handle/signal pair.
#[must_use]
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// The triggering side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The observing side of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// True once shutdown has been requested.
    ///
    /// A dropped [`ShutdownHandle`] also reads as shutdown, so an
    /// orphaned loop cannot run forever.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves when shutdown is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without an explicit request.
                return;
            }
        }
    }

    /// A signal that never fires, for components constructed in tests.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the signal stays quiet forever.
        std::mem::forget(tx);
        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_observes_handle() {
        let (handle, signal) = channel();
        assert!(!signal.is_cancelled());
        handle.shutdown();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn dropped_handle_reads_as_shutdown() {
        let (handle, signal) = channel();
        drop(handle);
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn never_stays_quiet() {
        let signal = ShutdownSignal::never();
        assert!(!signal.is_cancelled());
    }
}
