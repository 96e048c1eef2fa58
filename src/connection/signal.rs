//! Latest-value signal queues.
//!
//! Engines never call back into the run loop; they (and the stream
//! handles) raise signals that the loop drains on its own schedule. A
//! signal is bounded to the newest pending notification: raising an
//! already-raised signal coalesces, so a burst of wake-ups costs one loop
//! iteration.

use std::sync::Arc;

use tokio::sync::Notify;

/// A clonable, coalescing wake-up signal.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<Notify>,
}

impl Signal {
    /// Create an unraised signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Coalesces with any already-pending raise.
    pub fn raise(&self) {
        self.inner.notify_one();
    }

    /// Wait until the signal is raised. Consumes one pending raise.
    pub async fn wait(&self) {
        self.inner.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let signal = Signal::new();
        let waiter = signal.clone();

        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.raise();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_raises_coalesce() {
        let signal = Signal::new();
        signal.raise();
        signal.raise();
        signal.raise();

        // One pending raise is consumed...
        signal.wait().await;
        // ...and no more are queued.
        let second = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_raise_before_wait_is_not_lost() {
        let signal = Signal::new();
        signal.raise();
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }
}
