//! Cooperative shutdown for queue workers.
//!
//! A [`Shutdown`] owns the trigger; every worker holds a cloned
//! [`ShutdownSignal`]. The signal is level-triggered: a worker that starts
//! after [`Shutdown::trigger`] sees it immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Owner side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create an untriggered shutdown.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// A signal observing this shutdown.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Ask every worker to stop.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
        tracing::info!("Shutdown triggered");
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Clear the trigger so the same handles can stop a later run.
    pub(crate) fn reset(&self) {
        self.sender.send_replace(false);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self { receiver }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// Never resolves if the [`Shutdown`] is dropped without triggering.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_observes_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.is_shutdown());

        shutdown.trigger();

        assert!(signal.is_shutdown());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn late_signal_sees_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.signal().is_shutdown());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn reset_rearms_existing_handles() {
        let shutdown = Shutdown::new();
        let handle = shutdown.clone();
        handle.trigger();
        shutdown.reset();

        let signal = shutdown.signal();
        assert!(!signal.is_shutdown());
        handle.trigger();
        assert!(signal.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_shutdown() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.trigger();

        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_shutdown() {
        assert!(ShutdownSignal::never().sleep(Duration::from_secs(5)).await);
    }
}
