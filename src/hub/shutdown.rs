//! Shutdown signalling shared by the hub and everything scheduled on it

use tokio::sync::watch;

/// Owning side: flips every [`ShutdownSignal`] cloned from it
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger {
    /// Create a trigger in the running state
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A signal observers can poll or await
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal shutdown to every observer
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Return to the running state
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Whether shutdown has been signalled
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observing side of a [`ShutdownTrigger`]
///
/// A dropped trigger counts as shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been signalled
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown is signalled
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
