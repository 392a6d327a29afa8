//! Shutdown coordination.

use tokio::sync::broadcast;

/// Coordinator for cooperative shutdown.
///
/// Long-running tasks subscribe and stop once the signal arrives. A pending bridge start observes
/// the same signal and is abandoned.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal every current subscriber.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
