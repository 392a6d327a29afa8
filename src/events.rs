//! Event system for connection and history sync.
//!
//! This module defines the events emitted by the connection service and the wallet sync service,
//! the handler trait used to consume them, and the dispatcher that fans them out. Events are
//! broadcast on a tokio channel; each registered handler runs in its own task and sees every
//! event in order. Producers never wait on consumers.

use crate::connection::{ConnectionInfo, FeeRates};
use crate::wallet::{ScriptHash, WalletChanges, WalletSyncError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events emitted while connected to an Electrum server
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A server connection was established and negotiated
    Connected(ConnectionInfo),
    /// Fee estimates were refreshed
    FeeRatesUpdated(FeeRates),
    /// The connection was torn down
    Disconnected,
    /// The local bridge process stopped
    BridgeShutdown,
    /// The chain tip advanced
    NewBlock { height: u32, header: String },
    /// A subscribed script hash reported a new status
    ScriptHashStatus { script_hash: ScriptHash, status: Option<String> },
    /// A sync pass changed the wallet
    WalletHistoryChanged { wallet: String, changes: WalletChanges },
    /// A sync pass failed
    WalletHistoryFailed { wallet: String, error: String },
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects or state updates.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that fans events out to subscribers and registered handlers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Dispatch an event to all current subscribers.
    pub fn dispatch(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscribers for sync event");
        }
    }

    /// Run a handler in its own task until the dispatcher is dropped.
    ///
    /// Errors from the handler are logged and do not stop it.
    pub fn register_handler(&self, mut handler: Box<dyn SyncEventHandler>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = handler.handle(&event).await {
                            error!("Handler {} failed to process event: {}", handler.name(), e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Handler {} skipped {} events", handler.name(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Logs every event at a level matching its importance
pub struct LoggingHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
        match event {
            SyncEvent::Connected(info) => info!(
                "Connected to {} at height {}",
                info.server_version.software,
                info.tip.as_ref().map_or_else(|| "unknown".to_string(), |t| t.height.to_string())
            ),
            SyncEvent::FeeRatesUpdated(rates) => {
                debug!("Fee rates updated: {:?}", rates.block_target_rates)
            }
            SyncEvent::Disconnected => info!("Disconnected from server"),
            SyncEvent::BridgeShutdown => info!("Bridge shut down"),
            SyncEvent::NewBlock { height, .. } => debug!("New block {}", height),
            SyncEvent::ScriptHashStatus { script_hash, .. } => {
                debug!("Status changed for {}", script_hash)
            }
            SyncEvent::WalletHistoryChanged { wallet, changes } => info!(
                "History of {} changed: {} nodes updated, {} nodes added",
                wallet,
                changes.nodes_changed.len(),
                changes.nodes_added
            ),
            SyncEvent::WalletHistoryFailed { wallet, error } => {
                warn!("History sync of {} failed: {}", wallet, error)
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        blocks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SyncEventHandler for CountingHandler {
        async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
            if let SyncEvent::NewBlock { .. } = event {
                self.blocks.fetch_add(1, Ordering::SeqCst);
                return Err(WalletSyncError::SyncError("handler errors are logged".into()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "CountingHandler"
        }
    }

    #[tokio::test]
    async fn handlers_see_every_event() {
        let dispatcher = EventDispatcher::new(8);
        let blocks = Arc::new(AtomicUsize::new(0));
        let task = dispatcher.register_handler(Box::new(CountingHandler { blocks: blocks.clone() }));

        dispatcher.dispatch(SyncEvent::NewBlock { height: 1, header: String::new() });
        dispatcher.dispatch(SyncEvent::Disconnected);
        dispatcher.dispatch(SyncEvent::NewBlock { height: 2, header: String::new() });
        drop(dispatcher);

        task.await.unwrap();
        assert_eq!(blocks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatch_without_subscribers_is_fine() {
        EventDispatcher::new(1).dispatch(SyncEvent::BridgeShutdown);
    }
}
