//! Wallet sync service and integration point for all sync components.
//!
//! This module defines the `WalletSyncService`, which runs history sync passes against the
//! current Electrum session. For each pass it:
//! - Serializes passes per wallet name, so two syncs of one wallet never interleave
//! - Works on a private snapshot of the wallet and commits it back when done
//! - Keeps partial progress of a failed pass (nodes materialized, transactions resolved)
//! - Dispatches `WalletHistoryChanged` only when the commit changed something, or
//!   `WalletHistoryFailed` when the pass errored

use super::history::HistorySynchronizer;
use super::progress_tracker::SyncProgressTracker;
use super::reconciler::reconcile_wallet;
use super::resolver::ReferenceResolver;
use crate::electrum::ElectrumSession;
use crate::events::{EventDispatcher, SyncEvent};
use crate::wallet::model::{Wallet, WalletChanges};
use crate::wallet::types::{WalletNode, WalletSyncError};

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{RwLock, watch};
use tracing::{error, info};

/// A wallet shared between the sync service and its readers
pub type SharedWallet = Arc<RwLock<Wallet>>;

/// One async mutex per wallet name, created on first use
#[derive(Debug, Clone, Default)]
pub struct WalletLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl WalletLocks {
    pub fn lock_for(&self, wallet: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(wallet.to_string())
            .or_default()
            .clone()
    }
}

pub struct WalletSyncService {
    sessions: watch::Receiver<Option<Arc<ElectrumSession>>>,
    locks: WalletLocks,
    events: EventDispatcher,
}

impl WalletSyncService {
    pub fn new(sessions: watch::Receiver<Option<Arc<ElectrumSession>>>, events: EventDispatcher) -> Self {
        Self { sessions, locks: WalletLocks::default(), events }
    }

    /// Sync every branch of the wallet, growing each to its gap limit.
    pub async fn sync_wallet(&self, wallet: &SharedWallet) -> Result<WalletChanges, WalletSyncError> {
        self.run(wallet, None).await
    }

    /// Sync the given nodes, plus nodes with unconfirmed activity.
    pub async fn sync_nodes(
        &self,
        wallet: &SharedWallet,
        nodes: BTreeSet<WalletNode>,
    ) -> Result<WalletChanges, WalletSyncError> {
        self.run(wallet, Some(nodes)).await
    }

    fn session(&self) -> Result<Arc<ElectrumSession>, WalletSyncError> {
        self.sessions.borrow().clone().ok_or(WalletSyncError::NotConnected)
    }

    async fn run(
        &self,
        wallet: &SharedWallet,
        nodes: Option<BTreeSet<WalletNode>>,
    ) -> Result<WalletChanges, WalletSyncError> {
        let session = self.session()?;
        let name = wallet.read().await.name().to_string();
        let lock = self.locks.lock_for(&name);
        let _guard = lock.lock().await;

        info!("Starting history sync of {}", name);
        let mut snapshot = wallet.read().await.clone();
        let mut tracker = SyncProgressTracker::new();
        let result = sync_pass(&session, &mut snapshot, nodes.as_ref(), &mut tracker).await;

        let changes = wallet.write().await.commit(&snapshot);

        match result {
            Ok(()) => {
                info!("{}: {}", name, tracker.get_stats().summary());
                if !changes.is_empty() {
                    self.events.dispatch(SyncEvent::WalletHistoryChanged {
                        wallet: name,
                        changes: changes.clone(),
                    });
                }
                Ok(changes)
            }
            Err(e) => {
                error!("History sync of {} failed: {}", name, e);
                self.events.dispatch(SyncEvent::WalletHistoryFailed {
                    wallet: name,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

async fn sync_pass(
    session: &ElectrumSession,
    wallet: &mut Wallet,
    nodes: Option<&BTreeSet<WalletNode>>,
    tracker: &mut SyncProgressTracker,
) -> Result<(), WalletSyncError> {
    let history = {
        let mut synchronizer = HistorySynchronizer::new(session, tracker);
        match nodes {
            None => synchronizer.sync_wallet(wallet).await?,
            Some(nodes) => synchronizer.sync_nodes(wallet, nodes).await?,
        }
    };

    let stats = ReferenceResolver::new(session).resolve(wallet, &history).await?;
    tracker.record_resolution(stats.fetched, stats.unfetchable);
    reconcile_wallet(wallet, &history)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, external_script, funding_payment, payment, test_session, test_wallet};
    use crate::wallet::types::KeyPurpose;
    use bitcoin::{Amount, OutPoint};

    async fn service(server: &Arc<MockServer>) -> (WalletSyncService, EventDispatcher) {
        let events = EventDispatcher::new(64);
        let session = Arc::new(test_session(server).await);
        // The receiver keeps the last value after the sender is gone
        let (_, rx) = watch::channel(Some(session));
        (WalletSyncService::new(rx, events.clone()), events)
    }

    #[tokio::test]
    async fn second_sync_changes_nothing() {
        let server = MockServer::new("ElectrumX 1.16.0");
        let (service, events) = service(&server).await;
        let mut listener = events.subscribe();

        let mut wallet = test_wallet(10);
        let node = WalletNode::new(KeyPurpose::Receive, 2);
        let funding = funding_payment(wallet.output_script(&node).unwrap(), 80_000, 1);
        server.add_transaction(&funding, 200);
        let spend = payment(OutPoint::new(funding.compute_txid(), 0), external_script(), 30_000);
        server.add_transaction(&spend, 201);
        let change = wallet.output_script(&WalletNode::new(KeyPurpose::Change, 0)).unwrap();
        let incoming = funding_payment(change, 5_000, 2);
        server.add_transaction(&incoming, 0);
        wallet.fill_to_index(KeyPurpose::Receive, 0);
        let wallet: SharedWallet = Arc::new(RwLock::new(wallet));

        let changes = service.sync_wallet(&wallet).await.unwrap();
        assert!(changes.transactions_changed);
        assert_eq!(changes.nodes_changed.len(), 2);
        assert!(matches!(listener.try_recv(), Ok(SyncEvent::WalletHistoryChanged { .. })));

        let balance = wallet.read().await.balance();
        assert_eq!(balance.confirmed, Amount::ZERO);
        assert_eq!(balance.unconfirmed, Amount::from_sat(5_000));

        let again = service.sync_wallet(&wallet).await.unwrap();
        assert!(again.is_empty());
        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_keeps_partial_progress() {
        let server = MockServer::new("ElectrumX 1.16.0");
        let (service, events) = service(&server).await;
        let mut listener = events.subscribe();

        let wallet = test_wallet(5);
        let node = WalletNode::new(KeyPurpose::Receive, 0);
        let funding = funding_payment(wallet.output_script(&node).unwrap(), 1_000, 1);
        server.add_transaction(&funding, 10);
        server.set_raw_transaction(funding.compute_txid(), "00");
        let wallet: SharedWallet = Arc::new(RwLock::new(wallet));

        let err = service.sync_wallet(&wallet).await.unwrap_err();
        assert!(matches!(err, WalletSyncError::ConsistencyError(_)));
        assert!(matches!(listener.try_recv(), Ok(SyncEvent::WalletHistoryFailed { .. })));
        // The receive branch was grown before the failure
        assert_eq!(wallet.read().await.child_count(KeyPurpose::Receive), 5);
    }

    #[tokio::test]
    async fn not_connected_without_session() {
        let (_tx, rx) = watch::channel(None);
        let service = WalletSyncService::new(rx, EventDispatcher::new(4));
        let wallet: SharedWallet = Arc::new(RwLock::new(test_wallet(5)));
        assert!(matches!(service.sync_wallet(&wallet).await, Err(WalletSyncError::NotConnected)));
    }

    #[test]
    fn one_lock_per_wallet_name() {
        let locks = WalletLocks::default();
        assert!(Arc::ptr_eq(&locks.lock_for("a"), &locks.lock_for("a")));
        assert!(!Arc::ptr_eq(&locks.lock_for("a"), &locks.lock_for("b")));
    }

    #[tokio::test]
    async fn concurrent_syncs_of_one_wallet_serialize() {
        let server = MockServer::new("ElectrumX 1.16.0");
        let (service, _events) = service(&server).await;
        let wallet = test_wallet(5);
        let node = WalletNode::new(KeyPurpose::Receive, 0);
        server.add_transaction(&funding_payment(wallet.output_script(&node).unwrap(), 1_000, 1), 10);
        let wallet: SharedWallet = Arc::new(RwLock::new(wallet));

        let (first, second) = tokio::join!(service.sync_wallet(&wallet), service.sync_wallet(&wallet));
        let (first, second) = (first.unwrap(), second.unwrap());
        // Exactly one of the two observed the new history
        assert!(first.is_empty() != second.is_empty());
    }
}
