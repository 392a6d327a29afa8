//! A negotiated connection to one Electrum server.
//!
//! `ElectrumSession` is created once the transport is open and `server.version` has been
//! exchanged. It owns the transport, the RPC strategy picked for that server, and a handle to the
//! subscription registry. Server notifications arrive through the `NotificationRouter`, which
//! outlives individual sessions.

use super::rpc::{BatchedRpc, ElectrumRpc, SimpleRpc, supports_batching};
use super::subscriptions::SubscriptionRegistry;
use super::transport::Transport;
use super::types::{BlockHeaderTip, ElectrumError, Notification, ServerVersion};
use crate::events::{EventDispatcher, SyncEvent};
use crate::wallet::{BlockTransaction, ScriptHash, WalletSyncError};

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{Transaction, Txid};
use chrono::DateTime;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

pub const CLIENT_NAME: &str = "electrum-wallet-sync";
/// Minimum and maximum protocol versions offered to the server
pub const SUPPORTED_VERSIONS: [&str; 2] = ["1.3", "1.4.2"];

/// Applies server notifications to shared state.
///
/// Called from the transport's reader task, which is the only writer of notification-driven
/// state.
pub struct NotificationRouter {
    subscriptions: Arc<SubscriptionRegistry>,
    events: EventDispatcher,
    tip: Mutex<Option<BlockHeaderTip>>,
}

impl NotificationRouter {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, events: EventDispatcher) -> Self {
        Self { subscriptions, events, tip: Mutex::new(None) }
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
        self.subscriptions.clone()
    }

    pub fn tip(&self) -> Option<BlockHeaderTip> {
        self.tip.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_tip(&self, tip: BlockHeaderTip) {
        *self.tip.lock().unwrap_or_else(PoisonError::into_inner) = Some(tip);
    }

    pub fn route(&self, notification: Notification) {
        let params = Value::Array(notification.params);
        match notification.method.as_str() {
            "blockchain.scripthash.subscribe" => {
                match serde_json::from_value::<(String, Option<String>)>(params) {
                    Ok((script_hash, status)) => {
                        let script_hash = ScriptHash::from(script_hash);
                        debug!("Status update for {}: {:?}", script_hash, status);
                        self.subscriptions.record(script_hash.clone(), status.clone());
                        self.events.dispatch(SyncEvent::ScriptHashStatus { script_hash, status });
                    }
                    Err(e) => warn!("Malformed script hash notification: {}", e),
                }
            }
            "blockchain.headers.subscribe" => {
                match serde_json::from_value::<(BlockHeaderTip,)>(params) {
                    Ok((tip,)) => {
                        info!("New block at height {}", tip.height);
                        self.set_tip(tip.clone());
                        self.events.dispatch(SyncEvent::NewBlock { height: tip.height, header: tip.hex });
                    }
                    Err(e) => warn!("Malformed header notification: {}", e),
                }
            }
            other => debug!("Ignoring notification {}", other),
        }
    }
}

pub struct ElectrumSession {
    transport: Arc<dyn Transport>,
    rpc: Box<dyn ElectrumRpc>,
    server_version: ServerVersion,
    router: Arc<NotificationRouter>,
}

impl ElectrumSession {
    /// Exchange versions over plain requests and pick the RPC strategy for this server.
    pub async fn negotiate(
        transport: Arc<dyn Transport>,
        router: Arc<NotificationRouter>,
    ) -> Result<Self, ElectrumError> {
        let simple = SimpleRpc::new(transport.clone());
        let server_version = simple.get_server_version(CLIENT_NAME, &SUPPORTED_VERSIONS).await?;
        info!(
            "Connected to {} using protocol version {}",
            server_version.software, server_version.protocol
        );

        let rpc: Box<dyn ElectrumRpc> = if supports_batching(&server_version) {
            debug!("Upgrading to batched JSON-RPC");
            Box::new(BatchedRpc::new(transport.clone()))
        } else {
            Box::new(simple)
        };

        Ok(Self { transport, rpc, server_version, router })
    }

    pub fn rpc(&self) -> &dyn ElectrumRpc {
        self.rpc.as_ref()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.router.subscriptions
    }

    pub fn server_version(&self) -> &ServerVersion {
        &self.server_version
    }

    pub fn tip(&self) -> Option<BlockHeaderTip> {
        self.router.tip()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_reader_alive(&self) -> bool {
        self.transport.is_reader_alive()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub async fn subscribe_block_headers(&self) -> Result<BlockHeaderTip, ElectrumError> {
        let tip = self.rpc.subscribe_block_headers().await?;
        self.router.set_tip(tip.clone());
        Ok(tip)
    }

    /// Broadcast a transaction and check the server computed the same txid.
    pub async fn broadcast_transaction(&self, transaction: &Transaction) -> Result<Txid, WalletSyncError> {
        let expected = transaction.compute_txid();
        let reported = self.rpc.broadcast_transaction(&hex::encode(serialize(transaction))).await?;
        let received = Txid::from_str(&reported).map_err(|e| {
            ElectrumError::UnexpectedResponse(format!("invalid broadcast txid {reported}: {e}"))
        })?;

        if received != expected {
            return Err(WalletSyncError::BroadcastMismatch { expected, received });
        }
        info!("Broadcast transaction {}", received);
        Ok(received)
    }

    /// Fetch transactions with their confirmation context, skipping any that fail to decode.
    pub async fn get_verbose_transactions(
        &self,
        txids: &BTreeSet<Txid>,
        script_hash: Option<&ScriptHash>,
    ) -> Result<BTreeMap<Txid, BlockTransaction>, WalletSyncError> {
        let verbose = self.rpc.get_verbose_transactions(txids, script_hash).await?;
        let tip_height = self.tip().map(|tip| tip.height);

        let mut transactions = BTreeMap::new();
        for (txid, entry) in verbose {
            let transaction: Transaction = match hex::decode(&entry.hex)
                .map_err(|e| e.to_string())
                .and_then(|bytes| deserialize(&bytes).map_err(|e| e.to_string()))
            {
                Ok(tx) => tx,
                Err(e) => {
                    warn!("Could not parse verbose transaction {}: {}", txid, e);
                    continue;
                }
            };

            let height = match (entry.confirmations, tip_height) {
                (Some(confirmations), Some(tip)) if confirmations > 0 => {
                    (tip + 1).saturating_sub(confirmations) as i32
                }
                _ => 0,
            };
            let block_time = entry
                .blocktime
                .and_then(|secs| DateTime::from_timestamp(secs, 0));

            transactions.insert(
                txid,
                BlockTransaction { txid, height, block_time, fee: None, transaction },
            );
        }
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServer, external_script, funding_payment, router, test_session};
    use serde_json::json;

    #[tokio::test]
    async fn negotiation_upgrades_electrumx_to_batched() {
        let server = MockServer::new("ElectrumX 1.16.0");
        let session = ElectrumSession::negotiate(server.clone(), router()).await.unwrap();
        assert_eq!(session.rpc().name(), "BatchedRpc");
        assert_eq!(server.calls("server.version"), 1);
        assert_eq!(server.batches(), 0);
    }

    #[tokio::test]
    async fn negotiation_keeps_simple_for_other_servers() {
        let server = MockServer::new("electrs/0.10.0");
        let session = ElectrumSession::negotiate(server.clone(), router()).await.unwrap();
        assert_eq!(session.rpc().name(), "SimpleRpc");
        assert_eq!(session.server_version().software, "electrs/0.10.0");
    }

    #[tokio::test]
    async fn broadcast_checks_returned_txid() {
        let server = MockServer::new("ElectrumX 1.16.0");
        let session = test_session(&server).await;
        let tx = funding_payment(external_script(), 20_000, 3);

        assert_eq!(session.broadcast_transaction(&tx).await.unwrap(), tx.compute_txid());

        server.set_broadcast_result("11".repeat(32));
        let err = session.broadcast_transaction(&tx).await.unwrap_err();
        assert!(matches!(err, WalletSyncError::BroadcastMismatch { .. }));
    }

    #[tokio::test]
    async fn verbose_transactions_derive_height_from_tip() {
        let server = MockServer::new("ElectrumX 1.16.0");
        let session = test_session(&server).await;
        server.set_tip(110);
        session.subscribe_block_headers().await.unwrap();

        let tx = funding_payment(external_script(), 20_000, 4);
        server.add_transaction(&tx, 101);
        let txids: BTreeSet<Txid> = [tx.compute_txid()].into();

        let fetched = session.get_verbose_transactions(&txids, None).await.unwrap();
        let block_tx = &fetched[&tx.compute_txid()];
        assert_eq!(block_tx.height, 101);
        assert!(block_tx.block_time.is_some());
    }

    #[test]
    fn router_records_notifications() {
        let router = router();
        let mut events = router.events.subscribe();
        router.route(Notification {
            method: "blockchain.headers.subscribe".into(),
            params: vec![json!({"height": 812_345, "hex": "00"})],
        });
        router.route(Notification {
            method: "blockchain.scripthash.subscribe".into(),
            params: vec![json!("cd".repeat(32)), Value::Null],
        });

        assert_eq!(router.tip().map(|t| t.height), Some(812_345));
        assert!(router.subscriptions().is_subscribed(&ScriptHash::from("cd".repeat(32))));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::NewBlock { height: 812_345, .. })));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::ScriptHashStatus { status: None, .. })));
    }
}
