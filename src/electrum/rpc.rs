//! Electrum RPC strategies.
//!
//! Every high-level call is expressed as a list of requests. The strategy decides how the list
//! reaches the server:
//!
//! - `SimpleRpc`: one request per round trip, works with every server
//! - `BatchedRpc`: the whole list as one JSON-RPC batch, for servers known to support it
//!
//! The strategy is chosen once per connection from the `server.version` reply.

use super::transport::Transport;
use super::types::{
    BlockHeaderTip, ElectrumError, MempoolRateSize, RawTransaction, RpcRequest, ScriptHashTx,
    ServerVersion, VerboseTransaction,
};
use crate::wallet::ScriptHash;

use async_trait::async_trait;
use bitcoin::Txid;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether the server is known to handle JSON-RPC batches
pub fn supports_batching(version: &ServerVersion) -> bool {
    version.software.to_lowercase().contains("electrumx")
}

#[async_trait]
pub trait ElectrumRpc: Send + Sync {
    /// Get the name of this strategy for logging and diagnostics.
    fn name(&self) -> &'static str;

    fn transport(&self) -> &dyn Transport;

    /// Execute requests, returning per-item results in request order.
    async fn call_many(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<Result<Value, ElectrumError>>, ElectrumError>;

    async fn call(&self, request: RpcRequest) -> Result<Value, ElectrumError> {
        self.transport().request(request).await
    }

    async fn ping(&self) -> Result<(), ElectrumError> {
        self.call(RpcRequest::ping()).await.map(|_| ())
    }

    async fn get_server_version(
        &self,
        client_name: &str,
        versions: &[&str],
    ) -> Result<ServerVersion, ElectrumError> {
        let value = self.call(RpcRequest::server_version(client_name, versions)).await?;
        ServerVersion::from_value(value)
    }

    async fn get_server_banner(&self) -> Result<String, ElectrumError> {
        Ok(serde_json::from_value(self.call(RpcRequest::banner()).await?)?)
    }

    async fn subscribe_block_headers(&self) -> Result<BlockHeaderTip, ElectrumError> {
        Ok(serde_json::from_value(self.call(RpcRequest::headers_subscribe()).await?)?)
    }

    /// Subscribe to script hashes keyed by derivation path. Any per-item failure fails the call.
    async fn subscribe_script_hashes(
        &self,
        script_hashes: &BTreeMap<String, ScriptHash>,
    ) -> Result<BTreeMap<String, Option<String>>, ElectrumError> {
        let requests = script_hashes.values().map(RpcRequest::script_hash_subscribe).collect();
        let responses = self.call_many(requests).await?;

        let mut statuses = BTreeMap::new();
        for (path, response) in script_hashes.keys().zip(responses) {
            let status: Option<String> = serde_json::from_value(response?)?;
            statuses.insert(path.clone(), status);
        }
        Ok(statuses)
    }

    /// Fetch histories keyed by derivation path.
    ///
    /// With `fail_on_error` any per-item failure fails the call; otherwise failed items are
    /// left out of the result.
    async fn get_script_hash_history(
        &self,
        script_hashes: &BTreeMap<String, ScriptHash>,
        fail_on_error: bool,
    ) -> Result<BTreeMap<String, Vec<ScriptHashTx>>, ElectrumError> {
        let requests = script_hashes.values().map(RpcRequest::script_hash_history).collect();
        let responses = self.call_many(requests).await?;

        let mut histories = BTreeMap::new();
        for (path, response) in script_hashes.keys().zip(responses) {
            let parsed = response
                .and_then(|value| serde_json::from_value::<Vec<ScriptHashTx>>(value).map_err(Into::into));
            match parsed {
                Ok(history) => {
                    histories.insert(path.clone(), history);
                }
                Err(e) if fail_on_error => return Err(e),
                Err(e) => warn!("Failed to retrieve history for {}: {}", path, e),
            }
        }
        Ok(histories)
    }

    /// Fetch block headers as hex. Heights the server fails on are left out.
    async fn get_block_headers(
        &self,
        heights: &BTreeSet<u32>,
    ) -> Result<BTreeMap<u32, String>, ElectrumError> {
        let requests = heights.iter().map(|h| RpcRequest::block_header(*h)).collect();
        let responses = self.call_many(requests).await?;

        let mut headers = BTreeMap::new();
        for (height, response) in heights.iter().zip(responses) {
            match response.and_then(|v| serde_json::from_value::<String>(v).map_err(Into::into)) {
                Ok(hex) => {
                    headers.insert(*height, hex);
                }
                Err(e) => debug!("Failed to retrieve block header at height {}: {}", height, e),
            }
        }
        Ok(headers)
    }

    /// Fetch raw transactions. A server error for a txid yields `RawTransaction::NotFound`.
    async fn get_transactions(
        &self,
        txids: &BTreeSet<Txid>,
    ) -> Result<BTreeMap<Txid, RawTransaction>, ElectrumError> {
        let requests = txids.iter().map(|txid| RpcRequest::transaction(txid, false)).collect();
        let responses = self.call_many(requests).await?;

        let mut transactions = BTreeMap::new();
        for (txid, response) in txids.iter().zip(responses) {
            let raw = match response {
                Ok(value) => RawTransaction::Hex(serde_json::from_value(value)?),
                Err(e) if e.is_server_error() => {
                    debug!("Server could not provide transaction {}: {}", txid, e);
                    RawTransaction::NotFound
                }
                Err(e) => return Err(e),
            };
            transactions.insert(*txid, raw);
        }
        Ok(transactions)
    }

    /// Fetch verbose transactions. Failed items are left out.
    async fn get_verbose_transactions(
        &self,
        txids: &BTreeSet<Txid>,
        script_hash: Option<&ScriptHash>,
    ) -> Result<BTreeMap<Txid, VerboseTransaction>, ElectrumError> {
        let requests = txids.iter().map(|txid| RpcRequest::transaction(txid, true)).collect();
        let responses = self.call_many(requests).await?;

        let mut transactions = BTreeMap::new();
        for (txid, response) in txids.iter().zip(responses) {
            match response.and_then(|v| serde_json::from_value(v).map_err(Into::into)) {
                Ok(verbose) => {
                    transactions.insert(*txid, verbose);
                }
                Err(e) => match script_hash {
                    Some(hash) => warn!("Failed to retrieve verbose transaction {} for {}: {}", txid, hash, e),
                    None => warn!("Failed to retrieve verbose transaction {}: {}", txid, e),
                },
            }
        }
        Ok(transactions)
    }

    /// Fee estimates in BTC/kB per block target. Failed targets are left out.
    async fn get_fee_estimates(&self, targets: &[u16]) -> Result<BTreeMap<u16, f64>, ElectrumError> {
        let requests = targets.iter().map(|t| RpcRequest::estimate_fee(*t)).collect();
        let responses = self.call_many(requests).await?;

        let mut estimates = BTreeMap::new();
        for (target, response) in targets.iter().zip(responses) {
            match response.and_then(|v| serde_json::from_value::<f64>(v).map_err(Into::into)) {
                Ok(rate) => {
                    estimates.insert(*target, rate);
                }
                Err(e) => warn!("Failed to estimate fee for {} blocks: {}", target, e),
            }
        }
        Ok(estimates)
    }

    async fn get_fee_rate_histogram(&self) -> Result<Vec<MempoolRateSize>, ElectrumError> {
        let buckets: Vec<(f64, u64)> = serde_json::from_value(self.call(RpcRequest::fee_histogram()).await?)?;
        Ok(buckets
            .into_iter()
            .map(|(fee_rate, size)| MempoolRateSize { fee_rate, size })
            .collect())
    }

    /// Minimum relay fee in BTC/kB, if the server reports one
    async fn get_minimum_relay_fee(&self) -> Result<Option<f64>, ElectrumError> {
        match self.call(RpcRequest::relay_fee()).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(e) if e.is_server_error() => {
                debug!("Server did not report a relay fee: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcast a raw transaction, returning the txid reported by the server
    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String, ElectrumError> {
        Ok(serde_json::from_value(self.call(RpcRequest::broadcast(raw_hex)).await?)?)
    }
}

/// One request per round trip
pub struct SimpleRpc {
    transport: Arc<dyn Transport>,
}

impl SimpleRpc {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ElectrumRpc for SimpleRpc {
    fn name(&self) -> &'static str {
        "SimpleRpc"
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    async fn call_many(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<Result<Value, ElectrumError>>, ElectrumError> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            match self.transport.request(request).await {
                // Anything but a server-reported error means the connection is unusable
                Err(e) if !e.is_server_error() => return Err(e),
                response => responses.push(response),
            }
        }
        Ok(responses)
    }
}

/// All requests of a call in one JSON-RPC batch
pub struct BatchedRpc {
    transport: Arc<dyn Transport>,
}

impl BatchedRpc {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ElectrumRpc for BatchedRpc {
    fn name(&self) -> &'static str {
        "BatchedRpc"
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    async fn call_many(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<Result<Value, ElectrumError>>, ElectrumError> {
        let expected = requests.len();
        if expected == 0 {
            return Ok(Vec::new());
        }
        let mut responses = self.transport.batch(requests).await?;
        if responses.len() < expected {
            warn!("Batch returned {} of {} responses", responses.len(), expected);
            responses.resize_with(expected, || Err(ElectrumError::MissingResponse));
        }
        responses.truncate(expected);
        Ok(responses)
    }
}
