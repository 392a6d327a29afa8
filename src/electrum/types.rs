//! Wire types for the Electrum JSON-RPC protocol

use crate::wallet::{Reference, ScriptHash};

use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;

/// A request before an id is assigned by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: &'static str,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: &'static str, params: Vec<Value>) -> Self {
        Self { method, params }
    }

    pub fn to_json(&self, id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": self.method,
            "params": self.params,
        })
    }

    pub fn ping() -> Self {
        Self::new("server.ping", vec![])
    }

    pub fn server_version(client_name: &str, versions: &[&str]) -> Self {
        Self::new("server.version", vec![json!(client_name), json!(versions)])
    }

    pub fn banner() -> Self {
        Self::new("server.banner", vec![])
    }

    pub fn headers_subscribe() -> Self {
        Self::new("blockchain.headers.subscribe", vec![])
    }

    pub fn script_hash_subscribe(script_hash: &ScriptHash) -> Self {
        Self::new("blockchain.scripthash.subscribe", vec![json!(script_hash.as_str())])
    }

    pub fn script_hash_history(script_hash: &ScriptHash) -> Self {
        Self::new("blockchain.scripthash.get_history", vec![json!(script_hash.as_str())])
    }

    pub fn block_header(height: u32) -> Self {
        Self::new("blockchain.block.header", vec![json!(height)])
    }

    pub fn transaction(txid: &Txid, verbose: bool) -> Self {
        Self::new("blockchain.transaction.get", vec![json!(txid.to_string()), json!(verbose)])
    }

    pub fn estimate_fee(target_blocks: u16) -> Self {
        Self::new("blockchain.estimatefee", vec![json!(target_blocks)])
    }

    pub fn fee_histogram() -> Self {
        Self::new("mempool.get_fee_histogram", vec![])
    }

    pub fn relay_fee() -> Self {
        Self::new("blockchain.relayfee", vec![])
    }

    pub fn broadcast(raw_hex: &str) -> Self {
        Self::new("blockchain.transaction.broadcast", vec![json!(raw_hex)])
    }
}

/// Error object of a failed request
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A response matched to its request by id
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn into_result(self) -> Result<Value, ElectrumError> {
        match self.error {
            Some(error) => Err(ElectrumError::ServerError {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result),
        }
    }
}

/// A server-initiated message without an id
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Result of `server.version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub software: String,
    pub protocol: String,
}

impl ServerVersion {
    pub fn from_value(value: Value) -> Result<Self, ElectrumError> {
        let (software, protocol): (String, String) = serde_json::from_value(value)?;
        Ok(Self { software, protocol })
    }
}

/// Current chain tip as reported by `blockchain.headers.subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderTip {
    pub height: u32,
    pub hex: String,
}

/// One entry of `blockchain.scripthash.get_history`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHashTx {
    pub tx_hash: String,
    pub height: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

impl ScriptHashTx {
    pub fn to_reference(&self) -> Result<Reference, ElectrumError> {
        let txid = Txid::from_str(&self.tx_hash).map_err(|e| {
            ElectrumError::UnexpectedResponse(format!("invalid tx_hash {}: {e}", self.tx_hash))
        })?;
        Ok(Reference::new(txid, self.height, self.fee))
    }
}

/// Result of a verbose `blockchain.transaction.get`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerboseTransaction {
    pub txid: String,
    pub hex: String,
    #[serde(default)]
    pub confirmations: Option<u32>,
    #[serde(default)]
    pub blocktime: Option<i64>,
    #[serde(default)]
    pub blockhash: Option<String>,
}

/// Raw transaction lookup outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTransaction {
    Hex(String),
    /// The server reported an error for this txid
    NotFound,
}

/// One bucket of the mempool fee histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MempoolRateSize {
    /// sat/vB
    pub fee_rate: f64,
    /// Total vsize of transactions paying this rate
    pub size: u64,
}

/// Error types for the Electrum client
#[derive(Debug, thiserror::Error)]
pub enum ElectrumError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("No response received for request")]
    MissingResponse,

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl ElectrumError {
    /// True when the server answered the request with an error object
    pub fn is_server_error(&self) -> bool {
        matches!(self, ElectrumError::ServerError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_result_is_not_an_error() {
        let response: RpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 4, "result": null})).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn error_object_becomes_server_error() {
        let response: RpcResponse = serde_json::from_value(json!({
            "id": 9,
            "error": {"code": 2, "message": "daemon error: No such mempool or blockchain transaction"}
        }))
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert!(err.is_server_error());
    }

    #[test]
    fn history_entry_without_fee() {
        let entry: ScriptHashTx = serde_json::from_value(json!({
            "tx_hash": "a1075db55d416d3ca199f55b6084e2115b9345e16c5cf302fc80e9d5fbf5d48d",
            "height": 0
        }))
        .unwrap();
        let reference = entry.to_reference().unwrap();
        assert_eq!(reference.height, 0);
        assert_eq!(reference.fee, None);

        let bad = ScriptHashTx { tx_hash: "zz".into(), height: 1, fee: None };
        assert!(matches!(bad.to_reference(), Err(ElectrumError::UnexpectedResponse(_))));
    }

    #[test]
    fn server_version_pair() {
        let version = ServerVersion::from_value(json!(["ElectrumX 1.16.0", "1.4"])).unwrap();
        assert_eq!(version.software, "ElectrumX 1.16.0");
        assert_eq!(version.protocol, "1.4");
    }
}
