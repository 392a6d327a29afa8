//! Test fixtures: an in-memory Electrum server, scripted connector and bridge, and wallet and
//! transaction builders derived from a fixed seed.

use crate::config::ServerEndpoint;
use crate::connection::{Bridge, BridgeError};
use crate::electrum::{
    Connector, ElectrumError, ElectrumSession, NotificationRouter, RpcRequest, SubscriptionRegistry,
    Transport,
};
use crate::events::EventDispatcher;
use crate::wallet::{BlockTransaction, ResolvedTransaction, ScriptHash, ScriptType, Wallet};

use async_trait::async_trait;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::block::{self, Header};
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{
    Amount, BlockHash, CompactTarget, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, WPubkeyHash, Witness, absolute, transaction,
};
use chrono::DateTime;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

const BASE_BLOCK_TIME: u32 = 1_600_000_000;

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

/// An outpoint of a transaction the mock server never knows about
pub fn external_outpoint(n: u8) -> OutPoint {
    let mut bytes = [0xee; 32];
    bytes[0] = n;
    OutPoint::new(Txid::from_byte_array(bytes), 3)
}

/// A script outside every test wallet
pub fn external_script() -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([9; 20]))
}

pub fn payment(outpoint: OutPoint, script: ScriptBuf, sats: u64) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: Amount::from_sat(sats), script_pubkey: script }],
    }
}

/// Payment into `script` from an external outpoint chosen by `salt`
pub fn funding_payment(script: ScriptBuf, sats: u64, salt: u8) -> Transaction {
    payment(external_outpoint(salt), script, sats)
}

pub fn test_wallet(gap_limit: u32) -> Wallet {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Regtest, &[7; 32]).unwrap();
    let account = Xpub::from_priv(&secp, &master);
    Wallet::new("test", Network::Regtest, account, ScriptType::P2wpkh, gap_limit)
}

/// A fetched transaction whose body is unrelated to `txid`
pub fn block_transaction(txid: Txid, height: i32) -> ResolvedTransaction {
    ResolvedTransaction::Fetched(BlockTransaction {
        txid,
        height,
        block_time: None,
        fee: None,
        transaction: payment(external_outpoint(1), external_script(), 1_000),
    })
}

pub fn block_transaction_of(tx: &Transaction, height: i32) -> (Txid, ResolvedTransaction) {
    let txid = tx.compute_txid();
    let block_time = (height > 0)
        .then(|| DateTime::from_timestamp(i64::from(BASE_BLOCK_TIME) + i64::from(height), 0))
        .flatten();
    let resolved = ResolvedTransaction::Fetched(BlockTransaction {
        txid,
        height,
        block_time,
        fee: None,
        transaction: tx.clone(),
    });
    (txid, resolved)
}

pub fn router() -> Arc<NotificationRouter> {
    Arc::new(NotificationRouter::new(
        Arc::new(SubscriptionRegistry::new()),
        EventDispatcher::new(16),
    ))
}

pub async fn test_session(server: &Arc<MockServer>) -> ElectrumSession {
    ElectrumSession::negotiate(server.clone(), router()).await.unwrap()
}

fn header_hex(height: u32) -> String {
    let header = Header {
        version: block::Version::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: BASE_BLOCK_TIME + height,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: height,
    };
    hex::encode(serialize(&header))
}

fn server_error(code: i64, message: &str) -> ElectrumError {
    ElectrumError::ServerError { code, message: message.to_string() }
}

#[derive(Default)]
struct MockState {
    transactions: HashMap<Txid, (Transaction, i32)>,
    raw_overrides: HashMap<Txid, String>,
    not_found: HashSet<Txid>,
    histories: HashMap<String, BTreeMap<Txid, i32>>,
    failing_histories: HashSet<String>,
    headers: BTreeSet<u32>,
    tip: u32,
    broadcast_result: Option<String>,
    calls: HashMap<String, usize>,
    batches: usize,
}

/// In-memory Electrum server speaking through the `Transport` trait
pub struct MockServer {
    software: String,
    state: Mutex<MockState>,
    connected: AtomicBool,
    reader_alive: AtomicBool,
}

impl MockServer {
    pub fn new(software: &str) -> Arc<Self> {
        Arc::new(Self {
            software: software.to_string(),
            state: Mutex::default(),
            connected: AtomicBool::new(true),
            reader_alive: AtomicBool::new(true),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Index a transaction under the scripts it pays and the known outputs it spends.
    ///
    /// Adding a known transaction again moves it to the new height.
    pub fn add_transaction(&self, tx: &Transaction, height: i32) {
        let mut state = self.state();
        let txid = tx.compute_txid();

        let mut scripts: Vec<ScriptBuf> = tx.output.iter().map(|o| o.script_pubkey.clone()).collect();
        for input in &tx.input {
            let previous = input.previous_output;
            if let Some((previous_tx, _)) = state.transactions.get(&previous.txid) {
                if let Some(output) = previous_tx.output.get(previous.vout as usize) {
                    scripts.push(output.script_pubkey.clone());
                }
            }
        }
        for script in scripts {
            let hash = ScriptHash::from_script(&script).as_str().to_string();
            state.histories.entry(hash).or_default().insert(txid, height);
        }

        if height > 0 {
            state.headers.insert(height as u32);
            state.tip = state.tip.max(height as u32);
        }
        state.transactions.insert(txid, (tx.clone(), height));
    }

    pub fn add_header(&self, height: u32) {
        self.state().headers.insert(height);
    }

    pub fn remove_header(&self, height: u32) {
        self.state().headers.remove(&height);
    }

    pub fn mark_not_found(&self, txid: Txid) {
        self.state().not_found.insert(txid);
    }

    /// Serve `hex` as the body of `txid`
    pub fn set_raw_transaction(&self, txid: Txid, hex: &str) {
        self.state().raw_overrides.insert(txid, hex.to_string());
    }

    /// Answer history requests for `script_hash` with a server error
    pub fn fail_history(&self, script_hash: &ScriptHash) {
        self.state().failing_histories.insert(script_hash.as_str().to_string());
    }

    pub fn set_broadcast_result(&self, txid: String) {
        self.state().broadcast_result = Some(txid);
    }

    pub fn set_tip(&self, height: u32) {
        let mut state = self.state();
        state.tip = height;
        state.headers.insert(height);
    }

    /// Requests received for `method`, counting batch items individually
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    pub fn batches(&self) -> usize {
        self.state().batches
    }

    pub fn kill_reader(&self) {
        self.reader_alive.store(false, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.reader_alive.store(true, Ordering::SeqCst);
    }

    fn handle(&self, request: &RpcRequest) -> Result<Value, ElectrumError> {
        let mut state = self.state();
        *state.calls.entry(request.method.to_string()).or_default() += 1;
        let params = &request.params;

        match request.method {
            "server.version" => Ok(json!([self.software, "1.4"])),
            "server.ping" => Ok(Value::Null),
            "server.banner" => Ok(json!("Welcome to the mock Electrum server")),
            "blockchain.headers.subscribe" => Ok(json!({"height": state.tip, "hex": header_hex(state.tip)})),
            "blockchain.scripthash.subscribe" => {
                let history = script_hash_history(&state, params)?;
                if history.is_empty() {
                    return Ok(Value::Null);
                }
                let summary: String = history.iter().map(|(txid, height)| format!("{txid}:{height}:")).collect();
                Ok(json!(hex::encode(sha256::Hash::hash(summary.as_bytes()).to_byte_array())))
            }
            "blockchain.scripthash.get_history" => {
                let requested = params.first().and_then(Value::as_str).unwrap_or_default();
                if state.failing_histories.contains(requested) {
                    return Err(server_error(-32603, "history too large"));
                }
                let history = script_hash_history(&state, params)?;
                Ok(Value::Array(
                    history
                        .iter()
                        .map(|(txid, height)| json!({"tx_hash": txid.to_string(), "height": height}))
                        .collect(),
                ))
            }
            "blockchain.block.header" => {
                let height = params.first().and_then(Value::as_u64).unwrap_or(u64::MAX) as u32;
                if state.headers.contains(&height) {
                    Ok(json!(header_hex(height)))
                } else {
                    Err(server_error(1, "height out of range"))
                }
            }
            "blockchain.transaction.get" => {
                let txid = params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| Txid::from_str(s).ok())
                    .ok_or_else(|| server_error(1, "invalid txid"))?;
                let verbose = params.get(1).and_then(Value::as_bool).unwrap_or(false);
                transaction_response(&state, &txid, verbose)
            }
            "blockchain.estimatefee" => Ok(json!(0.0002)),
            "blockchain.relayfee" => Ok(json!(0.00001)),
            "mempool.get_fee_histogram" => Ok(json!([[10.0, 100_000], [5.0, 200_000]])),
            "blockchain.transaction.broadcast" => {
                let tx: Transaction = params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|raw| hex::decode(raw).ok())
                    .and_then(|bytes| deserialize(&bytes).ok())
                    .ok_or_else(|| server_error(1, "TX decode failed"))?;
                Ok(json!(state.broadcast_result.clone().unwrap_or_else(|| tx.compute_txid().to_string())))
            }
            _ => Err(server_error(-32601, "unknown method")),
        }
    }
}

fn script_hash_history<'a>(state: &'a MockState, params: &[Value]) -> Result<Vec<(&'a Txid, &'a i32)>, ElectrumError> {
    let hash = params.first().and_then(Value::as_str).unwrap_or_default();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(server_error(1, "invalid script hash"));
    }
    Ok(state.histories.get(hash).map(|h| h.iter().collect()).unwrap_or_default())
}

fn transaction_response(state: &MockState, txid: &Txid, verbose: bool) -> Result<Value, ElectrumError> {
    let not_found = || server_error(2, "daemon error: No such mempool or blockchain transaction");
    if state.not_found.contains(txid) {
        return Err(not_found());
    }
    let known = state.transactions.get(txid);
    let hex = match (state.raw_overrides.get(txid), known) {
        (Some(hex), _) => hex.clone(),
        (None, Some((tx, _))) => hex::encode(serialize(tx)),
        (None, None) => return Err(not_found()),
    };
    if !verbose {
        return Ok(json!(hex));
    }

    let mut entry = json!({"txid": txid.to_string(), "hex": hex});
    if let Some((_, height)) = known.filter(|(_, height)| *height > 0) {
        let height = *height as u32;
        entry["confirmations"] = json!(state.tip.max(height) - height + 1);
        entry["blocktime"] = json!(BASE_BLOCK_TIME + height);
    }
    Ok(entry)
}

#[async_trait]
impl Transport for MockServer {
    async fn request(&self, request: RpcRequest) -> Result<Value, ElectrumError> {
        if !self.is_connected() {
            return Err(ElectrumError::ConnectionClosed);
        }
        self.handle(&request)
    }

    async fn batch(&self, requests: Vec<RpcRequest>) -> Result<Vec<Result<Value, ElectrumError>>, ElectrumError> {
        if !self.is_connected() {
            return Err(ElectrumError::ConnectionClosed);
        }
        self.state().batches += 1;
        Ok(requests.iter().map(|request| self.handle(request)).collect())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_reader_alive(&self) -> bool {
        self.reader_alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Hands out the mock server, or fails every attempt while `failing` is set
pub struct MockConnector {
    server: Arc<MockServer>,
    failing: AtomicBool,
    endpoints: Mutex<Vec<ServerEndpoint>>,
}

impl MockConnector {
    pub fn new(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self { server, failing: AtomicBool::new(false), endpoints: Mutex::default() })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn endpoints(&self) -> Vec<ServerEndpoint> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        _router: Arc<NotificationRouter>,
    ) -> Result<Arc<dyn Transport>, ElectrumError> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(ElectrumError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.server.revive();
        let transport: Arc<dyn Transport> = self.server.clone();
        Ok(transport)
    }
}

pub enum BridgeScript {
    /// Ready at this address
    Ready(String),
    /// Fails to start with this message
    Fail(String),
    /// Never becomes ready
    Hang,
}

pub struct MockBridge {
    script: BridgeScript,
    running: bool,
    pending: Option<oneshot::Sender<Result<String, BridgeError>>>,
    pub stops: Arc<AtomicUsize>,
}

impl MockBridge {
    pub fn new(script: BridgeScript) -> Self {
        Self { script, running: false, pending: None, stops: Arc::default() }
    }
}

#[async_trait]
impl Bridge for MockBridge {
    fn start(&mut self) -> oneshot::Receiver<Result<String, BridgeError>> {
        let (tx, rx) = oneshot::channel();
        match &self.script {
            BridgeScript::Ready(address) => {
                self.running = true;
                let _ = tx.send(Ok(address.clone()));
            }
            BridgeScript::Fail(message) => {
                self.running = false;
                let _ = tx.send(Err(BridgeError(message.clone())));
            }
            BridgeScript::Hang => {
                self.running = true;
                self.pending = Some(tx);
            }
        }
        rx
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        self.running = false;
        self.pending = None;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
