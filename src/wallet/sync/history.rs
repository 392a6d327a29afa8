//! Gap-limit history discovery.
//!
//! The `HistorySynchronizer` walks each branch of a wallet, subscribing to node script hashes,
//! fetching the references of nodes the server flags as having history, and growing the branch
//! until `gap_limit` unused nodes follow the highest used one. A final pass picks up wallet nodes
//! that were not queried but appear in newly discovered transactions.

use super::progress_tracker::SyncProgressTracker;
use super::resolver::ReferenceResolver;
use crate::electrum::ElectrumSession;
use crate::wallet::model::Wallet;
use crate::wallet::script_hash::{ScriptHash, all_script_hashes, node_script_hash};
use crate::wallet::types::{
    KeyPurpose, NodeHistory, ResolvedTransaction, WalletNode, WalletSyncError, merge_references,
};

use bitcoin::Txid;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Number of nodes a branch needs given its highest used index
pub fn required_size(gap_limit: u32, highest_used: Option<u32>) -> usize {
    highest_used.map_or(0, |index| index as usize + 1) + gap_limit as usize
}

/// Required branch size from the nodes currently keyed in the history map
pub fn gap_limit_size(gap_limit: u32, history: &NodeHistory, purpose: KeyPurpose) -> usize {
    let highest = history
        .keys()
        .filter(|node| node.purpose() == purpose)
        .map(WalletNode::index)
        .max();
    required_size(gap_limit, highest)
}

pub struct HistorySynchronizer<'a> {
    session: &'a ElectrumSession,
    tracker: &'a mut SyncProgressTracker,
}

impl<'a> HistorySynchronizer<'a> {
    pub fn new(session: &'a ElectrumSession, tracker: &'a mut SyncProgressTracker) -> Self {
        Self { session, tracker }
    }

    /// Discover the complete history of every branch of the wallet.
    pub async fn sync_wallet(&mut self, wallet: &mut Wallet) -> Result<NodeHistory, WalletSyncError> {
        let known = wallet.transaction_ids();
        let mut history = NodeHistory::new();

        for purpose in KeyPurpose::ALL {
            self.sync_branch(wallet, purpose, &mut history).await?;
        }

        let queried: BTreeSet<WalletNode> = wallet.nodes().collect();
        self.discover_additional_nodes(wallet, &queried, &known, &mut history).await?;
        self.tracker.validate_completion(wallet, &history)?;
        self.tracker.log_progress(wallet);

        Ok(history)
    }

    /// Discover the history of the given nodes plus any node with unconfirmed activity.
    pub async fn sync_nodes(
        &mut self,
        wallet: &mut Wallet,
        nodes: &BTreeSet<WalletNode>,
    ) -> Result<NodeHistory, WalletSyncError> {
        let known = wallet.transaction_ids();
        let mut history = NodeHistory::new();

        let mut queried = nodes.clone();
        queried.extend(wallet.mempool_nodes());
        let requested: Vec<WalletNode> = queried.iter().copied().collect();

        self.subscribe_nodes(wallet, &requested, &mut history, 0).await?;
        let keys: Vec<WalletNode> = history.keys().copied().collect();
        self.fetch_references(wallet, &keys, &mut history, 0).await?;
        self.resolve(wallet, &history).await?;

        self.discover_additional_nodes(wallet, &queried, &known, &mut history).await?;
        self.tracker.log_progress(wallet);

        Ok(history)
    }

    async fn sync_branch(
        &mut self,
        wallet: &mut Wallet,
        purpose: KeyPurpose,
        history: &mut NodeHistory,
    ) -> Result<(), WalletSyncError> {
        let mut start_index = 0;
        loop {
            let children: Vec<WalletNode> = wallet.children(purpose).collect();
            self.subscribe_nodes(wallet, &children, history, start_index).await?;
            let keys: Vec<WalletNode> = branch_keys(history, purpose);
            self.fetch_references(wallet, &keys, history, start_index).await?;
            self.resolve(wallet, history).await?;

            let materialized = wallet.child_count(purpose);
            let required = gap_limit_size(wallet.gap_limit(), history, purpose);
            if materialized >= required {
                break;
            }
            self.tracker.record_gap_round(purpose, required);
            wallet.fill_to_index(purpose, required as u32 - 1);
            start_index = materialized as u32;
        }

        for node in wallet.children(purpose) {
            history.entry(node).or_default();
        }
        Ok(())
    }

    /// Subscribe to nodes at or above `start_index` that are not yet subscribed this session.
    ///
    /// Nodes with a non-null status, fresh or already recorded, become history keys.
    async fn subscribe_nodes(
        &mut self,
        wallet: &Wallet,
        nodes: &[WalletNode],
        history: &mut NodeHistory,
        start_index: u32,
    ) -> Result<(), WalletSyncError> {
        let registry = self.session.subscriptions();
        let mut to_subscribe: BTreeMap<String, ScriptHash> = BTreeMap::new();
        let mut by_path: HashMap<String, WalletNode> = HashMap::new();
        let mut seen: HashSet<ScriptHash> = HashSet::new();

        for node in nodes.iter().filter(|node| node.index() >= start_index) {
            let script_hash = node_script_hash(wallet, node)?;
            if registry.status_of(&script_hash).is_some() {
                history.entry(*node).or_default();
            } else if !registry.is_subscribed(&script_hash) && seen.insert(script_hash.clone()) {
                let path = node.derivation_path();
                by_path.insert(path.clone(), *node);
                to_subscribe.insert(path, script_hash);
            }
        }

        if to_subscribe.is_empty() {
            return Ok(());
        }

        let statuses = self.session.rpc().subscribe_script_hashes(&to_subscribe).await?;
        self.tracker.record_subscriptions(statuses.len());
        for (path, status) in statuses {
            let (Some(node), Some(script_hash)) = (by_path.get(&path), to_subscribe.get(&path)) else {
                continue;
            };
            if status.is_some() {
                history.entry(*node).or_default();
            }
            registry.record(script_hash.clone(), status);
        }
        Ok(())
    }

    /// Fetch and merge the references of nodes at or above `start_index`.
    async fn fetch_references(
        &mut self,
        wallet: &Wallet,
        nodes: &[WalletNode],
        history: &mut NodeHistory,
        start_index: u32,
    ) -> Result<(), WalletSyncError> {
        let mut requested: BTreeMap<String, ScriptHash> = BTreeMap::new();
        let mut by_path: HashMap<String, WalletNode> = HashMap::new();
        for node in nodes.iter().filter(|node| node.index() >= start_index) {
            let path = node.derivation_path();
            requested.insert(path.clone(), node_script_hash(wallet, node)?);
            by_path.insert(path, *node);
        }

        if requested.is_empty() {
            return Ok(());
        }

        let histories = self.session.rpc().get_script_hash_history(&requested, true).await?;
        let mut reference_count = 0;
        for (path, entries) in &histories {
            let Some(node) = by_path.get(path) else {
                continue;
            };
            let incoming = entries
                .iter()
                .map(|entry| entry.to_reference())
                .collect::<Result<Vec<_>, _>>()?;
            reference_count += incoming.len();

            let merged = merge_references(&history.get(node).cloned().unwrap_or_default(), incoming);
            history.insert(*node, merged);
        }
        self.tracker.record_histories(histories.len(), reference_count);
        Ok(())
    }

    async fn resolve(&mut self, wallet: &mut Wallet, history: &NodeHistory) -> Result<(), WalletSyncError> {
        let stats = ReferenceResolver::new(self.session).resolve(wallet, history).await?;
        self.tracker.record_resolution(stats.fetched, stats.unfetchable);
        Ok(())
    }

    /// Query wallet nodes outside `queried` that appear in transactions new to this sync.
    async fn discover_additional_nodes(
        &mut self,
        wallet: &mut Wallet,
        queried: &BTreeSet<WalletNode>,
        known: &HashSet<Txid>,
        history: &mut NodeHistory,
    ) -> Result<(), WalletSyncError> {
        let new_txids: BTreeSet<Txid> = history
            .values()
            .flat_map(|references| references.txids())
            .filter(|txid| !known.contains(*txid))
            .copied()
            .collect();
        if new_txids.is_empty() {
            return Ok(());
        }
        debug!("Found new transactions: {}", new_txids.iter().join(", "));

        let script_hashes = all_script_hashes(wallet)?;
        let additional = related_nodes(wallet, &new_txids, &script_hashes, queried);
        if additional.is_empty() {
            return Ok(());
        }
        debug!("Found additional nodes: {}", additional.iter().join(", "));
        self.tracker.record_additional_nodes(additional.len());

        let nodes: Vec<WalletNode> = additional.into_iter().collect();
        self.subscribe_nodes(wallet, &nodes, history, 0).await?;
        self.fetch_references(wallet, &nodes, history, 0).await?;
        self.resolve(wallet, history).await
    }
}

fn branch_keys(history: &NodeHistory, purpose: KeyPurpose) -> Vec<WalletNode> {
    history.keys().filter(|node| node.purpose() == purpose).copied().collect()
}

/// Wallet nodes paid by, or spending into, the given transactions that were not queried
fn related_nodes(
    wallet: &Wallet,
    txids: &BTreeSet<Txid>,
    script_hashes: &HashMap<ScriptHash, WalletNode>,
    queried: &BTreeSet<WalletNode>,
) -> BTreeSet<WalletNode> {
    let transactions = wallet.transactions();
    let mut nodes = BTreeSet::new();
    let mut consider = |script: &bitcoin::Script| {
        if let Some(node) = script_hashes.get(&ScriptHash::from_script(script)) {
            if !queried.contains(node) {
                nodes.insert(*node);
            }
        }
    };

    for txid in txids {
        let Some(ResolvedTransaction::Fetched(block_tx)) = transactions.get(txid) else {
            continue;
        };
        for output in &block_tx.transaction.output {
            consider(&output.script_pubkey);
        }
        for input in &block_tx.transaction.input {
            let previous = input.previous_output;
            if let Some(ResolvedTransaction::Fetched(prev_tx)) = transactions.get(&previous.txid) {
                if let Some(prev_output) = prev_tx.transaction.output.get(previous.vout as usize) {
                    consider(&prev_output.script_pubkey);
                }
            }
        }
    }
    nodes
}

/// Script hashes of the given nodes whose history lists `txid` as unconfirmed.
pub async fn mempool_script_hashes(
    session: &ElectrumSession,
    wallet: &Wallet,
    txid: &Txid,
    nodes: &BTreeSet<WalletNode>,
) -> Result<BTreeSet<ScriptHash>, WalletSyncError> {
    let mut requested: BTreeMap<String, ScriptHash> = BTreeMap::new();
    for node in nodes {
        requested.insert(node.derivation_path(), node_script_hash(wallet, node)?);
    }

    let histories = session.rpc().get_script_hash_history(&requested, true).await?;
    let mut found = BTreeSet::new();
    for (path, entries) in histories {
        for entry in entries {
            let reference = entry.to_reference()?;
            if reference.txid == *txid && !reference.is_confirmed() {
                if let Some(script_hash) = requested.get(&path) {
                    found.insert(script_hash.clone());
                }
            }
        }
    }
    Ok(found)
}
