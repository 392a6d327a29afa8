//! In-memory wallet model.
//!
//! A `Wallet` holds a watch-only account key, the nodes materialized on each branch, the
//! transactions resolved so far, and the outputs owned by every node. The history sync mutates a
//! private snapshot of the wallet and hands it back through [`Wallet::commit`], which reports
//! exactly what changed.

use super::types::{KeyPurpose, OwnedOutputs, ResolvedTransaction, WalletNode, WalletSyncError};
use crate::config::WalletConfig;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::VerifyOnly;
use bitcoin::{Amount, CompressedPublicKey, Network, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;

/// Output script template used for every node of the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    #[default]
    P2wpkh,
}

/// What a commit changed in the live wallet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletChanges {
    pub nodes_added: usize,
    pub transactions_changed: bool,
    pub nodes_changed: Vec<WalletNode>,
}

impl WalletChanges {
    pub fn is_empty(&self) -> bool {
        self.nodes_added == 0 && !self.transactions_changed && self.nodes_changed.is_empty()
    }
}

/// Confirmed and unconfirmed unspent value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

#[derive(Debug, Clone)]
pub struct Wallet {
    name: String,
    network: Network,
    account: Xpub,
    script_type: ScriptType,
    gap_limit: u32,
    branches: BTreeMap<KeyPurpose, Vec<OwnedOutputs>>,
    transactions: HashMap<Txid, ResolvedTransaction>,
    secp: Secp256k1<VerifyOnly>,
}

impl Wallet {
    pub fn new(
        name: impl Into<String>,
        network: Network,
        account: Xpub,
        script_type: ScriptType,
        gap_limit: u32,
    ) -> Self {
        Self {
            name: name.into(),
            network,
            account,
            script_type,
            gap_limit,
            branches: KeyPurpose::ALL.into_iter().map(|p| (p, Vec::new())).collect(),
            transactions: HashMap::new(),
            secp: Secp256k1::verification_only(),
        }
    }

    pub fn from_config(config: &WalletConfig, network: Network) -> Result<Self, WalletSyncError> {
        let account = Xpub::from_str(&config.xpub)?;
        Ok(Self::new(
            config.name.clone(),
            network,
            account,
            config.script_type,
            config.gap_limit,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    pub fn child_count(&self, purpose: KeyPurpose) -> usize {
        self.branches.get(&purpose).map_or(0, Vec::len)
    }

    /// Materialized nodes of one branch in index order
    pub fn children(&self, purpose: KeyPurpose) -> impl Iterator<Item = WalletNode> {
        (0..self.child_count(purpose) as u32).map(move |index| WalletNode::new(purpose, index))
    }

    pub fn nodes(&self) -> impl Iterator<Item = WalletNode> {
        KeyPurpose::ALL.into_iter().flat_map(|purpose| self.children(purpose))
    }

    /// Materialize nodes on a branch up to and including `index`
    pub fn fill_to_index(&mut self, purpose: KeyPurpose, index: u32) {
        let branch = self.branches.entry(purpose).or_default();
        let wanted = index as usize + 1;
        if branch.len() < wanted {
            branch.resize_with(wanted, OwnedOutputs::new);
        }
    }

    pub fn output_script(&self, node: &WalletNode) -> Result<ScriptBuf, WalletSyncError> {
        let path = [
            ChildNumber::from_normal_idx(node.purpose().child_number())?,
            ChildNumber::from_normal_idx(node.index())?,
        ];
        let key = self.account.derive_pub(&self.secp, &path)?;

        Ok(match self.script_type {
            ScriptType::P2wpkh => {
                ScriptBuf::new_p2wpkh(&CompressedPublicKey(key.public_key).wpubkey_hash())
            }
            ScriptType::P2pkh => {
                ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(key.public_key).pubkey_hash())
            }
        })
    }

    pub fn transactions(&self) -> &HashMap<Txid, ResolvedTransaction> {
        &self.transactions
    }

    pub fn transaction_ids(&self) -> HashSet<Txid> {
        self.transactions.keys().copied().collect()
    }

    /// Merge resolved transactions. An `Unfetchable` entry is terminal and never replaced.
    ///
    /// Returns true if anything changed.
    pub fn update_transactions(
        &mut self,
        resolved: impl IntoIterator<Item = (Txid, ResolvedTransaction)>,
    ) -> bool {
        let mut changed = false;
        for (txid, entry) in resolved {
            match self.transactions.get(&txid) {
                Some(ResolvedTransaction::Unfetchable) => continue,
                Some(existing) if *existing == entry => continue,
                _ => {
                    self.transactions.insert(txid, entry);
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn node_outputs(&self, node: &WalletNode) -> Option<&OwnedOutputs> {
        self.branches
            .get(&node.purpose())
            .and_then(|branch| branch.get(node.index() as usize))
    }

    /// Replace a node's outputs only if they differ. Returns true on replacement.
    pub fn update_node_outputs(&mut self, node: WalletNode, outputs: OwnedOutputs) -> bool {
        if self.node_outputs(&node) == Some(&outputs) {
            return false;
        }
        self.fill_to_index(node.purpose(), node.index());
        match self
            .branches
            .get_mut(&node.purpose())
            .and_then(|branch| branch.get_mut(node.index() as usize))
        {
            Some(slot) => {
                *slot = outputs;
                true
            }
            None => false,
        }
    }

    /// Nodes holding an output or a spend that is not yet confirmed
    pub fn mempool_nodes(&self) -> BTreeSet<WalletNode> {
        self.nodes()
            .filter(|node| {
                self.node_outputs(node).is_some_and(|outputs| {
                    outputs.values().any(|output| {
                        output.height <= 0 || output.spent_by().is_some_and(|s| s.height <= 0)
                    })
                })
            })
            .collect()
    }

    pub fn balance(&self) -> Balance {
        let mut balance = Balance::default();
        for branch in self.branches.values() {
            for output in branch.iter().flat_map(|outputs| outputs.values()) {
                if output.is_spent() {
                    continue;
                }
                if output.height > 0 {
                    balance.confirmed += output.value;
                } else {
                    balance.unconfirmed += output.value;
                }
            }
        }
        balance
    }

    /// Adopt the sync-owned state of a synced snapshot of this wallet.
    pub fn commit(&mut self, synced: &Wallet) -> WalletChanges {
        let mut changes = WalletChanges::default();

        for purpose in KeyPurpose::ALL {
            let before = self.child_count(purpose);
            let after = synced.child_count(purpose);
            if after > before {
                self.fill_to_index(purpose, after as u32 - 1);
                changes.nodes_added += after - before;
            }
        }

        if self.transactions != synced.transactions {
            self.transactions = synced.transactions.clone();
            changes.transactions_changed = true;
        }

        for node in synced.nodes() {
            if let Some(outputs) = synced.node_outputs(&node) {
                if self.update_node_outputs(node, outputs.clone()) {
                    changes.nodes_changed.push(node);
                }
            }
        }

        changes
    }
}
