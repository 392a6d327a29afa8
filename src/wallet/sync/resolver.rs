//! Resolution of references to transaction bodies.
//!
//! References are resolved in two steps: block headers for every confirmed height (for block
//! times), then raw transactions. A transaction the server reports as missing, or whose block
//! header cannot be retrieved, is recorded as `Unfetchable`. Every requested reference must end
//! up accounted for.

use crate::electrum::{ElectrumSession, RawTransaction};
use crate::wallet::model::Wallet;
use crate::wallet::script_hash::ScriptHash;
use crate::wallet::types::{
    BlockTransaction, ConsistencyError, NodeHistory, Reference, ReferenceSet, ResolvedTransaction,
    WalletSyncError,
};

use bitcoin::block::Header;
use bitcoin::consensus::encode::deserialize;
use bitcoin::{Transaction, Txid};
use chrono::DateTime;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use tracing::{debug, error, warn};

/// Outcome counts of one resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub fetched: usize,
    pub unfetchable: usize,
}

/// References across the history that the wallet has not resolved at the same height.
///
/// Unfetchable transactions are terminal and never requested again.
pub fn pending_references(wallet: &Wallet, history: &NodeHistory) -> ReferenceSet {
    let transactions = wallet.transactions();
    history
        .values()
        .flat_map(ReferenceSet::iter)
        .filter(|reference| match transactions.get(&reference.txid) {
            None => true,
            Some(ResolvedTransaction::Unfetchable) => false,
            Some(ResolvedTransaction::Fetched(tx)) => tx.height != reference.height,
        })
        .copied()
        .collect()
}

pub struct ReferenceResolver<'a> {
    session: &'a ElectrumSession,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(session: &'a ElectrumSession) -> Self {
        Self { session }
    }

    /// Resolve every pending reference of the history into the wallet.
    pub async fn resolve(&self, wallet: &mut Wallet, history: &NodeHistory) -> Result<ResolveStats, WalletSyncError> {
        let references = pending_references(wallet, history);
        if references.is_empty() {
            return Ok(ResolveStats::default());
        }

        let resolved = self.resolve_references(&references).await?;
        let stats = ResolveStats {
            fetched: resolved.values().filter(|tx| !tx.is_unfetchable()).count(),
            unfetchable: resolved.values().filter(|tx| tx.is_unfetchable()).count(),
        };
        if wallet.update_transactions(resolved) {
            debug!("Updated {} transactions of {}", stats.fetched + stats.unfetchable, wallet.name());
        }
        Ok(stats)
    }

    pub async fn resolve_references(
        &self,
        references: &ReferenceSet,
    ) -> Result<HashMap<Txid, ResolvedTransaction>, WalletSyncError> {
        let headers = self.get_block_headers(references).await?;
        self.get_transactions(references, &headers).await
    }

    /// Headers for every confirmed height among the references, keyed by height
    pub async fn get_block_headers(&self, references: &ReferenceSet) -> Result<BTreeMap<u32, Header>, WalletSyncError> {
        let heights: BTreeSet<u32> = references
            .iter()
            .filter(|reference| reference.is_confirmed())
            .map(|reference| reference.height as u32)
            .collect();
        if heights.is_empty() {
            return Ok(BTreeMap::new());
        }

        let raw = self.session.rpc().get_block_headers(&heights).await?;
        if raw.len() < heights.len() {
            warn!("Could not retrieve {} of {} blocks", heights.len() - raw.len(), heights.len());
        }

        let mut headers = BTreeMap::new();
        for (height, hex) in raw {
            let header: Header = hex::decode(&hex)
                .map_err(|e| e.to_string())
                .and_then(|bytes| deserialize(&bytes).map_err(|e| e.to_string()))
                .map_err(|e| WalletSyncError::ParseError(format!("block header at {height}: {e}")))?;
            headers.insert(height, header);
        }
        Ok(headers)
    }

    /// Fetch and decode transaction bodies, pairing each with its reference's context.
    pub async fn get_transactions(
        &self,
        references: &ReferenceSet,
        headers: &BTreeMap<u32, Header>,
    ) -> Result<HashMap<Txid, ResolvedTransaction>, WalletSyncError> {
        let requested: BTreeSet<Txid> = references.txids().copied().collect();
        let raw = self.session.rpc().get_transactions(&requested).await?;

        let mut unresolved = requested.clone();
        let mut resolved = HashMap::new();
        for (txid, body) in raw {
            let Some(reference) = references.get(&txid) else {
                return Err(ConsistencyError::UnrequestedTransaction(txid).into());
            };

            let hex = match body {
                RawTransaction::NotFound => {
                    resolved.insert(txid, ResolvedTransaction::Unfetchable);
                    unresolved.remove(&txid);
                    continue;
                }
                RawTransaction::Hex(hex) => hex,
            };

            let transaction = match decode_transaction(&hex) {
                Ok(transaction) => transaction,
                Err(e) => {
                    error!("Could not parse tx {}: {}", txid, e);
                    continue;
                }
            };

            unresolved.remove(&txid);
            resolved.insert(txid, resolve_with_header(reference, transaction, headers));
        }

        if !unresolved.is_empty() {
            return Err(ConsistencyError::MissingTransactions(unresolved.into_iter().collect()).into());
        }
        Ok(resolved)
    }
}

fn decode_transaction(hex: &str) -> Result<Transaction, String> {
    let bytes = hex::decode(hex).map_err(|e| e.to_string())?;
    deserialize(&bytes).map_err(|e| e.to_string())
}

fn resolve_with_header(
    reference: &Reference,
    transaction: Transaction,
    headers: &BTreeMap<u32, Header>,
) -> ResolvedTransaction {
    let block_time = if reference.is_confirmed() {
        match headers.get(&(reference.height as u32)) {
            Some(header) => DateTime::from_timestamp(i64::from(header.time), 0),
            None => return ResolvedTransaction::Unfetchable,
        }
    } else {
        None
    };

    ResolvedTransaction::Fetched(BlockTransaction {
        txid: reference.txid,
        height: reference.height,
        block_time,
        fee: reference.fee,
        transaction,
    })
}

/// For each output index in `indexes`, the transaction spending it, if any.
///
/// Only spends at or above the funding transaction's height are considered. A spend the server
/// cannot supply shows as `Unfetchable`; two different spenders of one output are a double spend.
pub async fn find_output_spends(
    session: &ElectrumSession,
    transaction: &Transaction,
    indexes: Range<usize>,
) -> Result<Vec<Option<ResolvedTransaction>>, WalletSyncError> {
    let txid = transaction.compute_txid();
    let indexes: Vec<usize> = indexes.filter(|i| *i < transaction.output.len()).collect();

    let requested: BTreeMap<String, ScriptHash> = indexes
        .iter()
        .map(|i| (i.to_string(), ScriptHash::from_script(&transaction.output[*i].script_pubkey)))
        .collect();
    let histories = session.rpc().get_script_hash_history(&requested, false).await?;

    let mut candidates: BTreeMap<usize, ReferenceSet> = BTreeMap::new();
    let mut all_references = ReferenceSet::new();
    for index in &indexes {
        let entries = match histories.get(&index.to_string()) {
            Some(entries) => entries,
            None => continue,
        };
        let references = entries
            .iter()
            .map(|entry| entry.to_reference())
            .collect::<Result<Vec<_>, _>>()?;

        let min_height = references
            .iter()
            .find(|reference| reference.txid == txid)
            .map_or(0, |reference| reference.height);
        let spends: ReferenceSet = references
            .into_iter()
            .filter(|reference| reference.txid != txid && reference.height >= min_height)
            .collect();
        all_references.extend(spends.iter().copied());
        candidates.insert(*index, spends);
    }

    let resolved = if all_references.is_empty() {
        HashMap::new()
    } else {
        ReferenceResolver::new(session).resolve_references(&all_references).await?
    };

    let mut spends = Vec::with_capacity(indexes.len());
    for index in &indexes {
        let mut spender: Option<ResolvedTransaction> = None;
        for reference in candidates.get(index).into_iter().flat_map(ReferenceSet::iter) {
            match resolved.get(&reference.txid) {
                Some(ResolvedTransaction::Unfetchable) => {
                    if spender.is_none() {
                        spender = Some(ResolvedTransaction::Unfetchable);
                    }
                }
                Some(ResolvedTransaction::Fetched(candidate)) => {
                    let spends_output = candidate.transaction.input.iter().any(|input| {
                        input.previous_output.txid == txid && input.previous_output.vout as usize == *index
                    });
                    if !spends_output {
                        continue;
                    }
                    if let Some(ResolvedTransaction::Fetched(previous)) = &spender {
                        if previous.txid != candidate.txid {
                            return Err(ConsistencyError::DoubleSpend {
                                outpoint: bitcoin::OutPoint::new(txid, *index as u32),
                                first: previous.txid,
                                second: candidate.txid,
                            }
                            .into());
                        }
                    }
                    spender = Some(ResolvedTransaction::Fetched(candidate.clone()));
                }
                None => {}
            }
        }
        spends.push(spender);
    }
    Ok(spends)
}
