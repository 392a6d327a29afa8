use crate::electrum::ElectrumError;

use bitcoin::{Amount, OutPoint, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Branch of an account's derivation tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPurpose {
	Receive,
	Change,
}

impl KeyPurpose {
	pub const ALL: [KeyPurpose; 2] = [KeyPurpose::Receive, KeyPurpose::Change];

	/// Child number of the branch under the account key
	pub fn child_number(self) -> u32 {
		match self {
			KeyPurpose::Receive => 0,
			KeyPurpose::Change => 1,
		}
	}
}

/// A leaf key of the wallet, addressed by branch and index.
///
/// Ordering follows the derivation path: all receive nodes sort before change nodes, and
/// indices compare numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletNode {
	purpose: KeyPurpose,
	index: u32,
}

impl WalletNode {
	pub fn new(purpose: KeyPurpose, index: u32) -> Self {
		Self { purpose, index }
	}

	pub fn purpose(&self) -> KeyPurpose {
		self.purpose
	}

	pub fn index(&self) -> u32 {
		self.index
	}

	/// Path relative to the account key, e.g. `m/0/5`
	pub fn derivation_path(&self) -> String {
		format!("m/{}/{}", self.purpose.child_number(), self.index)
	}
}

impl fmt::Display for WalletNode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.derivation_path())
	}
}

/// A server-reported occurrence of a transaction touching a script hash.
///
/// Heights follow the Electrum convention: positive for confirmed, zero or negative for
/// mempool entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
	pub txid: Txid,
	pub height: i32,
	pub fee: Option<u64>,
}

impl Reference {
	pub fn new(txid: Txid, height: i32, fee: Option<u64>) -> Self {
		Self { txid, height, fee }
	}

	pub fn is_confirmed(&self) -> bool {
		self.height > 0
	}
}

/// References for one node, unique by txid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
	by_txid: BTreeMap<Txid, Reference>,
}

impl ReferenceSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a reference, keeping the higher height when the txid is already present.
	///
	/// Returns true if the set changed.
	pub fn insert(&mut self, reference: Reference) -> bool {
		match self.by_txid.get(&reference.txid) {
			Some(existing) if existing.height >= reference.height => false,
			_ => {
				self.by_txid.insert(reference.txid, reference);
				true
			}
		}
	}

	pub fn get(&self, txid: &Txid) -> Option<&Reference> {
		self.by_txid.get(txid)
	}

	pub fn contains(&self, txid: &Txid) -> bool {
		self.by_txid.contains_key(txid)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Reference> {
		self.by_txid.values()
	}

	pub fn txids(&self) -> impl Iterator<Item = &Txid> {
		self.by_txid.keys()
	}

	pub fn len(&self) -> usize {
		self.by_txid.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_txid.is_empty()
	}
}

impl FromIterator<Reference> for ReferenceSet {
	fn from_iter<I: IntoIterator<Item = Reference>>(iter: I) -> Self {
		let mut set = ReferenceSet::new();
		set.extend(iter);
		set
	}
}

impl Extend<Reference> for ReferenceSet {
	fn extend<I: IntoIterator<Item = Reference>>(&mut self, iter: I) {
		for reference in iter {
			self.insert(reference);
		}
	}
}

/// Merge freshly fetched references into an existing set.
///
/// For a txid present on both sides the higher height wins, so a confirmation supersedes a
/// mempool sighting and a reorg to a higher block supersedes the older height.
pub fn merge_references<I>(existing: &ReferenceSet, incoming: I) -> ReferenceSet
where
	I: IntoIterator<Item = Reference>,
{
	let mut merged = existing.clone();
	merged.extend(incoming);
	merged
}

/// Per-node reference history for one sync pass
pub type NodeHistory = BTreeMap<WalletNode, ReferenceSet>;

/// A decoded transaction with its confirmation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
	pub txid: Txid,
	pub height: i32,
	pub block_time: Option<DateTime<Utc>>,
	pub fee: Option<u64>,
	pub transaction: Transaction,
}

/// Outcome of resolving a reference to its transaction body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTransaction {
	Fetched(BlockTransaction),
	/// The server does not have the transaction, or its block header could not be retrieved.
	Unfetchable,
}

impl ResolvedTransaction {
	pub fn is_unfetchable(&self) -> bool {
		matches!(self, ResolvedTransaction::Unfetchable)
	}

	pub fn block_transaction(&self) -> Option<&BlockTransaction> {
		match self {
			ResolvedTransaction::Fetched(tx) => Some(tx),
			ResolvedTransaction::Unfetchable => None,
		}
	}
}

/// The input that consumed an owned output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendingInput {
	pub txid: Txid,
	pub input_index: u32,
	pub height: i32,
	pub block_time: Option<DateTime<Utc>>,
	pub fee: Option<u64>,
}

/// An output paying one of the wallet's scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedOutput {
	pub outpoint: OutPoint,
	pub height: i32,
	pub block_time: Option<DateTime<Utc>>,
	pub fee: Option<u64>,
	pub value: Amount,
	spent_by: Option<SpendingInput>,
}

impl OwnedOutput {
	pub fn new(
		outpoint: OutPoint,
		height: i32,
		block_time: Option<DateTime<Utc>>,
		fee: Option<u64>,
		value: Amount,
	) -> Self {
		Self { outpoint, height, block_time, fee, value, spent_by: None }
	}

	pub fn spent_by(&self) -> Option<&SpendingInput> {
		self.spent_by.as_ref()
	}

	pub fn is_spent(&self) -> bool {
		self.spent_by.is_some()
	}

	/// Link the spending input. A different spender than the one already linked is a
	/// double spend.
	pub fn set_spent_by(&mut self, spending: SpendingInput) -> Result<(), ConsistencyError> {
		match &self.spent_by {
			Some(existing) if existing.txid != spending.txid => Err(ConsistencyError::DoubleSpend {
				outpoint: self.outpoint,
				first: existing.txid,
				second: spending.txid,
			}),
			_ => {
				self.spent_by = Some(spending);
				Ok(())
			}
		}
	}
}

/// Owned outputs of one node, keyed by outpoint
pub type OwnedOutputs = BTreeMap<OutPoint, OwnedOutput>;

/// Violations of the consistency checks run after fetching
#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
	#[error("Could not retrieve transactions {}", .0.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", "))]
	MissingTransactions(Vec<Txid>),

	#[error("Server returned transaction {0} that was not requested")]
	UnrequestedTransaction(Txid),

	#[error("Did not retrieve transaction for hash {0}")]
	UnresolvedReference(Txid),

	#[error("Could not retrieve transaction for hash {0}")]
	UnfetchableReference(Txid),

	#[error("Found spent transaction output {0} but no record of receiving it")]
	SpendWithoutReceive(OutPoint),

	#[error("Double spend detected on {outpoint}: spent by {first} and {second}")]
	DoubleSpend { outpoint: OutPoint, first: Txid, second: Txid },
}

/// Error types for wallet history sync
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Electrum error: {0}")]
	ElectrumError(#[from] ElectrumError),

	#[error("Consistency error: {0}")]
	ConsistencyError(#[from] ConsistencyError),

	#[error("Derivation error: {0}")]
	DerivationError(#[from] bitcoin::bip32::Error),

	#[error("Transaction parse error: {0}")]
	ParseError(String),

	#[error("Not connected to an Electrum server")]
	NotConnected,

	#[error("Broadcast returned txid {received}, expected {expected}")]
	BroadcastMismatch { expected: Txid, received: Txid },

	#[error("Sync error: {0}")]
	SyncError(String),
}
