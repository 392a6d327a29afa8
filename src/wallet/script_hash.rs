//! Electrum script hashes.
//!
//! The server indexes history by the SHA-256 of an output script, byte-reversed and hex encoded.

use super::model::Wallet;
use super::types::{WalletNode, WalletSyncError};

use bitcoin::Script;
use bitcoin::hashes::{Hash, sha256};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptHash(String);

impl ScriptHash {
    pub fn from_script(script: &Script) -> Self {
        let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
        bytes.reverse();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Wraps a script hash as received from the server
impl From<String> for ScriptHash {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn node_script_hash(wallet: &Wallet, node: &WalletNode) -> Result<ScriptHash, WalletSyncError> {
    Ok(ScriptHash::from_script(&wallet.output_script(node)?))
}

/// Script hash of every materialized node
pub fn all_script_hashes(wallet: &Wallet) -> Result<HashMap<ScriptHash, WalletNode>, WalletSyncError> {
    wallet
        .nodes()
        .map(|node| Ok((node_script_hash(wallet, &node)?, node)))
        .collect()
}
