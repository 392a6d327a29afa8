//! Progress tracking for wallet history sync.
//!
//! This module provides the `SyncProgressTracker`, which counts the work done by one sync pass:
//! subscriptions issued, histories fetched, transactions resolved and gap-limit rounds. It also
//! validates that every branch ends with enough materialized nodes past its last used index.

use crate::wallet::model::Wallet;
use crate::wallet::types::{KeyPurpose, NodeHistory, WalletSyncError};
use crate::wallet::sync::history::required_size;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    started_at: Instant,
    /// Script hashes subscribed during this pass
    subscriptions: usize,
    /// Histories fetched and the references they carried
    histories_fetched: usize,
    references_seen: usize,
    /// Transactions resolved, split by outcome
    transactions_fetched: usize,
    transactions_unfetchable: usize,
    /// Gap-limit expansions per branch
    gap_rounds: BTreeMap<KeyPurpose, usize>,
    additional_nodes: usize,
}

impl Default for SyncProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            subscriptions: 0,
            histories_fetched: 0,
            references_seen: 0,
            transactions_fetched: 0,
            transactions_unfetchable: 0,
            gap_rounds: BTreeMap::new(),
            additional_nodes: 0,
        }
    }

    pub fn record_subscriptions(&mut self, count: usize) {
        self.subscriptions += count;
    }

    pub fn record_histories(&mut self, histories: usize, references: usize) {
        self.histories_fetched += histories;
        self.references_seen += references;
    }

    pub fn record_resolution(&mut self, fetched: usize, unfetchable: usize) {
        self.transactions_fetched += fetched;
        self.transactions_unfetchable += unfetchable;
    }

    /// Record a gap-limit expansion of a branch to `required` nodes
    pub fn record_gap_round(&mut self, purpose: KeyPurpose, required: usize) {
        let rounds = self.gap_rounds.entry(purpose).or_default();
        *rounds += 1;
        debug!("Expanding {:?} branch to {} nodes (round {})", purpose, required, rounds);
    }

    pub fn record_additional_nodes(&mut self, count: usize) {
        self.additional_nodes += count;
    }

    pub fn log_progress(&self, wallet: &Wallet) {
        info!(
            "Sync progress for {}: {} subscriptions, {} histories, {} transactions resolved",
            wallet.name(),
            self.subscriptions,
            self.histories_fetched,
            self.transactions_fetched + self.transactions_unfetchable
        );
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            elapsed: self.started_at.elapsed(),
            subscriptions: self.subscriptions,
            histories_fetched: self.histories_fetched,
            references_seen: self.references_seen,
            transactions_fetched: self.transactions_fetched,
            transactions_unfetchable: self.transactions_unfetchable,
            gap_rounds: self.gap_rounds.values().sum(),
            additional_nodes: self.additional_nodes,
        }
    }

    /// Check every branch has at least `gap_limit` unused nodes past its highest used index.
    pub fn validate_completion(&self, wallet: &Wallet, history: &NodeHistory) -> Result<(), WalletSyncError> {
        for purpose in KeyPurpose::ALL {
            let highest_used = history
                .iter()
                .filter(|(node, references)| node.purpose() == purpose && !references.is_empty())
                .map(|(node, _)| node.index())
                .max();
            let required = required_size(wallet.gap_limit(), highest_used);
            let materialized = wallet.child_count(purpose);
            if materialized < required {
                return Err(WalletSyncError::SyncError(format!(
                    "{:?} branch of {} has {} nodes but needs {}",
                    purpose,
                    wallet.name(),
                    materialized,
                    required
                )));
            }
        }
        Ok(())
    }
}

/// Statistics about one sync pass
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub elapsed: Duration,
    pub subscriptions: usize,
    pub histories_fetched: usize,
    pub references_seen: usize,
    pub transactions_fetched: usize,
    pub transactions_unfetchable: usize,
    pub gap_rounds: usize,
    pub additional_nodes: usize,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "Synced in {:.1}s: {} subscriptions, {} histories ({} references), {} transactions{}, {} gap rounds{}",
            self.elapsed.as_secs_f64(),
            self.subscriptions,
            self.histories_fetched,
            self.references_seen,
            self.transactions_fetched,
            if self.transactions_unfetchable == 0 {
                String::new()
            } else {
                format!(" ({} unfetchable)", self.transactions_unfetchable)
            },
            self.gap_rounds,
            if self.additional_nodes == 0 {
                String::new()
            } else {
                format!(", {} additional nodes", self.additional_nodes)
            }
        )
    }
}
