//! Wallet History Sync Module
//!
//! This module provides the services that bring a wallet's history up to date from an Electrum
//! server. It is composed of several submodules, each responsible for one step of a sync pass:
//!
//! - `orchestrator`: The entry point. Takes the current session, locks the wallet, runs a pass and commits the result.
//! - `history`: Gap-limit discovery of the nodes with history and their transaction references.
//! - `resolver`: Turns references into decoded transactions with block times, or marks them unfetchable.
//! - `reconciler`: Derives each node's owned outputs and links them to the inputs spending them.
//! - `progress_tracker`: Counts the work of a pass and validates the gap-limit invariant.

/// Gap-limit history discovery
pub mod history;
/// Main coordinator for the wallet sync process
pub mod orchestrator;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Owned-output reconciliation
pub mod reconciler;
/// Reference to transaction resolution
pub mod resolver;

pub use history::{HistorySynchronizer, mempool_script_hashes};
pub use orchestrator::*;
pub use reconciler::reconcile_wallet;
pub use resolver::{ReferenceResolver, find_output_spends};
