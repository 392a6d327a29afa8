//! Connection lifecycle management
//!
//! This module keeps a session to the configured Electrum server alive, optionally behind a local
//! bridge process, and keeps fee-rate estimates fresh.

/// Local bridge processes for Bitcoin Core backends
pub mod bridge;
/// Fee estimates and external fee-rate sources
pub mod fees;
/// Connection state machine
pub mod service;
/// Cooperative shutdown signal
pub mod shutdown;

pub use bridge::{Bridge, BridgeError, ProcessBridge, describe_start_failure};
pub use fees::{FeeRates, FeeRatesSource, MempoolSpace, ServerFeeRates, fetch_fee_rates};
pub use service::{ConnectionError, ConnectionInfo, ConnectionService, ConnectionState};
pub use shutdown::Shutdown;
