//! Electrum protocol client
//!
//! This module provides the transport, RPC strategies and per-connection session used to talk to
//! an Electrum server over newline-delimited JSON-RPC.

/// Per-connection session and notification routing
mod session;
/// Script-hash subscription bookkeeping
mod subscriptions;
/// Simple and batched RPC strategies
pub mod rpc;
/// Socket transport and connectors
pub mod transport;
/// Wire types and errors
mod types;

pub use rpc::{BatchedRpc, ElectrumRpc, SimpleRpc, supports_batching};
pub use session::{CLIENT_NAME, ElectrumSession, NotificationRouter, SUPPORTED_VERSIONS};
pub use subscriptions::SubscriptionRegistry;
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};
pub use types::*;
