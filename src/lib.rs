//! History sync for watch-only HD wallets over the Electrum protocol.

pub mod config;
pub mod connection;
pub mod electrum;
pub mod events;
pub mod wallet;

#[cfg(test)]
mod testing;
