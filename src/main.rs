use electrum_wallet_sync::config::{self, ConfigError, ServerType};
use electrum_wallet_sync::connection::{ConnectionError, ConnectionService, ProcessBridge, Shutdown};
use electrum_wallet_sync::electrum::TcpConnector;
use electrum_wallet_sync::events::{EventDispatcher, LoggingHandler, SyncEvent};
use electrum_wallet_sync::wallet::{SharedWallet, Wallet, WalletSyncError, WalletSyncService, all_script_hashes};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "wallet-sync.toml";

#[derive(Debug, Error)]
enum AppError {
	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Connection error: {0}")]
	Connection(#[from] ConnectionError),

	#[error("Sync error: {0}")]
	Sync(#[from] WalletSyncError),

	#[error("Connection task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() {
	let mut filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
	if let Ok(directive) = "electrum_wallet_sync=debug".parse() {
		filter = filter.add_directive(directive);
	}
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("{}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), AppError> {
	let path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
	let app_config = config::load_config(&path)?;
	info!("Loaded configuration from {}", path.display());

	let events = EventDispatcher::new(256);
	events.register_handler(Box::new(LoggingHandler));
	let shutdown = Shutdown::new();

	let connector = Arc::new(TcpConnector::new(
		app_config.server.request_timeout(),
		app_config.server.accept_invalid_certs,
	));
	let mut connection = ConnectionService::new(app_config.server.clone(), connector, events.clone());
	if app_config.server.server_type == ServerType::BitcoinCore {
		if let Some(bridge) = app_config.server.bridge.clone() {
			connection = connection.with_bridge(Box::new(ProcessBridge::new(bridge)));
		}
	}

	let mut shutdown_rx = shutdown.subscribe();
	connection.connect_now(&mut shutdown_rx).await?;
	let mut event_rx = events.subscribe();

	let sync = WalletSyncService::new(connection.sessions(), events.clone());
	let connection_task = tokio::spawn(connection.run(shutdown.subscribe()));

	let wallet: SharedWallet =
		Arc::new(RwLock::new(Wallet::from_config(&app_config.wallet, app_config.server.network)?));
	sync.sync_wallet(&wallet).await?;
	let balance = wallet.read().await.balance();
	info!("Balance: {} confirmed, {} unconfirmed", balance.confirmed, balance.unconfirmed);

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("Interrupted, shutting down");
				break;
			}
			_ = shutdown_rx.recv() => break,
			event = event_rx.recv() => match event {
				Ok(event) => {
					if let Err(e) = handle_event(&sync, &wallet, event).await {
						error!("Sync failed: {}", e);
					}
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!("Missed {} events, running a full sync", skipped);
					if let Err(e) = sync.sync_wallet(&wallet).await {
						error!("Full sync failed: {}", e);
					}
				}
				Err(broadcast::error::RecvError::Closed) => break,
			},
		}
	}

	shutdown.trigger();
	connection_task.await?;
	Ok(())
}

/// Re-sync whatever an event may have changed
async fn handle_event(sync: &WalletSyncService, wallet: &SharedWallet, event: SyncEvent) -> Result<(), WalletSyncError> {
	match event {
		SyncEvent::Connected(_) => {
			sync.sync_wallet(wallet).await?;
		}
		SyncEvent::NewBlock { .. } => {
			sync.sync_nodes(wallet, BTreeSet::new()).await?;
		}
		SyncEvent::ScriptHashStatus { script_hash, .. } => {
			let node = all_script_hashes(&*wallet.read().await)?.remove(&script_hash);
			if let Some(node) = node {
				sync.sync_nodes(wallet, BTreeSet::from([node])).await?;
			}
		}
		SyncEvent::WalletHistoryChanged { .. } => {
			let balance = wallet.read().await.balance();
			info!("Balance: {} confirmed, {} unconfirmed", balance.confirmed, balance.unconfirmed);
		}
		_ => {}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::Network;
	use bitcoin::bip32::{Xpriv, Xpub};
	use bitcoin::secp256k1::Secp256k1;
	use electrum_wallet_sync::wallet::ScriptType;
	use tokio::sync::watch;

	fn offline() -> (WalletSyncService, SharedWallet) {
		let (_, sessions) = watch::channel(None);
		let master = Xpriv::new_master(Network::Regtest, &[3; 32]).unwrap();
		let account = Xpub::from_priv(&Secp256k1::new(), &master);
		let wallet = Wallet::new("main", Network::Regtest, account, ScriptType::P2wpkh, 5);
		(WalletSyncService::new(sessions, EventDispatcher::new(4)), Arc::new(RwLock::new(wallet)))
	}

	#[tokio::test]
	async fn sync_failures_are_returned() {
		let (sync, wallet) = offline();
		let event = SyncEvent::NewBlock { height: 1, header: String::new() };
		assert!(matches!(handle_event(&sync, &wallet, event).await, Err(WalletSyncError::NotConnected)));
	}

	#[tokio::test]
	async fn other_events_need_no_sync() {
		let (sync, wallet) = offline();
		assert!(handle_event(&sync, &wallet, SyncEvent::Disconnected).await.is_ok());
	}
}
