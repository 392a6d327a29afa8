//! Connection lifecycle.
//!
//! The `ConnectionService` owns the connection to one Electrum server and drives it from a
//! periodic tick:
//! - While disconnected, a tick connects (starting the local bridge first for Bitcoin Core),
//!   negotiates the RPC strategy, subscribes to headers and fetches banner and fee rates
//! - While connected, a tick pings the server and refreshes fee rates once they are stale
//! - When the transport's reader has stopped, a tick tears the connection down so the next one
//!   reconnects
//!
//! The current session is published on a watch channel for the wallet sync service.

use super::bridge::{Bridge, describe_start_failure};
use super::fees::{FeeRates, FeeRatesSource, clamp_to_minimum, fee_rates_source, fetch_fee_rates, minimum_relay_fee};
use crate::config::{ConfigError, ServerConfig, ServerType};
use crate::electrum::{
    BlockHeaderTip, Connector, ElectrumError, ElectrumSession, NotificationRouter, ServerVersion,
    SubscriptionRegistry,
};
use crate::events::{EventDispatcher, SyncEvent};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Waiting for the local bridge to report ready
    Bootstrapping,
    Connecting,
    Connected,
}

/// What was learned while establishing a connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub server_version: ServerVersion,
    pub banner: String,
    /// `None` when running without subscriptions
    pub tip: Option<BlockHeaderTip>,
    pub fee_rates: FeeRates,
    /// sat/vB
    pub minimum_relay_fee: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Electrum error: {0}")]
    Electrum(#[from] ElectrumError),

    #[error("{0}")]
    Bridge(String),

    #[error("Connection cancelled")]
    Cancelled,
}

pub struct ConnectionService {
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    bridge: Option<Box<dyn Bridge>>,
    bridge_address: Option<String>,
    fee_source: Box<dyn FeeRatesSource>,
    events: EventDispatcher,
    router: Arc<NotificationRouter>,
    subscribe: bool,
    state: ConnectionState,
    session: Option<Arc<ElectrumSession>>,
    sessions: watch::Sender<Option<Arc<ElectrumSession>>>,
    fee_rates_retrieved_at: Option<Instant>,
    minimum_relay_fee: f64,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
}

impl ConnectionService {
    pub fn new(config: ServerConfig, connector: Arc<dyn Connector>, events: EventDispatcher) -> Self {
        let router = Arc::new(NotificationRouter::new(
            Arc::new(SubscriptionRegistry::new()),
            events.clone(),
        ));
        let (sessions, _) = watch::channel(None);
        let fee_source = fee_rates_source(&config);
        let subscribe = config.subscribe;

        Self {
            config,
            connector,
            bridge: None,
            bridge_address: None,
            fee_source,
            events,
            router,
            subscribe,
            state: ConnectionState::Disconnected,
            session: None,
            sessions,
            fee_rates_retrieved_at: None,
            minimum_relay_fee: super::fees::DEFAULT_MIN_RELAY_FEE,
            backoff: ExponentialBackoff {
                max_interval: Duration::from_secs(60),
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
            retry_at: None,
        }
    }

    /// Start this bridge before connecting to a Bitcoin Core server
    pub fn with_bridge(mut self, bridge: Box<dyn Bridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_fee_source(mut self, source: Box<dyn FeeRatesSource>) -> Self {
        self.fee_source = source;
        self
    }

    /// Skip header subscriptions and disconnection events, for one-shot use
    pub fn without_subscriptions(mut self) -> Self {
        self.subscribe = false;
        self
    }

    /// Receiver of the current session, `None` while disconnected
    pub fn sessions(&self) -> watch::Receiver<Option<Arc<ElectrumSession>>> {
        self.sessions.subscribe()
    }

    pub fn session(&self) -> Option<Arc<ElectrumSession>> {
        self.session.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
        self.router.subscriptions()
    }

    pub fn minimum_relay_fee(&self) -> f64 {
        self.minimum_relay_fee
    }

    /// Connect now, dispatching `Connected` on success.
    ///
    /// Fails with `Cancelled` if the shutdown signal arrives while waiting on the bridge.
    pub async fn connect_now(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<ConnectionInfo, ConnectionError> {
        match self.connect(shutdown).await {
            Ok(info) => {
                self.backoff.reset();
                self.retry_at = None;
                self.events.dispatch(SyncEvent::Connected(info.clone()));
                Ok(info)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn connect(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<ConnectionInfo, ConnectionError> {
        self.config.validate()?;
        let bridge_address = match self.config.server_type {
            ServerType::BitcoinCore => Some(self.bootstrap(shutdown).await?),
            _ => None,
        };

        self.state = ConnectionState::Connecting;
        let endpoint = self.config.endpoint(bridge_address.as_deref())?;
        let transport = self.connector.connect(&endpoint, self.router.clone()).await?;
        let session = match ElectrumSession::negotiate(transport.clone(), self.router.clone()).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let info = match self.initialize(&session).await {
            Ok(info) => info,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        info!("Connected to {}", endpoint.address);
        self.session = Some(session.clone());
        self.sessions.send_replace(Some(session));
        self.state = ConnectionState::Connected;
        Ok(info)
    }

    /// Start the bridge if needed and wait until it is ready or shutdown is signalled.
    async fn bootstrap(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<String, ConnectionError> {
        let running = self.bridge.as_ref().is_some_and(|bridge| bridge.is_running());
        if let (true, Some(address)) = (running, &self.bridge_address) {
            return Ok(address.clone());
        }

        self.state = ConnectionState::Bootstrapping;
        let ready = match self.bridge.as_mut() {
            Some(bridge) => bridge.start(),
            None => return Err(ConfigError::BitcoinCoreUnavailable.into()),
        };

        let address = tokio::select! {
            result = ready => match result {
                Ok(Ok(address)) => address,
                Ok(Err(e)) => {
                    error!("Failed to start bridge: {}", e);
                    return Err(ConnectionError::Bridge(describe_start_failure(Some(&e))));
                }
                Err(_) => return Err(ConnectionError::Bridge(describe_start_failure(None))),
            },
            _ = shutdown.recv() => {
                debug!("Shutdown while waiting for bridge");
                self.stop_bridge().await;
                return Err(ConnectionError::Cancelled);
            }
        };

        info!("Bridge ready at {}", address);
        self.bridge_address = Some(address.clone());
        Ok(address)
    }

    async fn initialize(&mut self, session: &ElectrumSession) -> Result<ConnectionInfo, ConnectionError> {
        let tip = if self.subscribe {
            self.router.subscriptions().clear();
            Some(session.subscribe_block_headers().await?)
        } else {
            None
        };

        let banner = session.rpc().get_server_banner().await?;
        let mut fee_rates = fetch_fee_rates(session, self.config.network, self.fee_source.as_ref()).await?;
        self.fee_rates_retrieved_at = Some(Instant::now());

        self.minimum_relay_fee = minimum_relay_fee(session).await?;
        clamp_to_minimum(&mut fee_rates.block_target_rates, self.minimum_relay_fee);

        Ok(ConnectionInfo {
            server_version: session.server_version().clone(),
            banner,
            tip,
            fee_rates,
            minimum_relay_fee: self.minimum_relay_fee,
        })
    }

    /// Run one scheduling step.
    ///
    /// Only `Cancelled` is returned as an error; other failures are logged and retried on a
    /// later tick.
    pub async fn tick(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), ConnectionError> {
        let Some(session) = self.session.clone() else {
            if self.retry_at.is_some_and(|at| Instant::now() < at) {
                return Ok(());
            }
            return match self.connect_now(shutdown).await {
                Ok(_) => Ok(()),
                Err(ConnectionError::Cancelled) => Err(ConnectionError::Cancelled),
                Err(e) => {
                    let delay = self.backoff.next_backoff();
                    self.retry_at = delay.map(|delay| Instant::now() + delay);
                    warn!("Connection failed, retrying in {:?}: {}", delay.unwrap_or_default(), e);
                    Ok(())
                }
            };
        };

        if !session.is_reader_alive() {
            warn!("Server reader stopped, resetting connection");
            self.reset_connection().await;
            return Ok(());
        }

        if let Err(e) = session.rpc().ping().await {
            warn!("Ping failed, resetting connection: {}", e);
            self.reset_connection().await;
            return Ok(());
        }

        if self.fee_rates_due() {
            if let Err(e) = self.refresh_fee_rates(&session).await {
                warn!("Failed to refresh fee rates: {}", e);
            }
        }
        Ok(())
    }

    fn fee_rates_due(&self) -> bool {
        self.fee_rates_retrieved_at
            .is_none_or(|at| at.elapsed() >= self.config.fee_rates_period())
    }

    async fn refresh_fee_rates(&mut self, session: &ElectrumSession) -> Result<(), ConnectionError> {
        let mut fee_rates = fetch_fee_rates(session, self.config.network, self.fee_source.as_ref()).await?;
        clamp_to_minimum(&mut fee_rates.block_target_rates, self.minimum_relay_fee);
        self.fee_rates_retrieved_at = Some(Instant::now());
        debug!("Refreshed fee rates: {:?}", fee_rates.block_target_rates);
        self.events.dispatch(SyncEvent::FeeRatesUpdated(fee_rates));
        Ok(())
    }

    /// Close the session and stop the bridge. The next tick reconnects.
    pub async fn reset_connection(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.sessions.send_replace(None);
        self.state = ConnectionState::Disconnected;
        self.fee_rates_retrieved_at = None;

        let bridge_running = self.bridge.as_ref().is_some_and(|bridge| bridge.is_running());
        if bridge_running {
            if self.stop_bridge().await && self.subscribe {
                self.events.dispatch(SyncEvent::BridgeShutdown);
            }
        } else if self.subscribe {
            self.events.dispatch(SyncEvent::Disconnected);
        }
    }

    /// Returns true if the bridge stopped cleanly
    async fn stop_bridge(&mut self) -> bool {
        self.bridge_address = None;
        let Some(bridge) = self.bridge.as_mut() else {
            return false;
        };
        match bridge.stop().await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to stop bridge: {}", e);
                false
            }
        }
    }

    pub async fn shutdown(&mut self) {
        info!("Closing connection");
        self.reset_connection().await;
    }

    /// Tick every heartbeat interval until shutdown is signalled, then close everything.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop = tokio::select! {
                _ = heartbeat.tick() => false,
                _ = shutdown.recv() => true,
            };
            if stop {
                break;
            }
            if let Err(ConnectionError::Cancelled) = self.tick(&mut shutdown).await {
                break;
            }
        }

        self.shutdown().await;
    }
}
