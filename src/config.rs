//! Configuration loading and server endpoint resolution.
//!
//! The configuration is a TOML file with a `[server]` table describing how to reach an Electrum
//! server (directly, or through a local bridge in front of Bitcoin Core) and a `[wallet]` table
//! describing the watch-only account to sync.

use crate::wallet::ScriptType;

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port used when a proxy is given without one
pub const DEFAULT_PROXY_PORT: u16 = 9050;
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Electrum server URL not specified")]
    ServerNotSpecified,

    #[error("Electrum server URL must start with tcp:// or ssl://: {0}")]
    InvalidServerUrl(String),

    #[error("Electrum server certificate file not found: {}", .0.display())]
    CertificateNotFound(PathBuf),

    #[error("Proxy enabled but not specified")]
    ProxyNotSpecified,

    #[error("Invalid proxy address: {0}")]
    InvalidProxy(String),

    #[error("Could not connect to Bitcoin Core RPC")]
    BitcoinCoreUnavailable,

    #[error("Invalid wallet: {0}")]
    InvalidWallet(String),
}

/// How the Electrum server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    #[default]
    PublicElectrum,
    Electrum,
    /// Through a local bridge process that serves Electrum for a Bitcoin Core node
    BitcoinCore,
}

/// Where block-target fee rates come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRatesSourceKind {
    /// Server estimates only
    Server,
    #[default]
    MempoolSpace,
}

/// Command that starts the local bridge and the stdout marker preceding its Electrum address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
}

fn default_ready_marker() -> String {
    "Electrum RPC server running on".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_type: ServerType,
    pub public_electrum_server: Option<String>,
    pub electrum_server: Option<String>,
    pub electrum_server_cert: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub use_proxy: bool,
    pub proxy_server: Option<String>,
    pub network: Network,
    pub fee_rates_source: FeeRatesSourceKind,
    pub mempool_space_url: String,
    pub bridge: Option<BridgeConfig>,
    pub heartbeat_secs: u64,
    pub fee_rates_period_secs: u64,
    pub request_timeout_secs: u64,
    /// Subscribe to headers and script hashes; disable for one-shot queries
    pub subscribe: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_type: ServerType::default(),
            public_electrum_server: Some("ssl://electrum.blockstream.info:50002".to_string()),
            electrum_server: None,
            electrum_server_cert: None,
            accept_invalid_certs: false,
            use_proxy: false,
            proxy_server: None,
            network: Network::Bitcoin,
            fee_rates_source: FeeRatesSourceKind::default(),
            mempool_space_url: "https://mempool.space/api/v1/fees/recommended".to_string(),
            bridge: None,
            heartbeat_secs: 10,
            fee_rates_period_secs: 30,
            request_timeout_secs: 30,
            subscribe: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub name: String,
    /// Account-level extended public key
    pub xpub: String,
    #[serde(default)]
    pub script_type: ScriptType,
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub wallet: WalletConfig,
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wallet.gap_limit == 0 {
            return Err(ConfigError::InvalidWallet("gap_limit must be positive".to_string()));
        }
        self.server.validate()
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    AppConfig::from_toml(&content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ssl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Parse `tcp://host:port` or `ssl://host:port`
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let (protocol, rest) = if let Some(rest) = url.strip_prefix("tcp://") {
            (Protocol::Tcp, rest)
        } else if let Some(rest) = url.strip_prefix("ssl://") {
            (Protocol::Ssl, rest)
        } else {
            return Err(ConfigError::InvalidServerUrl(url.to_string()));
        };

        let (host, port) = split_host_port(rest)
            .ok_or_else(|| ConfigError::InvalidServerUrl(url.to_string()))?;
        Ok(Self { protocol, host, port })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    /// Parse `host[:port]`, defaulting to the Tor SOCKS port
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidProxy(value.to_string());
        let value = value.trim().trim_end_matches('/');
        if !value.contains(':') {
            if value.is_empty() {
                return Err(invalid());
            }
            return Ok(Self { host: value.to_string(), port: DEFAULT_PROXY_PORT });
        }

        let (host, port) = split_host_port(value).ok_or_else(invalid)?;
        Ok(Self { host, port })
    }
}

fn split_host_port(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.trim_end_matches('/').rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Everything a connector needs to open a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub address: ServerAddress,
    pub certificate: Option<PathBuf>,
    pub proxy: Option<ProxyAddress>,
}

impl ServerConfig {
    /// Check settings that do not depend on a running bridge
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy()?;
        match self.server_type {
            ServerType::PublicElectrum => {
                let url = self.public_electrum_server.as_deref().ok_or(ConfigError::ServerNotSpecified)?;
                ServerAddress::parse(url)?;
            }
            ServerType::Electrum => {
                let url = self.electrum_server.as_deref().ok_or(ConfigError::ServerNotSpecified)?;
                ServerAddress::parse(url)?;
                if let Some(cert) = &self.electrum_server_cert {
                    if !cert.exists() {
                        return Err(ConfigError::CertificateNotFound(cert.clone()));
                    }
                }
            }
            ServerType::BitcoinCore => {
                if self.bridge.is_none() {
                    return Err(ConfigError::BitcoinCoreUnavailable);
                }
            }
        }
        Ok(())
    }

    pub fn proxy(&self) -> Result<Option<ProxyAddress>, ConfigError> {
        if !self.use_proxy {
            return Ok(None);
        }
        let proxy = self.proxy_server.as_deref().ok_or(ConfigError::ProxyNotSpecified)?;
        ProxyAddress::parse(proxy).map(Some)
    }

    /// Resolve the endpoint to connect to.
    ///
    /// `bridge_address` is the `host:port` the bridge reported, required for Bitcoin Core.
    pub fn endpoint(&self, bridge_address: Option<&str>) -> Result<ServerEndpoint, ConfigError> {
        match self.server_type {
            ServerType::PublicElectrum => {
                let url = self.public_electrum_server.as_deref().ok_or(ConfigError::ServerNotSpecified)?;
                Ok(ServerEndpoint {
                    address: ServerAddress::parse(url)?,
                    certificate: None,
                    proxy: self.proxy()?,
                })
            }
            ServerType::Electrum => {
                let url = self.electrum_server.as_deref().ok_or(ConfigError::ServerNotSpecified)?;
                let certificate = match &self.electrum_server_cert {
                    Some(cert) if !cert.exists() => {
                        return Err(ConfigError::CertificateNotFound(cert.clone()));
                    }
                    other => other.clone(),
                };
                Ok(ServerEndpoint {
                    address: ServerAddress::parse(url)?,
                    certificate,
                    proxy: self.proxy()?,
                })
            }
            ServerType::BitcoinCore => {
                let address = bridge_address.ok_or(ConfigError::BitcoinCoreUnavailable)?;
                Ok(ServerEndpoint {
                    address: ServerAddress::parse(&format!("tcp://{address}"))?,
                    certificate: None,
                    proxy: None,
                })
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn fee_rates_period(&self) -> Duration {
        Duration::from_secs(self.fee_rates_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
