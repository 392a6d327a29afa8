//! Fee-rate estimates.
//!
//! Server estimates arrive in BTC/kB and are converted to sat/vB. On mainnet they can be adjusted
//! by an external source of recommended fees.

use crate::config::{FeeRatesSourceKind, ProxyAddress, ServerConfig};
use crate::electrum::{ElectrumError, ElectrumSession, MempoolRateSize};

use async_trait::async_trait;
use bitcoin::{Amount, Network};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Block targets estimated on every refresh
pub const TARGET_BLOCKS_RANGE: [u16; 8] = [1, 2, 3, 4, 5, 10, 25, 50];
/// sat/vB, used when the server does not report a relay fee
pub const DEFAULT_MIN_RELAY_FEE: f64 = 1.0;
/// Pseudo block target under which an external minimum fee is stored
pub const MINIMUM_FEE_TARGET: u16 = u16::MAX;

const BLOCKS_IN_HALF_HOUR: u16 = 3;
const BLOCKS_IN_HOUR: u16 = 6;
const BLOCKS_IN_TWO_HOURS: u16 = 12;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeRates {
    /// sat/vB per block target
    pub block_target_rates: BTreeMap<u16, f64>,
    pub mempool_rate_sizes: Vec<MempoolRateSize>,
}

/// Convert a BTC/kB estimate to sat/vB. Negative estimates mean "unknown" and become 1 sat/vB.
pub fn btc_per_kb_to_sats_per_vbyte(rate: f64) -> f64 {
    let sats_per_kb = (rate * Amount::ONE_BTC.to_sat() as f64) as i64;
    let sats_per_kb = if sats_per_kb < 0 { 1_000 } else { sats_per_kb };
    sats_per_kb as f64 / 1_000.0
}

/// Raise every rate to at least `minimum`
pub fn clamp_to_minimum(rates: &mut BTreeMap<u16, f64>, minimum: f64) {
    for rate in rates.values_mut() {
        if *rate < minimum {
            *rate = minimum;
        }
    }
}

/// Recommended fees as published by mempool.space and compatible services
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreeTierRates {
    pub fastest_fee: f64,
    pub half_hour_fee: f64,
    pub hour_fee: f64,
    #[serde(default)]
    pub minimum_fee: Option<f64>,
}

/// Map three-tier recommendations onto the server's block targets.
///
/// Rates never increase with the block target. The minimum fee, if any, is stored under
/// [`MINIMUM_FEE_TARGET`].
pub fn three_tier_fee_rates(server_rates: &BTreeMap<u16, f64>, tiers: &ThreeTierRates) -> BTreeMap<u16, f64> {
    let mut rates = BTreeMap::new();
    let mut last_rate: Option<f64> = None;

    for (&target, &server_rate) in server_rates {
        let mut rate = if target < BLOCKS_IN_HALF_HOUR {
            tiers.fastest_fee
        } else if target < BLOCKS_IN_HOUR {
            tiers.half_hour_fee
        } else if target < BLOCKS_IN_TWO_HOURS || server_rate > tiers.hour_fee {
            tiers.hour_fee
        } else {
            match tiers.minimum_fee {
                Some(minimum) if server_rate < minimum => {
                    let premium = if tiers.hour_fee > minimum { tiers.hour_fee * 0.2 } else { 0.0 };
                    minimum + premium
                }
                _ => server_rate,
            }
        };

        if let Some(last) = last_rate {
            rate = rate.min(last);
        }
        rates.insert(target, rate);
        last_rate = Some(rate);
    }

    if let Some(minimum) = tiers.minimum_fee {
        rates.insert(MINIMUM_FEE_TARGET, minimum);
    }
    rates
}

/// Post-processor for server fee estimates
#[async_trait]
pub trait FeeRatesSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rates to overlay on the server estimates. Empty when the source has nothing to add.
    async fn block_target_rates(&self, server_rates: &BTreeMap<u16, f64>) -> BTreeMap<u16, f64>;
}

/// Uses the server estimates unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerFeeRates;

#[async_trait]
impl FeeRatesSource for ServerFeeRates {
    fn name(&self) -> &'static str {
        "Server"
    }

    async fn block_target_rates(&self, _server_rates: &BTreeMap<u16, f64>) -> BTreeMap<u16, f64> {
        BTreeMap::new()
    }
}

/// Three-tier recommended fees fetched over HTTP
#[derive(Debug, Clone)]
pub struct MempoolSpace {
    client: reqwest::Client,
    url: String,
}

impl MempoolSpace {
    pub fn new(url: impl Into<String>, proxy: Option<&ProxyAddress>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(format!("socks5h://{}:{}", proxy.host, proxy.port))?);
        }
        Ok(Self { client: builder.build()?, url: url.into() })
    }

    async fn fetch(&self) -> Result<ThreeTierRates, reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl FeeRatesSource for MempoolSpace {
    fn name(&self) -> &'static str {
        "mempool.space"
    }

    async fn block_target_rates(&self, server_rates: &BTreeMap<u16, f64>) -> BTreeMap<u16, f64> {
        match self.fetch().await {
            Ok(tiers) => {
                debug!("Recommended fees from {}: {:?}", self.url, tiers);
                three_tier_fee_rates(server_rates, &tiers)
            }
            Err(e) => {
                warn!("Error retrieving recommended fee rates from {}: {}", self.url, e);
                BTreeMap::new()
            }
        }
    }
}

/// Build the configured fee source, falling back to server estimates if it cannot be set up.
pub fn fee_rates_source(config: &ServerConfig) -> Box<dyn FeeRatesSource> {
    match config.fee_rates_source {
        FeeRatesSourceKind::Server => Box::new(ServerFeeRates),
        FeeRatesSourceKind::MempoolSpace => {
            let proxy = config.proxy().ok().flatten();
            match MempoolSpace::new(config.mempool_space_url.clone(), proxy.as_ref(), config.request_timeout()) {
                Ok(source) => Box::new(source),
                Err(e) => {
                    warn!("Could not set up {} fee rates, using server estimates: {}", config.mempool_space_url, e);
                    Box::new(ServerFeeRates)
                }
            }
        }
    }
}

/// Fetch estimates for every target in [`TARGET_BLOCKS_RANGE`] and the mempool histogram.
///
/// The external source is only consulted on mainnet.
pub async fn fetch_fee_rates(
    session: &ElectrumSession,
    network: Network,
    source: &dyn FeeRatesSource,
) -> Result<FeeRates, ElectrumError> {
    let estimates = session.rpc().get_fee_estimates(&TARGET_BLOCKS_RANGE).await?;
    let mut block_target_rates: BTreeMap<u16, f64> = estimates
        .into_iter()
        .map(|(target, rate)| (target, btc_per_kb_to_sats_per_vbyte(rate)))
        .collect();

    if network == Network::Bitcoin {
        let adjusted = source.block_target_rates(&block_target_rates).await;
        debug!("{} adjusted {} fee targets", source.name(), adjusted.len());
        block_target_rates.extend(adjusted);
    }

    let mempool_rate_sizes = session.rpc().get_fee_rate_histogram().await?;
    Ok(FeeRates { block_target_rates, mempool_rate_sizes })
}

/// Minimum relay fee in sat/vB
pub async fn minimum_relay_fee(session: &ElectrumSession) -> Result<f64, ElectrumError> {
    Ok(match session.rpc().get_minimum_relay_fee().await? {
        Some(rate) => (rate * Amount::ONE_BTC.to_sat() as f64) as i64 as f64 / 1_000.0,
        None => DEFAULT_MIN_RELAY_FEE,
    })
}
