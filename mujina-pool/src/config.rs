//! Configuration management for mujina-pool.
//!
//! Configuration is a single TOML file. [`Config::load_from`] parses and
//! validates it; address strings are checked later, when the coinbase
//! configuration is built, since that needs the chain parameters.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use strum::Display;
use tracing_subscriber::filter::LevelFilter;

use crate::chain::ChainParams;
use crate::error::{Error, Result};
use crate::job::coinbase::MAX_BRAND_LEN;
use crate::job::{CoinbaseConfig, PayoutEntry, PayoutTable, SchedulerConfig};
use crate::stratum_v1::{ServerConfig, WireCodecKind};

/// Used when no `--config` is given.
pub const DEFAULT_PATH: &str = "mujina-pool.toml";

/// Main configuration structure for the pool.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Stratum server and job configuration
    pub pool: PoolConfig,

    /// Coin node connection
    pub node: NodeConfig,

    /// Chain parameters and fixed payouts
    pub chain: ChainConfig,
}

/// Daemon process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Log level when RUST_LOG is unset
    pub log_level: Option<String>,
}

/// Proof-of-work algorithm served to miners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlgorithmKind {
    #[default]
    Sha256d,
    FiroPow,
    Mtp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Session difficulty, pool scale
    pub difficulty: f64,

    /// Address paid the block reward
    pub coinbase_address: String,

    #[serde(default = "default_brand")]
    pub block_brand: String,

    #[serde(default)]
    pub algorithm: AlgorithmKind,

    /// How messages are framed on miner connections
    #[serde(default)]
    pub wire_codec: WireCodecKind,

    #[serde(default = "default_job_update_interval")]
    pub job_update_interval_secs: u64,

    /// Fast polling for new blocks; absent or zero disables it
    #[serde(default)]
    pub block_poll_interval_ms: Option<u64>,

    /// Fee in hundredths of a percent of the pool's reward
    #[serde(default)]
    pub fee_basis_points: u16,

    #[serde(default)]
    pub fee_address: Option<String>,
}

/// Node RPC endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(flatten)]
    pub params: ChainParams,

    /// Fixed outputs added to every coinbase within their window
    #[serde(default)]
    pub payouts: Vec<PayoutEntry>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3333
}

fn default_brand() -> String {
    "/mujina-pool/".to_string()
}

fn default_job_update_interval() -> u64 {
    55
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_PATH))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Parse and validate a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;

        if !pool.difficulty.is_finite() || pool.difficulty <= 0.0 {
            return Err(Error::Config(format!(
                "pool.difficulty must be positive, got {}",
                pool.difficulty
            )));
        }
        if pool.block_brand.len() > MAX_BRAND_LEN {
            return Err(Error::Config(format!(
                "pool.block_brand is {} bytes, at most {} allowed",
                pool.block_brand.len(),
                MAX_BRAND_LEN
            )));
        }
        if pool.fee_basis_points > 10_000 {
            return Err(Error::Config(format!(
                "pool.fee_basis_points is {}, at most 10000 allowed",
                pool.fee_basis_points
            )));
        }
        if pool.fee_basis_points > 0 && pool.fee_address.is_none() {
            return Err(Error::Config(
                "pool.fee_address is required when a fee is set".into(),
            ));
        }
        if pool.job_update_interval_secs == 0 {
            return Err(Error::Config(
                "pool.job_update_interval_secs must be non-zero".into(),
            ));
        }
        if let Some(level) = &self.daemon.log_level {
            if crate::tracing::parse_level(level).is_none() {
                return Err(Error::Config(format!("unknown daemon.log_level {:?}", level)));
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> Option<LevelFilter> {
        self.daemon
            .log_level
            .as_deref()
            .and_then(crate::tracing::parse_level)
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.pool.host.clone(),
            port: self.pool.port,
            wire_codec: self.pool.wire_codec,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            refresh_interval: Duration::from_secs(self.pool.job_update_interval_secs),
            block_poll_interval: self
                .pool
                .block_poll_interval_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
        }
    }

    /// Resolve every address into a script, failing on the first bad one.
    pub fn coinbase(&self) -> Result<CoinbaseConfig> {
        let chain = self.chain.params.clone();
        let payouts = PayoutTable::new(self.chain.payouts.clone());
        payouts.validate(&chain)?;

        let fee = match (&self.pool.fee_address, self.pool.fee_basis_points) {
            (Some(address), basis_points) if basis_points > 0 => {
                Some((basis_points, address.as_str()))
            }
            _ => None,
        };

        Ok(CoinbaseConfig::new(
            chain,
            &self.pool.coinbase_address,
            fee,
            &self.pool.block_brand,
            Arc::new(payouts),
        )?)
    }
}
