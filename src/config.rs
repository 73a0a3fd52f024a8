//! Configuration management for the transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub txm: TxmConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub block_history: BlockHistoryConfig,
    pub chain: ChainConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
}

/// Lifecycle timings and limits shared by broadcaster, confirmer, resender and reaper
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TxmConfig {
    pub poll_interval_ms: u64,
    pub head_poll_interval_ms: u64,
    /// Resend attempts untouched for this long. Zero disables the resender.
    pub resend_after_threshold_secs: u64,
    pub resend_interval_secs: u64,
    /// Reap terminal transactions older than this. Zero disables the reaper.
    pub reaper_threshold_secs: u64,
    pub reaper_interval_secs: u64,
    pub finality_depth: u64,
    pub rpc_timeout_ms: u64,
    pub rpc_batch_size: usize,
    pub fanout_concurrency: usize,
    /// Zero means unlimited.
    pub max_in_flight: u64,
    /// Zero means unlimited.
    pub max_queued: u64,
    pub default_gas_limit: u64,
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            head_poll_interval_ms: 2_000,
            resend_after_threshold_secs: 60,
            resend_interval_secs: 15,
            reaper_threshold_secs: 7 * 24 * 3600,
            reaper_interval_secs: 3600,
            finality_depth: 50,
            rpc_timeout_ms: 30_000,
            rpc_batch_size: 25,
            fanout_concurrency: 16,
            max_in_flight: 16,
            max_queued: 250,
            default_gas_limit: 500_000,
        }
    }
}

impl TxmConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn resend_after(&self) -> Duration {
        Duration::from_secs(self.resend_after_threshold_secs)
    }

    pub fn reaper_threshold(&self) -> Duration {
        Duration::from_secs(self.reaper_threshold_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorMode {
    BlockHistory,
    Fixed,
    L2Suggested,
}

/// Chain family, used to pick fee rules once at construction
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Ethereum,
    Gnosis,
    Optimism,
    Arbitrum,
}

/// Gas pricing and bumping. All prices are in wei.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub mode: EstimatorMode,
    pub chain_type: ChainType,
    pub eip1559: bool,
    pub price_default: u64,
    pub price_min: u64,
    pub price_max: u64,
    pub bump_percent: u64,
    pub bump_wei: u64,
    /// Blocks an attempt must wait without a receipt before it is bumped.
    /// Zero disables bumping.
    pub bump_threshold: u64,
    /// Max transactions per address bumped on one head. Zero means unlimited.
    pub bump_tx_depth: u32,
    pub tip_cap_default: u64,
    pub tip_cap_min: u64,
    pub limit_multiplier_percent: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            mode: EstimatorMode::BlockHistory,
            chain_type: ChainType::Ethereum,
            eip1559: false,
            price_default: 20_000_000_000,
            price_min: 1_000_000_000,
            price_max: 500_000_000_000,
            bump_percent: 20,
            bump_wei: 5_000_000_000,
            bump_threshold: 3,
            bump_tx_depth: 16,
            tip_cap_default: 1_000_000_000,
            tip_cap_min: 1,
            limit_multiplier_percent: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockHistoryConfig {
    pub size: usize,
    pub percentile: u16,
    pub batch_size: usize,
    pub block_delay: u64,
    pub fee_cap_buffer_blocks: u32,
}

impl Default for BlockHistoryConfig {
    fn default() -> Self {
        Self {
            size: 8,
            percentile: 60,
            batch_size: 25,
            block_delay: 1,
            fee_cap_buffer_blocks: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding comma-separated hex private keys
    pub private_keys_env: String,
}

impl Settings {
    /// Load settings from the file named by `TXM_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    /// Load settings from an explicit path
    pub fn from_path(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.chain_id);
        }
        if self.txm.finality_depth == 0 {
            anyhow::bail!("finality_depth must be at least 1");
        }
        if self.txm.fanout_concurrency == 0 || self.txm.rpc_batch_size == 0 {
            anyhow::bail!("fanout_concurrency and rpc_batch_size must be positive");
        }

        let gas = &self.gas;
        if gas.bump_percent == 0 && gas.bump_wei == 0 {
            anyhow::bail!("bump_percent and bump_wei cannot both be zero");
        }
        if gas.price_min > gas.price_max {
            anyhow::bail!(
                "price_min ({}) is above price_max ({})",
                gas.price_min,
                gas.price_max
            );
        }
        if gas.price_default > gas.price_max {
            tracing::warn!(
                "price_default {} exceeds price_max {}, estimates will be capped",
                gas.price_default,
                gas.price_max
            );
        }

        let bh = &self.block_history;
        if gas.mode == EstimatorMode::BlockHistory {
            if bh.size == 0 || bh.batch_size == 0 {
                anyhow::bail!("block_history size and batch_size must be positive");
            }
            if bh.percentile > 100 {
                anyhow::bail!("block_history percentile must be within 0..=100");
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
