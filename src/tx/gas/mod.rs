//! # Gas Management
//!
//! Price estimation for new attempts and the bump law for stuck ones.
//!
//! Estimators are chosen once from configuration:
//! - [`block_history::BlockHistoryEstimator`]: percentile over a rolling window of blocks
//! - [`fixed::FixedPriceEstimator`]: configured defaults
//! - [`l2::L2SuggestedEstimator`]: the node's own suggestion, for roll-ups

pub mod block_history;
pub mod fixed;
pub mod l2;
pub mod rules;

pub use block_history::BlockHistoryEstimator;
pub use fixed::FixedPriceEstimator;
pub use l2::L2SuggestedEstimator;
pub use rules::{rules_for, ChainRules};

use crate::chain::{ChainClient, HeadChain};
use crate::config::{BlockHistoryConfig, EstimatorMode, GasConfig};
use crate::error::TxmResult;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Gas price of an attempt, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPrice {
    Legacy(u64),
    Eip1559 {
        max_fee_per_gas: u64,
        max_priority_fee_per_gas: u64,
    },
}

impl GasPrice {
    /// Sort key for "richest first": legacy price, or tip then fee cap
    pub fn ordering_key(&self) -> (u64, u64) {
        match self {
            Self::Legacy(p) => (*p, 0),
            Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => (*max_priority_fee_per_gas, *max_fee_per_gas),
        }
    }

    pub fn is_eip1559(&self) -> bool {
        matches!(self, Self::Eip1559 { .. })
    }

    /// Highest price per gas the attempt can pay
    pub fn max_price(&self) -> u64 {
        match self {
            Self::Legacy(p) => *p,
            Self::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

impl fmt::Display for GasPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(p) => write!(f, "legacy: {} wei", p),
            Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(
                f,
                "eip1559: max_fee={} wei, priority_fee={} wei",
                max_fee_per_gas, max_priority_fee_per_gas
            ),
        }
    }
}

/// Why a bump could not produce a usable price
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BumpError {
    #[error("bumped price of {bumped} wei would exceed configured max of {max} wei (original {original} wei), capped at {capped} wei")]
    ExceedsLimit {
        bumped: u64,
        capped: u64,
        max: u64,
        original: u64,
    },

    #[error("bumped price of {bumped} wei equals original {original} wei; increase gas bump percent or bump wei")]
    NoProgress { bumped: u64, original: u64 },

    #[error("{0} estimator does not support bumping")]
    Unsupported(&'static str),
}

/// Raise `original` by the larger of the percentage and absolute steps.
///
/// The step is applied to the greater of `original` and the `current` market
/// price.
pub fn bump_price(
    cfg: &GasConfig,
    current: Option<u64>,
    original: u64,
    max: u64,
) -> Result<u64, BumpError> {
    let base = current.map_or(original, |c| c.max(original)) as u128;
    let by_percent = base * (100 + cfg.bump_percent as u128) / 100;
    let by_wei = base + cfg.bump_wei as u128;
    let bumped = by_percent.max(by_wei);

    if bumped > max as u128 {
        return Err(BumpError::ExceedsLimit {
            bumped: bumped.min(u64::MAX as u128) as u64,
            capped: max,
            max,
            original,
        });
    }
    let bumped = bumped as u64;
    if bumped == original {
        return Err(BumpError::NoProgress { bumped, original });
    }
    Ok(bumped)
}

/// Bump a legacy gas price against the configured max
pub fn bump_legacy_price(
    cfg: &GasConfig,
    current: Option<u64>,
    original: u64,
) -> Result<u64, BumpError> {
    bump_price(cfg, current, original, cfg.price_max)
}

/// Bump both the tip and the fee cap of a dynamic fee.
///
/// The fee cap is at least what the chain rules would give the bumped tip on
/// the current base fee.
pub fn bump_dynamic_fee(
    cfg: &GasConfig,
    rules: &dyn ChainRules,
    buffer_blocks: u32,
    current_tip: Option<u64>,
    current_base_fee: Option<u64>,
    original_fee_cap: u64,
    original_tip: u64,
) -> Result<GasPrice, BumpError> {
    let tip = bump_price(cfg, current_tip, original_tip, cfg.price_max)?;

    let mut fee_cap = bump_price(cfg, None, original_fee_cap, cfg.price_max)?;
    if let Some(base) = current_base_fee {
        let from_base = rules.fee_cap(base, buffer_blocks, tip, u64::MAX);
        if from_base > cfg.price_max {
            return Err(BumpError::ExceedsLimit {
                bumped: from_base,
                capped: cfg.price_max,
                max: cfg.price_max,
                original: original_fee_cap,
            });
        }
        fee_cap = fee_cap.max(from_base);
    }

    Ok(GasPrice::Eip1559 {
        max_fee_per_gas: fee_cap.max(tip),
        max_priority_fee_per_gas: tip,
    })
}

/// Apply the configured gas limit multiplier
pub fn chain_specific_gas_limit(cfg: &GasConfig, gas_limit: u64) -> u64 {
    ((gas_limit as u128 * cfg.limit_multiplier_percent as u128) / 100).min(u64::MAX as u128) as u64
}

/// Source of prices for new and stuck attempts
#[async_trait]
pub trait GasEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Price for a new attempt, plus the chain-specific gas limit
    async fn estimate(&self, calldata: &[u8], gas_limit: u64) -> TxmResult<(GasPrice, u64)>;

    /// A price strictly above `original`, plus the chain-specific gas limit
    async fn bump(&self, original: GasPrice, gas_limit: u64) -> TxmResult<(GasPrice, u64)>;

    /// Refresh from a new head
    async fn on_new_head(&self, chain: &HeadChain) -> TxmResult<()>;
}

/// Build the configured estimator
pub fn new_estimator(
    client: Arc<dyn ChainClient>,
    gas: &GasConfig,
    history: &BlockHistoryConfig,
) -> Arc<dyn GasEstimator> {
    match gas.mode {
        EstimatorMode::BlockHistory => Arc::new(BlockHistoryEstimator::new(
            client,
            gas.clone(),
            history.clone(),
            rules_for(gas.chain_type),
        )),
        EstimatorMode::Fixed => Arc::new(FixedPriceEstimator::new(
            gas.clone(),
            rules_for(gas.chain_type),
            history.fee_cap_buffer_blocks,
        )),
        EstimatorMode::L2Suggested => Arc::new(L2SuggestedEstimator::new(client, gas.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainType;

    fn cfg() -> GasConfig {
        GasConfig {
            price_default: 30,
            price_max: 500,
            price_min: 1,
            bump_percent: 20,
            bump_wei: 5,
            ..GasConfig::default()
        }
    }

    #[test]
    fn bump_takes_larger_step() {
        assert_eq!(bump_legacy_price(&cfg(), None, 30), Ok(36));

        let wei_wins = GasConfig {
            bump_wei: 10,
            ..cfg()
        };
        assert_eq!(bump_legacy_price(&wei_wins, None, 30), Ok(40));
    }

    #[test]
    fn bump_starts_from_current_price_when_higher() {
        assert_eq!(bump_legacy_price(&cfg(), Some(100), 30), Ok(120));
        assert_eq!(bump_legacy_price(&cfg(), Some(10), 30), Ok(36));
    }

    #[test]
    fn bump_reports_exceeding_max() {
        let err = bump_legacy_price(&cfg(), None, 480).unwrap_err();
        assert_eq!(
            err,
            BumpError::ExceedsLimit {
                bumped: 576,
                capped: 500,
                max: 500,
                original: 480,
            }
        );
    }

    #[test]
    fn bump_without_progress_is_an_error() {
        let stuck = GasConfig {
            bump_percent: 0,
            bump_wei: 0,
            ..cfg()
        };
        assert_eq!(
            bump_legacy_price(&stuck, None, 30),
            Err(BumpError::NoProgress {
                bumped: 30,
                original: 30
            })
        );
    }

    #[test]
    fn dynamic_bump_raises_tip_and_fee_cap() {
        let cfg = GasConfig {
            price_max: 10_000,
            ..cfg()
        };
        let rules = rules_for(ChainType::Ethereum);

        let bumped = bump_dynamic_fee(&cfg, rules.as_ref(), 0, None, None, 200, 50).unwrap();
        assert_eq!(
            bumped,
            GasPrice::Eip1559 {
                max_fee_per_gas: 240,
                max_priority_fee_per_gas: 60,
            }
        );

        // Base fee moved up: the cap follows it
        let bumped = bump_dynamic_fee(&cfg, rules.as_ref(), 0, None, Some(1_000), 200, 50).unwrap();
        assert_eq!(
            bumped,
            GasPrice::Eip1559 {
                max_fee_per_gas: 1_060,
                max_priority_fee_per_gas: 60,
            }
        );
    }

    #[test]
    fn richest_attempt_orders_first() {
        let mut prices = vec![
            GasPrice::Legacy(10),
            GasPrice::Legacy(30),
            GasPrice::Legacy(20),
        ];
        prices.sort_by(|a, b| b.ordering_key().cmp(&a.ordering_key()));
        assert_eq!(prices[0], GasPrice::Legacy(30));
    }

    #[test]
    fn applies_limit_multiplier() {
        let cfg = GasConfig {
            limit_multiplier_percent: 150,
            ..GasConfig::default()
        };
        assert_eq!(chain_specific_gas_limit(&cfg, 21_000), 31_500);
    }
}
