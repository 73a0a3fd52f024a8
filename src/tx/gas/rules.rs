//! Chain-specific fee rules, picked once from the configured chain type

use crate::chain::{Block, BlockTransaction};
use crate::config::ChainType;

/// Optimism deposit transactions carry no meaningful gas price
const OPTIMISM_DEPOSIT_TX_TYPE: u64 = 0x7e;

pub trait ChainRules: Send + Sync {
    /// Whether a block transaction should feed price estimation
    fn is_usable(&self, tx: &BlockTransaction, block: &Block) -> bool;

    /// Fee cap for a tip on the given base fee, capped at `max`
    fn fee_cap(&self, base_fee: u64, buffer_blocks: u32, tip_cap: u64, max: u64) -> u64;
}

pub fn rules_for(chain_type: ChainType) -> Box<dyn ChainRules> {
    match chain_type {
        ChainType::Ethereum => Box::new(EthereumRules),
        ChainType::Gnosis => Box::new(GnosisRules),
        ChainType::Optimism => Box::new(OptimismRules),
        ChainType::Arbitrum => Box::new(ArbitrumRules),
    }
}

/// Worst-case base fee after `buffer_blocks` full blocks (12.5% growth each), plus the tip
pub fn buffered_fee_cap(base_fee: u64, buffer_blocks: u32, tip_cap: u64, max: u64) -> u64 {
    let mut base = base_fee as u128;
    for _ in 0..buffer_blocks {
        base = base * 9 / 8;
    }
    (base + tip_cap as u128).min(max as u128) as u64
}

fn unbuffered_fee_cap(base_fee: u64, tip_cap: u64, max: u64) -> u64 {
    base_fee.saturating_add(tip_cap).min(max)
}

pub struct EthereumRules;

impl ChainRules for EthereumRules {
    fn is_usable(&self, _tx: &BlockTransaction, _block: &Block) -> bool {
        true
    }

    fn fee_cap(&self, base_fee: u64, buffer_blocks: u32, tip_cap: u64, max: u64) -> u64 {
        buffered_fee_cap(base_fee, buffer_blocks, tip_cap, max)
    }
}

/// Bridge transactions on Gnosis are free and would drag the percentile down
pub struct GnosisRules;

impl ChainRules for GnosisRules {
    fn is_usable(&self, tx: &BlockTransaction, _block: &Block) -> bool {
        let legacy = matches!(tx.tx_type, None | Some(0));
        !(legacy && tx.gas_price == Some(0))
    }

    fn fee_cap(&self, base_fee: u64, buffer_blocks: u32, tip_cap: u64, max: u64) -> u64 {
        buffered_fee_cap(base_fee, buffer_blocks, tip_cap, max)
    }
}

pub struct OptimismRules;

impl ChainRules for OptimismRules {
    fn is_usable(&self, tx: &BlockTransaction, _block: &Block) -> bool {
        tx.tx_type != Some(OPTIMISM_DEPOSIT_TX_TYPE)
    }

    fn fee_cap(&self, base_fee: u64, _buffer_blocks: u32, tip_cap: u64, max: u64) -> u64 {
        unbuffered_fee_cap(base_fee, tip_cap, max)
    }
}

pub struct ArbitrumRules;

impl ChainRules for ArbitrumRules {
    fn is_usable(&self, _tx: &BlockTransaction, _block: &Block) -> bool {
        true
    }

    fn fee_cap(&self, base_fee: u64, _buffer_blocks: u32, tip_cap: u64, max: u64) -> u64 {
        unbuffered_fee_cap(base_fee, tip_cap, max)
    }
}

/// Price a block transaction actually paid, if it can be determined
pub fn effective_gas_price(block: &Block, tx: &BlockTransaction) -> Option<u64> {
    match tx.tx_type.unwrap_or(0) {
        0x0 | 0x1 => tx.gas_price,
        0x2 | 0x3 => {
            let (Some(base), Some(tip), Some(fee_cap)) =
                (block.base_fee_per_gas, tx.max_priority_fee_per_gas, tx.max_fee_per_gas)
            else {
                return tx.gas_price;
            };
            if tx.gas_price.is_some() {
                return tx.gas_price;
            }
            if fee_cap < base || fee_cap < tip {
                return None;
            }
            Some(tip.min(fee_cap - base) + base)
        }
        _ => None,
    }
}

/// Tip a block transaction paid above the base fee
pub fn effective_tip_cap(block: &Block, tx: &BlockTransaction) -> Option<u64> {
    match tx.tx_type.unwrap_or(0) {
        0x2 | 0x3 => tx.max_priority_fee_per_gas,
        0x0 | 0x1 => tx.gas_price?.checked_sub(block.base_fee_per_gas?),
        _ => None,
    }
}
