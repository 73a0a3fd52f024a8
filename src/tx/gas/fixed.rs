//! Fixed-price estimator using the configured defaults

use super::rules::ChainRules;
use super::{bump_dynamic_fee, bump_legacy_price, chain_specific_gas_limit, GasEstimator, GasPrice};
use crate::chain::HeadChain;
use crate::config::GasConfig;
use crate::error::TxmResult;

use async_trait::async_trait;

pub struct FixedPriceEstimator {
    gas: GasConfig,
    rules: Box<dyn ChainRules>,
    buffer_blocks: u32,
}

impl FixedPriceEstimator {
    pub fn new(gas: GasConfig, rules: Box<dyn ChainRules>, buffer_blocks: u32) -> Self {
        Self {
            gas,
            rules,
            buffer_blocks,
        }
    }
}

#[async_trait]
impl GasEstimator for FixedPriceEstimator {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn estimate(&self, _calldata: &[u8], gas_limit: u64) -> TxmResult<(GasPrice, u64)> {
        let limit = chain_specific_gas_limit(&self.gas, gas_limit);
        let price = if self.gas.eip1559 {
            GasPrice::Eip1559 {
                max_fee_per_gas: self.gas.price_max,
                max_priority_fee_per_gas: self.gas.tip_cap_default,
            }
        } else {
            GasPrice::Legacy(self.gas.price_default.min(self.gas.price_max))
        };
        Ok((price, limit))
    }

    async fn bump(&self, original: GasPrice, gas_limit: u64) -> TxmResult<(GasPrice, u64)> {
        let limit = chain_specific_gas_limit(&self.gas, gas_limit);
        let bumped = match original {
            GasPrice::Legacy(price) => GasPrice::Legacy(bump_legacy_price(
                &self.gas,
                Some(self.gas.price_default),
                price,
            )?),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => bump_dynamic_fee(
                &self.gas,
                self.rules.as_ref(),
                self.buffer_blocks,
                Some(self.gas.tip_cap_default),
                None,
                max_fee_per_gas,
                max_priority_fee_per_gas,
            )?,
        };
        Ok((bumped, limit))
    }

    async fn on_new_head(&self, _chain: &HeadChain) -> TxmResult<()> {
        Ok(())
    }
}
