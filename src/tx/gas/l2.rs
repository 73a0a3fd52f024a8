//! Estimator for roll-ups whose node suggests the price to pay

use super::{chain_specific_gas_limit, BumpError, GasEstimator, GasPrice};
use crate::chain::{ChainClient, HeadChain};
use crate::config::GasConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct L2SuggestedEstimator {
    client: Arc<dyn ChainClient>,
    gas: GasConfig,
    price: RwLock<Option<u64>>,
}

impl L2SuggestedEstimator {
    pub fn new(client: Arc<dyn ChainClient>, gas: GasConfig) -> Self {
        Self {
            client,
            gas,
            price: RwLock::new(None),
        }
    }

    async fn refresh(&self) -> TxmResult<u64> {
        let price = self.client.suggest_gas_price().await?;
        debug!(price, "Refreshed suggested gas price");
        *self.price.write().await = Some(price);
        Ok(price)
    }
}

#[async_trait]
impl GasEstimator for L2SuggestedEstimator {
    fn name(&self) -> &'static str {
        "l2_suggested"
    }

    async fn estimate(&self, _calldata: &[u8], gas_limit: u64) -> TxmResult<(GasPrice, u64)> {
        if self.gas.eip1559 {
            return Err(TxmError::GasEstimation(
                "l2_suggested estimator only supports legacy prices".to_string(),
            ));
        }
        let cached = *self.price.read().await;
        let price = match cached {
            Some(p) => p,
            None => self.refresh().await?,
        };
        Ok((
            GasPrice::Legacy(price.min(self.gas.price_max)),
            chain_specific_gas_limit(&self.gas, gas_limit),
        ))
    }

    async fn bump(&self, _original: GasPrice, _gas_limit: u64) -> TxmResult<(GasPrice, u64)> {
        Err(BumpError::Unsupported("l2_suggested").into())
    }

    async fn on_new_head(&self, _chain: &HeadChain) -> TxmResult<()> {
        self.refresh().await.map(|_| ())
    }
}
