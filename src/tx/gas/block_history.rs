//! Percentile gas estimation over a rolling window of recent blocks

use super::rules::{effective_gas_price, effective_tip_cap, ChainRules};
use super::{bump_dynamic_fee, bump_legacy_price, chain_specific_gas_limit, GasEstimator, GasPrice};
use crate::chain::{BatchRequest, BatchResponse, Block, ChainClient, HeadChain};
use crate::config::{BlockHistoryConfig, GasConfig};
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct HistoryState {
    /// Ascending by number
    blocks: Vec<Block>,
    gas_price: Option<u64>,
    tip_cap: Option<u64>,
    base_fee: Option<u64>,
}

pub struct BlockHistoryEstimator {
    client: Arc<dyn ChainClient>,
    gas: GasConfig,
    history: BlockHistoryConfig,
    rules: Box<dyn ChainRules>,
    state: RwLock<HistoryState>,
}

impl BlockHistoryEstimator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        gas: GasConfig,
        history: BlockHistoryConfig,
        rules: Box<dyn ChainRules>,
    ) -> Self {
        Self {
            client,
            gas,
            history,
            rules,
            state: RwLock::new(HistoryState::default()),
        }
    }

    /// Numbers of the blocks currently held, ascending
    pub async fn block_numbers(&self) -> Vec<i64> {
        self.state.read().await.blocks.iter().map(|b| b.number).collect()
    }

    pub async fn gas_price(&self) -> Option<u64> {
        self.state.read().await.gas_price
    }

    pub async fn tip_cap(&self) -> Option<u64> {
        self.state.read().await.tip_cap
    }

    /// Refill the window behind `chain`'s head.
    ///
    /// Held blocks older than the chain's earliest ancestor are assumed final.
    /// Newer ones are kept only while their hash is still on the chain.
    pub async fn fetch_blocks(&self, chain: &HeadChain) -> TxmResult<()> {
        let size = self.history.size as i64;
        if size <= 0 {
            return Err(TxmError::GasEstimation(
                "block history size must be > 0".to_string(),
            ));
        }
        let delay = self.history.block_delay as i64;
        let highest = chain.number() - delay;
        if highest < 0 {
            return Err(TxmError::GasEstimation(format!(
                "cannot fetch history: head {} is lower than block delay {}",
                chain.number(),
                delay
            )));
        }
        let lowest = (chain.number() - size - delay + 1).max(0);
        let earliest = chain.earliest().number;

        let mut blocks: BTreeMap<i64, Block> = self
            .state
            .read()
            .await
            .blocks
            .iter()
            .filter(|b| b.number < earliest || chain.is_in_chain(b.hash))
            .map(|b| (b.number, b.clone()))
            .collect();

        // Newest first so a timeout still leaves the most recent blocks
        let requests: Vec<BatchRequest> = (lowest..=highest)
            .rev()
            .filter(|n| !blocks.contains_key(n))
            .map(BatchRequest::BlockByNumber)
            .collect();
        debug!(
            fetching = requests.len(),
            held = blocks.len(),
            head = chain.number(),
            "Fetching block history"
        );

        let batch_size = if self.history.batch_size == 0 {
            requests.len().max(1)
        } else {
            self.history.batch_size
        };
        let mut missing = Vec::new();
        for chunk in requests.chunks(batch_size) {
            let responses = match self.client.batch_call(chunk.to_vec()).await {
                Ok(r) => r,
                Err(TxmError::Timeout { .. }) => {
                    warn!(head = chain.number(), "Block history batch timed out, using what was loaded");
                    break;
                }
                Err(e) => return Err(e),
            };

            for (request, response) in chunk.iter().zip(responses) {
                let number = match request {
                    BatchRequest::BlockByNumber(n) => *n,
                    BatchRequest::Receipt(_) => continue,
                };
                match response {
                    BatchResponse::Block(Ok(Some(block))) => {
                        if block.hash.is_zero() {
                            warn!(number, "Block was missing hash");
                            continue;
                        }
                        blocks.insert(block.number, block);
                    }
                    BatchResponse::Block(Ok(None)) => missing.push(number),
                    BatchResponse::Block(Err(e)) => {
                        warn!(number, head = chain.number(), "Failed to fetch block: {}", e)
                    }
                    BatchResponse::Receipt(_) => {
                        return Err(TxmError::InvariantViolation(format!(
                            "receipt response for block request {}",
                            number
                        )))
                    }
                }
            }
        }
        if missing.len() > 1 {
            warn!(
                ?missing,
                head = chain.number(),
                "Node returned several missing blocks; consider raising the block delay"
            );
        }

        let mut history: Vec<Block> = blocks.into_values().collect();
        let start = history.len().saturating_sub(self.history.size);
        history.drain(..start);

        let mut state = self.state.write().await;
        state.base_fee = history.last().and_then(|b| b.base_fee_per_gas);
        state.blocks = history;
        Ok(())
    }

    /// Recompute the percentile prices from the held blocks
    pub async fn recalculate(&self) {
        let mut state = self.state.write().await;

        let mut prices = Vec::new();
        let mut tips = Vec::new();
        for block in &state.blocks {
            if self.gas.eip1559 && block.base_fee_per_gas.is_none() {
                warn!(number = block.number, "EIP-1559 enabled but block has no base fee");
            }
            for tx in &block.transactions {
                if !self.is_usable(tx, block) {
                    continue;
                }
                let Some(price) = effective_gas_price(block, tx) else {
                    continue;
                };
                prices.push(price);
                if self.gas.eip1559 {
                    if let Some(tip) = effective_tip_cap(block, tx) {
                        tips.push(tip);
                    }
                }
            }
        }

        let percentile = self.history.percentile as usize;
        match percentile_of(&mut prices, percentile) {
            Some(price) => {
                let clamped = price.clamp(self.gas.price_min, self.gas.price_max);
                if clamped != price && !self.gas.eip1559 {
                    warn!(
                        calculated = price,
                        used = clamped,
                        "Calculated gas price outside configured bounds"
                    );
                }
                state.gas_price = Some(clamped);
            }
            None => warn!("No suitable transactions in block history, keeping previous gas price"),
        }

        if self.gas.eip1559 {
            if let Some(tip) = percentile_of(&mut tips, percentile) {
                state.tip_cap = Some(tip.clamp(self.gas.tip_cap_min, self.gas.price_max));
            }
        }

        debug!(
            gas_price = ?state.gas_price,
            tip_cap = ?state.tip_cap,
            blocks = state.blocks.len(),
            "Recalculated block history prices"
        );
    }

    fn is_usable(&self, tx: &crate::chain::BlockTransaction, block: &Block) -> bool {
        // Zero gas limits appear on some forks and are not real transactions
        if tx.gas_limit == 0 {
            return false;
        }
        if tx.gas_price.is_none() && tx.tx_type.unwrap_or(0) == 0 {
            return false;
        }
        self.rules.is_usable(tx, block)
    }
}

fn percentile_of(values: &mut [u64], percentile: usize) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let idx = ((values.len() - 1) * percentile.min(100)) / 100;
    Some(values[idx])
}

#[async_trait]
impl GasEstimator for BlockHistoryEstimator {
    fn name(&self) -> &'static str {
        "block_history"
    }

    async fn estimate(&self, _calldata: &[u8], gas_limit: u64) -> TxmResult<(GasPrice, u64)> {
        let limit = chain_specific_gas_limit(&self.gas, gas_limit);
        let state = self.state.read().await;

        if !self.gas.eip1559 {
            let price = state.gas_price.unwrap_or_else(|| {
                warn!("No block history yet, using default gas price");
                self.gas.price_default
            });
            return Ok((GasPrice::Legacy(price), limit));
        }

        let tip = state.tip_cap.unwrap_or(self.gas.tip_cap_default);
        let fee_cap = if self.gas.bump_threshold == 0 {
            self.gas.price_max
        } else {
            let base = state.base_fee.ok_or_else(|| {
                TxmError::GasEstimation(
                    "no base fee in block history; is EIP-1559 enabled on a non-EIP-1559 chain?"
                        .to_string(),
                )
            })?;
            self.rules.fee_cap(
                base,
                self.history.fee_cap_buffer_blocks,
                tip,
                self.gas.price_max,
            )
        };
        Ok((
            GasPrice::Eip1559 {
                max_fee_per_gas: fee_cap,
                max_priority_fee_per_gas: tip,
            },
            limit,
        ))
    }

    async fn bump(&self, original: GasPrice, gas_limit: u64) -> TxmResult<(GasPrice, u64)> {
        let limit = chain_specific_gas_limit(&self.gas, gas_limit);
        let state = self.state.read().await;

        let bumped = match original {
            GasPrice::Legacy(price) => {
                GasPrice::Legacy(bump_legacy_price(&self.gas, state.gas_price, price)?)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => bump_dynamic_fee(
                &self.gas,
                self.rules.as_ref(),
                self.history.fee_cap_buffer_blocks,
                state.tip_cap,
                state.base_fee,
                max_fee_per_gas,
                max_priority_fee_per_gas,
            )?,
        };
        Ok((bumped, limit))
    }

    async fn on_new_head(&self, chain: &HeadChain) -> TxmResult<()> {
        self.fetch_blocks(chain).await?;
        self.recalculate().await;
        Ok(())
    }
}
