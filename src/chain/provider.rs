//! ethers-backed chain client with multi-RPC support and automatic failover

use super::{Block, BlockTransaction, BatchRequest, BatchResponse, ChainClient, ChainReceipt, Head};
use crate::config::ChainConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider client with automatic failover
pub struct EthersChainClient {
    chain_id: u64,
    /// HTTP providers, in failover order
    providers: Vec<Provider<Http>>,
    current: AtomicUsize,
    timeout: Duration,
}

impl EthersChainClient {
    pub fn new(config: &ChainConfig, timeout: Duration) -> TxmResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(TxmError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            providers,
            current: AtomicUsize::new(0),
            timeout,
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        if self.providers.len() < 2 {
            return;
        }
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run one call under the RPC timeout. Transport failures move to the next provider.
    async fn call<T, F>(&self, operation: &str, fut: F) -> TxmResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let err = self.map_error(e);
                if matches!(err, TxmError::ChainConnection { .. }) {
                    self.failover();
                }
                Err(err)
            }
            Err(_) => {
                self.failover();
                Err(TxmError::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }

    /// Read-only calls are retried once per provider
    async fn read<T, F, Fut>(&self, operation: &str, f: F) -> TxmResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last = None;
        for _ in 0..self.providers.len() {
            match self.call(operation, f(self.http().clone())).await {
                Err(e @ TxmError::ChainConnection { .. }) | Err(e @ TxmError::Timeout { .. }) => {
                    last = Some(e);
                }
                other => return other,
            }
        }
        Err(last.unwrap_or(TxmError::ChainConnection {
            chain_id: self.chain_id,
            message: "All providers failed".to_string(),
        }))
    }

    fn map_error(&self, e: ProviderError) -> TxmError {
        match RpcError::as_error_response(&e) {
            Some(resp) => TxmError::Rpc(resp.message.clone()),
            None => TxmError::ChainConnection {
                chain_id: self.chain_id,
                message: e.to_string(),
            },
        }
    }

    async fn block(&self, number: i64) -> TxmResult<Option<Block>> {
        let block = self
            .read("eth_getBlockByNumber", |p| async move {
                p.get_block_with_txs(BlockNumber::Number(U64::from(number as u64)))
                    .await
            })
            .await?;
        Ok(block.and_then(convert_block))
    }
}

fn saturating_u64(v: U256) -> u64 {
    if v > U256::from(u64::MAX) {
        u64::MAX
    } else {
        v.as_u64()
    }
}

fn convert_block(block: ethers::types::Block<Transaction>) -> Option<Block> {
    Some(Block {
        number: block.number?.as_u64() as i64,
        hash: block.hash?,
        parent_hash: block.parent_hash,
        base_fee_per_gas: block.base_fee_per_gas.map(saturating_u64),
        transactions: block
            .transactions
            .into_iter()
            .map(|tx| BlockTransaction {
                hash: tx.hash,
                tx_type: tx.transaction_type.map(|t| t.as_u64()),
                gas_price: tx.gas_price.map(saturating_u64),
                max_fee_per_gas: tx.max_fee_per_gas.map(saturating_u64),
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas.map(saturating_u64),
                gas_limit: saturating_u64(tx.gas),
            })
            .collect(),
    })
}

fn convert_receipt(receipt: TransactionReceipt) -> ChainReceipt {
    let raw = serde_json::to_value(&receipt).unwrap_or(serde_json::Value::Null);
    ChainReceipt {
        tx_hash: receipt.transaction_hash,
        block_hash: receipt.block_hash,
        block_number: receipt.block_number.map(|n| n.as_u64() as i64),
        transaction_index: receipt.transaction_index.as_u64(),
        status: receipt.status.map(|s| s.as_u64()),
        raw,
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> TxmResult<()> {
        // Not retried across providers: the outcome of a failed send is unknown
        let provider = self.http().clone();
        self.call("eth_sendRawTransaction", async move {
            provider.send_raw_transaction(raw).await.map(|_| ())
        })
        .await
    }

    async fn batch_call(&self, requests: Vec<BatchRequest>) -> TxmResult<Vec<BatchResponse>> {
        let calls = requests.into_iter().map(move |req| async move {
            match req {
                BatchRequest::BlockByNumber(n) => {
                    BatchResponse::Block(self.block(n).await.map_err(|e| e.to_string()))
                }
                BatchRequest::Receipt(hash) => BatchResponse::Receipt(
                    self.transaction_receipt(hash)
                        .await
                        .map_err(|e| e.to_string()),
                ),
            }
        });
        Ok(futures::future::join_all(calls).await)
    }

    async fn transaction_receipt(&self, hash: H256) -> TxmResult<Option<ChainReceipt>> {
        let receipt = self
            .read("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;
        Ok(receipt.map(convert_receipt))
    }

    async fn pending_nonce_at(&self, address: Address) -> TxmResult<u64> {
        let nonce = self
            .read("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(saturating_u64(nonce))
    }

    async fn head_by_number(&self, number: Option<i64>) -> TxmResult<Option<Head>> {
        let tag = match number {
            Some(n) => BlockNumber::Number(U64::from(n as u64)),
            None => BlockNumber::Latest,
        };
        let block = self
            .read("eth_getBlockByNumber", |p| async move { p.get_block(tag).await })
            .await?;

        Ok(block.and_then(|b| {
            Some(Head {
                number: b.number?.as_u64() as i64,
                hash: b.hash?,
                parent_hash: b.parent_hash,
            })
        }))
    }

    async fn suggest_gas_price(&self) -> TxmResult<u64> {
        let price = self
            .read("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await?;
        Ok(saturating_u64(price))
    }
}
