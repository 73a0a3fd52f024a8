//! Chain module - the RPC boundary the transaction manager consumes
//!
//! This module provides:
//! - The [`ChainClient`] capability set, with typed batch requests
//! - An ethers-backed client with multi-RPC failover
//! - Head chains (a head plus its ordered ancestors) and a polling head tracker

pub mod head;
pub mod provider;
pub mod tracker;

pub use head::{Head, HeadChain};
pub use provider::EthersChainClient;
pub use tracker::HeadTracker;

use crate::error::TxmResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use serde::Serialize;

/// A transaction as seen inside a fetched block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub hash: H256,
    /// EIP-2718 type byte. `None` for pre-typed legacy transactions.
    pub tx_type: Option<u64>,
    pub gas_price: Option<u64>,
    pub max_fee_per_gas: Option<u64>,
    pub max_priority_fee_per_gas: Option<u64>,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: i64,
    pub hash: H256,
    pub parent_hash: H256,
    pub base_fee_per_gas: Option<u64>,
    pub transactions: Vec<BlockTransaction>,
}

/// A receipt returned by the node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReceipt {
    pub tx_hash: H256,
    /// `None` while the transaction is pending
    pub block_hash: Option<H256>,
    pub block_number: Option<i64>,
    pub transaction_index: u64,
    /// 1 on success, 0 on revert. Absent on pre-Byzantium chains.
    pub status: Option<u64>,
    /// The receipt as returned by the node
    pub raw: serde_json::Value,
}

impl ChainReceipt {
    /// Whether the receipt points at a block
    pub fn is_mined(&self) -> bool {
        self.block_hash.is_some() && self.block_number.is_some()
    }

    pub fn reverted(&self) -> bool {
        self.status == Some(0)
    }
}

/// One entry of a batched RPC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRequest {
    BlockByNumber(i64),
    Receipt(H256),
}

/// The typed result matching a [`BatchRequest`] at the same index.
/// Per-request failures carry the node's message.
#[derive(Debug, Clone)]
pub enum BatchResponse {
    Block(Result<Option<Block>, String>),
    Receipt(Result<Option<ChainReceipt>, String>),
}

/// RPC capabilities the transaction manager relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Submit a signed transaction. Errors keep the node's message verbatim.
    async fn send_raw_transaction(&self, raw: Bytes) -> TxmResult<()>;

    /// Responses are returned in request order
    async fn batch_call(&self, requests: Vec<BatchRequest>) -> TxmResult<Vec<BatchResponse>>;

    async fn transaction_receipt(&self, hash: H256) -> TxmResult<Option<ChainReceipt>>;

    /// Next nonce including the node's own mempool
    async fn pending_nonce_at(&self, address: Address) -> TxmResult<u64>;

    /// `None` fetches the latest head
    async fn head_by_number(&self, number: Option<i64>) -> TxmResult<Option<Head>>;

    async fn suggest_gas_price(&self) -> TxmResult<u64>;
}
