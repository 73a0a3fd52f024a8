//! Shared fixtures for unit tests: a scripted chain client and row builders

use crate::chain::{
    BatchRequest, BatchResponse, Block, BlockTransaction, ChainClient, ChainReceipt, Head,
    HeadChain,
};
use crate::config::{ChainType, GasConfig};
use crate::error::{TxmError, TxmResult};
use crate::state::{NewAttempt, NewTransaction};
use crate::tx::attempt::{AttemptBuilder, KeyStore};
use crate::tx::gas::{rules_for, FixedPriceEstimator, GasEstimator, GasPrice};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const TEST_CHAIN_ID: u64 = 1337;

pub fn test_address() -> Address {
    TEST_KEY
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .unwrap()
        .address()
}

pub fn test_builder() -> Arc<AttemptBuilder> {
    Arc::new(AttemptBuilder::new(
        Arc::new(KeyStore::from_hex_keys(&[TEST_KEY], TEST_CHAIN_ID).unwrap()),
        TEST_CHAIN_ID,
    ))
}

/// Legacy pricing: default 30, max 500, bump by max(20%, 5) after 3 blocks
pub fn test_gas_config() -> GasConfig {
    GasConfig {
        price_default: 30,
        price_min: 1,
        price_max: 500,
        bump_percent: 20,
        bump_wei: 5,
        bump_threshold: 3,
        bump_tx_depth: 0,
        ..GasConfig::default()
    }
}

pub fn test_estimator() -> Arc<dyn GasEstimator> {
    Arc::new(FixedPriceEstimator::new(
        test_gas_config(),
        rules_for(ChainType::Ethereum),
        0,
    ))
}

pub fn new_tx(from: Address) -> NewTransaction {
    NewTransaction {
        from_address: from,
        to_address: Address::repeat_byte(0x42),
        payload: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        value: U256::zero(),
        gas_limit: 21_000,
        subject: None,
    }
}

/// An unsigned stand-in attempt whose hash is unique per `seed`
pub fn raw_attempt(seed: u8, gas_price: GasPrice) -> NewAttempt {
    NewAttempt {
        gas_price,
        gas_limit: 21_000,
        signed_raw_tx: Bytes::from(vec![0xf8, seed]),
        hash: H256::repeat_byte(seed),
    }
}

pub fn receipt_for(tx_hash: H256, block_number: i64, block_hash_byte: u8) -> ChainReceipt {
    mined_receipt(tx_hash, block_number, H256::repeat_byte(block_hash_byte))
}

pub fn mined_receipt(tx_hash: H256, block_number: i64, block_hash: H256) -> ChainReceipt {
    ChainReceipt {
        tx_hash,
        block_hash: Some(block_hash),
        block_number: Some(block_number),
        transaction_index: 0,
        status: Some(1),
        raw: serde_json::json!({
            "transactionHash": format!("{:?}", tx_hash),
            "blockNumber": block_number,
        }),
    }
}

/// Hash of block `number` on branch `fork`
pub fn block_hash(number: i64, fork: u8) -> H256 {
    let mut hash = H256::from_low_u64_be((number + 1) as u64);
    hash.0[0] = fork;
    hash
}

/// `len` linked heads ending at `top`, all on branch `fork`
pub fn head_chain(top: i64, len: usize, fork: u8) -> HeadChain {
    forked_chain(top, len, 0, fork)
}

/// `len` linked heads ending at `top`. Blocks at or above `fork_at` are on
/// branch `fork`, older ones on branch 0.
pub fn forked_chain(top: i64, len: usize, fork_at: i64, fork: u8) -> HeadChain {
    let branch = |n: i64| if n >= fork_at { fork } else { 0 };
    let lowest = (top - len as i64 + 1).max(0);
    let heads = (lowest..=top)
        .rev()
        .map(|n| Head {
            number: n,
            hash: block_hash(n, branch(n)),
            parent_hash: if n == 0 {
                H256::zero()
            } else {
                block_hash(n - 1, branch(n - 1))
            },
        })
        .collect();
    HeadChain::new(heads).unwrap()
}

#[derive(Default)]
struct FakeState {
    canonical: Option<HeadChain>,
    block_transactions: HashMap<i64, Vec<BlockTransaction>>,
    base_fees: HashMap<i64, u64>,
    receipts: HashMap<H256, ChainReceipt>,
    pending_nonces: HashMap<Address, u64>,
    send_results: VecDeque<TxmResult<()>>,
    sent: Vec<Bytes>,
    gas_price: u64,
    head_calls: usize,
    batch_requests: usize,
}

/// Chain client answering from scripted state
#[derive(Default)]
pub struct FakeChainClient {
    state: Mutex<FakeState>,
}

impl FakeChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_canonical(&self, chain: HeadChain) {
        self.state.lock().unwrap().canonical = Some(chain);
    }

    pub fn set_block_transactions(&self, number: i64, txs: Vec<BlockTransaction>) {
        self.state
            .lock()
            .unwrap()
            .block_transactions
            .insert(number, txs);
    }

    pub fn set_base_fee(&self, number: i64, base_fee: u64) {
        self.state.lock().unwrap().base_fees.insert(number, base_fee);
    }

    pub fn set_receipt(&self, attempt_hash: H256, receipt: ChainReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(attempt_hash, receipt);
    }

    pub fn clear_receipts(&self) {
        self.state.lock().unwrap().receipts.clear();
    }

    pub fn set_pending_nonce(&self, address: Address, nonce: u64) {
        self.state
            .lock()
            .unwrap()
            .pending_nonces
            .insert(address, nonce);
    }

    pub fn set_gas_price(&self, price: u64) {
        self.state.lock().unwrap().gas_price = price;
    }

    /// Queue the outcome of a future send. Unscripted sends succeed.
    pub fn push_send(&self, result: TxmResult<()>) {
        self.state.lock().unwrap().send_results.push_back(result);
    }

    /// Queue a node error for the next unscripted send
    pub fn fail_next_send(&self, message: &str) {
        self.push_send(Err(TxmError::Rpc(message.to_string())));
    }

    /// Every raw transaction sent, in order
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn head_calls(&self) -> usize {
        self.state.lock().unwrap().head_calls
    }

    /// Block requests served through `batch_call`
    pub fn batch_requests(&self) -> usize {
        self.state.lock().unwrap().batch_requests
    }
}

#[async_trait]
impl ChainClient for FakeChainClient {
    fn chain_id(&self) -> u64 {
        TEST_CHAIN_ID
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> TxmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(raw);
        state.send_results.pop_front().unwrap_or(Ok(()))
    }

    async fn batch_call(&self, requests: Vec<BatchRequest>) -> TxmResult<Vec<BatchResponse>> {
        let mut state = self.state.lock().unwrap();
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            match request {
                BatchRequest::BlockByNumber(number) => {
                    state.batch_requests += 1;
                    let head = state
                        .canonical
                        .as_ref()
                        .and_then(|c| c.heads().iter().find(|h| h.number == number).copied());
                    let block = head.map(|h| Block {
                        number: h.number,
                        hash: h.hash,
                        parent_hash: h.parent_hash,
                        base_fee_per_gas: state.base_fees.get(&number).copied(),
                        transactions: state
                            .block_transactions
                            .get(&number)
                            .cloned()
                            .unwrap_or_default(),
                    });
                    responses.push(BatchResponse::Block(Ok(block)));
                }
                BatchRequest::Receipt(hash) => {
                    responses.push(BatchResponse::Receipt(Ok(state.receipts.get(&hash).cloned())));
                }
            }
        }
        Ok(responses)
    }

    async fn transaction_receipt(&self, hash: H256) -> TxmResult<Option<ChainReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn pending_nonce_at(&self, address: Address) -> TxmResult<u64> {
        self.state
            .lock()
            .unwrap()
            .pending_nonces
            .get(&address)
            .copied()
            .ok_or_else(|| TxmError::Rpc(format!("no pending nonce for {:?}", address)))
    }

    async fn head_by_number(&self, number: Option<i64>) -> TxmResult<Option<Head>> {
        let mut state = self.state.lock().unwrap();
        state.head_calls += 1;
        let Some(chain) = state.canonical.as_ref() else {
            return Ok(None);
        };
        Ok(match number {
            None => Some(*chain.head()),
            Some(n) => chain.heads().iter().find(|h| h.number == n).copied(),
        })
    }

    async fn suggest_gas_price(&self) -> TxmResult<u64> {
        Ok(self.state.lock().unwrap().gas_price)
    }
}
