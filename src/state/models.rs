//! Persisted records: transactions, attempts, receipts and keys

use crate::error::{TxmError, TxmResult};
use crate::tx::gas::GasPrice;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InProgress,
    FatalError,
    Unconfirmed,
    Confirmed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::FatalError => "fatal_error",
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> TxmResult<Self> {
        match s {
            "unstarted" => Ok(TxState::Unstarted),
            "in_progress" => Ok(TxState::InProgress),
            "fatal_error" => Ok(TxState::FatalError),
            "unconfirmed" => Ok(TxState::Unconfirmed),
            "confirmed" => Ok(TxState::Confirmed),
            other => Err(TxmError::Internal(format!("unknown transaction state {}", other))),
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    InProgress,
    Broadcast,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::InProgress => "in_progress",
            AttemptState::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> TxmResult<Self> {
        match s {
            "in_progress" => Ok(AttemptState::InProgress),
            "broadcast" => Ok(AttemptState::Broadcast),
            other => Err(TxmError::Internal(format!("unknown attempt state {}", other))),
        }
    }
}

/// One logical send intent
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub from_address: Address,
    pub to_address: Address,
    pub payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub subject: Option<Uuid>,
    pub nonce: Option<i64>,
    pub state: TxState,
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Richest price first. Empty unless the query loads attempts.
    pub attempts: Vec<Attempt>,
}

impl Transaction {
    /// Order attempts richest-price-first, newest first on ties
    pub fn sort_attempts(&mut self) {
        self.attempts.sort_by(|a, b| {
            b.gas_price
                .ordering_key()
                .cmp(&a.gas_price.ordering_key())
                .then(b.id.cmp(&a.id))
        });
    }

    pub fn has_receipts(&self) -> bool {
        self.attempts.iter().any(|a| !a.receipts.is_empty())
    }

    pub fn in_progress_attempt(&self) -> Option<&Attempt> {
        self.attempts
            .iter()
            .find(|a| a.state == AttemptState::InProgress)
    }
}

/// One signed, priced broadcast of a transaction
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub id: i64,
    pub tx_id: i64,
    pub gas_price: GasPrice,
    /// Gas limit actually encoded in the signed payload
    pub gas_limit: u64,
    pub signed_raw_tx: Bytes,
    pub hash: H256,
    pub state: AttemptState,
    pub broadcast_before_block_num: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: i64,
    pub tx_hash: H256,
    pub block_hash: H256,
    pub block_number: i64,
    pub transaction_index: u64,
    pub receipt: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Key {
    pub id: i32,
    pub address: Address,
    /// `None` until the address is used for the first time
    pub next_nonce: Option<i64>,
}

/// Insert payload for a new `unstarted` transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub from_address: Address,
    pub to_address: Address,
    pub payload: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub subject: Option<Uuid>,
}

/// Insert payload for a signed attempt
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub gas_price: GasPrice,
    pub gas_limit: u64,
    pub signed_raw_tx: Bytes,
    pub hash: H256,
}

/// A page of rows plus the total row count
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}
