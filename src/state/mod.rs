//! Persistence for the transaction lifecycle
//!
//! The store is the single source of truth. Every multi-row transition is
//! atomic, and the nonce counter only moves through compare-and-swap updates.
//!
//! - [`postgres::PgTxStore`]: PostgreSQL, used in production
//! - [`memory::InMemoryTxStore`]: in-process, used by tests and dry runs

pub mod lock;
pub mod memory;
pub mod models;
pub mod postgres;

pub use lock::{AdvisoryLockGuard, LockTarget};
pub use memory::InMemoryTxStore;
pub use models::{
    Attempt, AttemptState, Key, NewAttempt, NewTransaction, Page, Receipt, Transaction, TxState,
};
pub use postgres::PgTxStore;

use crate::chain::ChainReceipt;
use crate::error::TxmResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use uuid::Uuid;

/// Error text recorded on transactions moved to `fatal_error` by [`TxStore::abandon`]
pub const ABANDONED: &str = "abandoned";

#[async_trait]
pub trait TxStore: Send + Sync {
    async fn health_check(&self) -> TxmResult<()>;

    // Keys

    /// Register a signing address, leaving an existing row untouched
    async fn ensure_key(&self, address: Address) -> TxmResult<Key>;

    async fn get_key(&self, address: Address) -> TxmResult<Key>;

    /// Set the first nonce of a never-used address. Fails if already set.
    async fn init_next_nonce(&self, address: Address, nonce: i64) -> TxmResult<()>;

    /// Move `next_nonce` from `old` to `new`, failing if it is no longer `old`
    async fn fast_forward_nonce(&self, address: Address, old: i64, new: i64) -> TxmResult<()>;

    async fn advisory_lock(&self, target: LockTarget) -> TxmResult<AdvisoryLockGuard>;

    // Queue

    /// Insert an `unstarted` transaction. `max_queued` of zero disables the capacity check.
    async fn create_transaction(
        &self,
        new: NewTransaction,
        max_queued: u64,
    ) -> TxmResult<Transaction>;

    /// Keep only the newest `queue_size` unstarted rows for a subject
    async fn prune_unstarted_queue(&self, subject: Uuid, queue_size: u32) -> TxmResult<Vec<i64>>;

    /// Fail every unstarted and in-progress transaction of an address
    async fn abandon(&self, address: Address) -> TxmResult<u64>;

    // Broadcaster

    async fn find_in_progress_transaction(&self, address: Address)
        -> TxmResult<Option<Transaction>>;

    /// Oldest-queued unstarted row, smallest value first
    async fn next_unstarted_transaction(&self, address: Address) -> TxmResult<Option<Transaction>>;

    async fn count_unconfirmed(&self, address: Address) -> TxmResult<u64>;

    /// Assign the nonce, insert the first attempt and mark the row `in_progress`
    async fn save_in_progress(
        &self,
        tx_id: i64,
        nonce: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Transaction>;

    /// Swap the in-progress attempt for a re-priced one
    async fn replace_in_progress_attempt(
        &self,
        old_attempt_id: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Attempt>;

    /// Discard attempts, release the nonce and record the failure
    async fn save_fatal(&self, tx_id: i64, error: String) -> TxmResult<()>;

    /// Increment the key's nonce, mark the transaction `unconfirmed` and the attempt `broadcast`
    async fn save_broadcast(&self, tx_id: i64, attempt_id: i64, now: DateTime<Utc>)
        -> TxmResult<()>;

    /// As [`TxStore::save_broadcast`], also queueing a fresh unstarted copy of the transaction
    async fn save_broadcast_and_requeue(
        &self,
        tx_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> TxmResult<Transaction>;

    // Confirmer

    /// Stamp broadcast attempts of unconfirmed transactions that lack a block number
    async fn set_broadcast_before_block_num(&self, block_num: i64) -> TxmResult<u64>;

    /// Unconfirmed transactions with only their `broadcast` attempts loaded
    async fn find_unconfirmed_with_broadcast_attempts(&self) -> TxmResult<Vec<Transaction>>;

    /// Upsert receipts and confirm their transactions. Returns the ids that
    /// moved from `unconfirmed` to `confirmed` in this call.
    async fn save_fetched_receipts(&self, receipts: Vec<ChainReceipt>) -> TxmResult<Vec<i64>>;

    /// Fail unconfirmed transactions whose nonce is below a confirmed one and
    /// whose every attempt was broadcast at or before `cutoff_block`
    async fn mark_old_missing_receipt_errored(&self, cutoff_block: i64) -> TxmResult<Vec<i64>>;

    /// Unconfirmed transactions with at least one attempt, every one broadcast
    /// at or before `block_num - threshold`, lowest nonce first. `depth` of zero means no limit.
    async fn find_transactions_requiring_gas_bump(
        &self,
        address: Address,
        block_num: i64,
        threshold: u64,
        depth: u32,
    ) -> TxmResult<Vec<Transaction>>;

    async fn find_transactions_with_in_progress_attempts(
        &self,
        address: Address,
    ) -> TxmResult<Vec<Transaction>>;

    /// Append an `in_progress` attempt to an unconfirmed transaction
    async fn save_in_progress_attempt(&self, tx_id: i64, attempt: NewAttempt)
        -> TxmResult<Attempt>;

    /// Mark an in-progress attempt `broadcast`, moving `broadcast_at` forward
    async fn mark_attempt_broadcast(&self, attempt_id: i64, now: DateTime<Utc>) -> TxmResult<()>;

    async fn delete_in_progress_attempt(&self, attempt_id: i64) -> TxmResult<()>;

    /// Fail an unconfirmed transaction whose nonce was consumed elsewhere
    async fn mark_unconfirmed_fatal(&self, tx_id: i64, error: String) -> TxmResult<()>;

    /// Confirmed transactions with a receipt at or above `min_block`, attempts and receipts loaded
    async fn find_confirmed_with_receipts_since(&self, min_block: i64)
        -> TxmResult<Vec<Transaction>>;

    /// Drop receipts, demote to `unconfirmed` and put `attempt_id` back in progress.
    /// Every attempt loses its block stamp.
    async fn mark_for_rebroadcast(&self, tx_id: i64, attempt_id: i64) -> TxmResult<()>;

    /// The unconfirmed or confirmed transaction holding a nonce
    async fn find_transaction_by_nonce(
        &self,
        address: Address,
        nonce: i64,
    ) -> TxmResult<Option<Transaction>>;

    // Resender

    /// Richest non-in-progress attempt per nonce of unconfirmed transactions
    /// last broadcast at or before `older_than`. `limit` of zero means no limit.
    async fn find_attempts_requiring_resend(
        &self,
        address: Address,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> TxmResult<Vec<Attempt>>;

    async fn update_broadcast_ats(&self, now: DateTime<Utc>, tx_ids: Vec<i64>) -> TxmResult<()>;

    // Reaper

    /// Delete confirmed transactions whose receipts are all below
    /// `min_block_to_keep`, and fatal ones, created before `older_than`
    async fn reap_transactions(
        &self,
        min_block_to_keep: i64,
        older_than: DateTime<Utc>,
    ) -> TxmResult<u64>;

    // Observability

    /// A transaction with attempts and receipts
    async fn find_transaction(&self, tx_id: i64) -> TxmResult<Transaction>;

    async fn transactions(&self, offset: u64, limit: u64) -> TxmResult<Page<Transaction>>;

    async fn attempts(&self, offset: u64, limit: u64) -> TxmResult<Page<Attempt>>;
}
