//! In-memory implementation of [`TxStore`]
//!
//! Mirrors the PostgreSQL store's constraints (one in-progress transaction per
//! address, one in-progress attempt per transaction, unique attempt hashes,
//! cascading deletes) so components can be tested without a database.

use super::lock::{LocalLocks, LockTarget, CLASS_CONFIRMER, CLASS_KEY};
use super::models::*;
use super::{AdvisoryLockGuard, TxStore, ABANDONED};
use crate::chain::ChainReceipt;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    keys: HashMap<Address, Key>,
    txs: BTreeMap<i64, Transaction>,
    attempts: BTreeMap<i64, Attempt>,
    receipts: BTreeMap<i64, Receipt>,
    next_key_id: i32,
    next_tx_id: i64,
    next_attempt_id: i64,
    next_receipt_id: i64,
}

impl Inner {
    fn tx(&self, id: i64) -> TxmResult<&Transaction> {
        self.txs
            .get(&id)
            .ok_or(TxmError::TransactionNotFound { tx_id: id })
    }

    fn tx_mut(&mut self, id: i64) -> TxmResult<&mut Transaction> {
        self.txs
            .get_mut(&id)
            .ok_or(TxmError::TransactionNotFound { tx_id: id })
    }

    fn key_mut(&mut self, address: Address) -> TxmResult<&mut Key> {
        self.keys.get_mut(&address).ok_or(TxmError::KeyNotFound {
            address: format!("{:?}", address),
        })
    }

    fn receipts_for(&self, attempt: &Attempt) -> Vec<Receipt> {
        self.receipts
            .values()
            .filter(|r| r.tx_hash == attempt.hash)
            .cloned()
            .collect()
    }

    fn hydrate<F>(&self, tx: &Transaction, keep: F, with_receipts: bool) -> Transaction
    where
        F: Fn(&Attempt) -> bool,
    {
        let mut tx = tx.clone();
        tx.attempts = self
            .attempts
            .values()
            .filter(|a| a.tx_id == tx.id && keep(a))
            .map(|a| {
                let mut a = a.clone();
                if with_receipts {
                    a.receipts = self.receipts_for(&a);
                }
                a
            })
            .collect();
        tx.sort_attempts();
        tx
    }

    fn full(&self, tx: &Transaction) -> Transaction {
        self.hydrate(tx, |_| true, true)
    }

    fn attempts_of(&self, tx_id: i64) -> impl Iterator<Item = &Attempt> {
        self.attempts.values().filter(move |a| a.tx_id == tx_id)
    }

    fn receipt_blocks_of(&self, tx_id: i64) -> Vec<i64> {
        let hashes: HashSet<_> = self.attempts_of(tx_id).map(|a| a.hash).collect();
        self.receipts
            .values()
            .filter(|r| hashes.contains(&r.tx_hash))
            .map(|r| r.block_number)
            .collect()
    }

    fn insert_attempt(
        &mut self,
        tx_id: i64,
        new: NewAttempt,
        state: AttemptState,
    ) -> TxmResult<Attempt> {
        if self.attempts.values().any(|a| a.hash == new.hash) {
            return Err(TxmError::InvariantViolation(format!(
                "attempt with hash {:?} already exists",
                new.hash
            )));
        }
        if state == AttemptState::InProgress
            && self
                .attempts_of(tx_id)
                .any(|a| a.state == AttemptState::InProgress)
        {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} already has an in-progress attempt",
                tx_id
            )));
        }

        self.next_attempt_id += 1;
        let attempt = Attempt {
            id: self.next_attempt_id,
            tx_id,
            gas_price: new.gas_price,
            gas_limit: new.gas_limit,
            signed_raw_tx: new.signed_raw_tx,
            hash: new.hash,
            state,
            broadcast_before_block_num: None,
            created_at: Utc::now(),
            receipts: Vec::new(),
        };
        self.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    fn delete_transaction(&mut self, tx_id: i64) {
        let hashes: HashSet<_> = self.attempts_of(tx_id).map(|a| a.hash).collect();
        self.receipts.retain(|_, r| !hashes.contains(&r.tx_hash));
        self.attempts.retain(|_, a| a.tx_id != tx_id);
        self.txs.remove(&tx_id);
    }

    fn mark_broadcast(&mut self, tx_id: i64, attempt_id: i64, now: DateTime<Utc>) -> TxmResult<()> {
        let tx = self.tx(tx_id)?;
        if tx.state != TxState::InProgress {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is {}, expected in_progress",
                tx_id, tx.state
            )));
        }
        let nonce = tx.nonce.ok_or_else(|| {
            TxmError::InvariantViolation(format!("transaction {} has no nonce", tx_id))
        })?;
        let from = tx.from_address;

        match self.attempts.get(&attempt_id) {
            Some(a) if a.tx_id == tx_id && a.state == AttemptState::InProgress => {}
            _ => {
                return Err(TxmError::InvariantViolation(format!(
                    "attempt {} is not the in-progress attempt of transaction {}",
                    attempt_id, tx_id
                )))
            }
        }

        let key = self.key_mut(from)?;
        if key.next_nonce != Some(nonce) {
            return Err(TxmError::OptimisticLock(format!(
                "next nonce for {:?} is {:?}, expected {}",
                from, key.next_nonce, nonce
            )));
        }
        key.next_nonce = Some(nonce + 1);

        let tx = self.tx_mut(tx_id)?;
        tx.state = TxState::Unconfirmed;
        tx.broadcast_at = Some(now);
        tx.initial_broadcast_at.get_or_insert(now);

        if let Some(a) = self.attempts.get_mut(&attempt_id) {
            a.state = AttemptState::Broadcast;
        }
        Ok(())
    }
}

/// In-memory implementation of [`TxStore`].
#[derive(Clone, Default)]
pub struct InMemoryTxStore {
    inner: Arc<RwLock<Inner>>,
    locks: Arc<LocalLocks>,
}

impl InMemoryTxStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions held, in any state
    pub async fn transaction_count(&self) -> usize {
        self.inner.read().await.txs.len()
    }

    /// Number of receipts held
    pub async fn receipt_count(&self) -> usize {
        self.inner.read().await.receipts.len()
    }

    /// Edit a stored transaction in place
    #[cfg(test)]
    pub async fn update_transaction<F>(&self, tx_id: i64, f: F)
    where
        F: FnOnce(&mut Transaction),
    {
        let mut inner = self.inner.write().await;
        if let Some(tx) = inner.txs.get_mut(&tx_id) {
            f(tx);
        }
    }

    /// Edit a stored attempt in place
    #[cfg(test)]
    pub async fn update_attempt<F>(&self, attempt_id: i64, f: F)
    where
        F: FnOnce(&mut Attempt),
    {
        let mut inner = self.inner.write().await;
        if let Some(a) = inner.attempts.get_mut(&attempt_id) {
            f(a);
        }
    }
}

#[async_trait]
impl TxStore for InMemoryTxStore {
    async fn health_check(&self) -> TxmResult<()> {
        Ok(())
    }

    async fn ensure_key(&self, address: Address) -> TxmResult<Key> {
        let mut inner = self.inner.write().await;
        if let Some(key) = inner.keys.get(&address) {
            return Ok(key.clone());
        }
        inner.next_key_id += 1;
        let key = Key {
            id: inner.next_key_id,
            address,
            next_nonce: None,
        };
        inner.keys.insert(address, key.clone());
        Ok(key)
    }

    async fn get_key(&self, address: Address) -> TxmResult<Key> {
        let inner = self.inner.read().await;
        inner
            .keys
            .get(&address)
            .cloned()
            .ok_or(TxmError::KeyNotFound {
                address: format!("{:?}", address),
            })
    }

    async fn init_next_nonce(&self, address: Address, nonce: i64) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let key = inner.key_mut(address)?;
        if key.next_nonce.is_some() {
            return Err(TxmError::OptimisticLock(format!(
                "next nonce for {:?} was already initialised",
                address
            )));
        }
        key.next_nonce = Some(nonce);
        Ok(())
    }

    async fn fast_forward_nonce(&self, address: Address, old: i64, new: i64) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let key = inner.key_mut(address)?;
        if key.next_nonce != Some(old) {
            return Err(TxmError::OptimisticLock(format!(
                "next nonce for {:?} is {:?}, expected {}",
                address, key.next_nonce, old
            )));
        }
        key.next_nonce = Some(new);
        Ok(())
    }

    async fn advisory_lock(&self, target: LockTarget) -> TxmResult<AdvisoryLockGuard> {
        let (class, object) = match target {
            LockTarget::Key(address) => (CLASS_KEY, self.get_key(address).await?.id),
            LockTarget::Confirmer => (CLASS_CONFIRMER, 0),
        };
        Ok(self.locks.lock(class, object).await)
    }

    async fn create_transaction(
        &self,
        new: NewTransaction,
        max_queued: u64,
    ) -> TxmResult<Transaction> {
        let mut inner = self.inner.write().await;
        if !inner.keys.contains_key(&new.from_address) {
            return Err(TxmError::KeyNotFound {
                address: format!("{:?}", new.from_address),
            });
        }
        if max_queued > 0 {
            let queued = inner
                .txs
                .values()
                .filter(|t| t.from_address == new.from_address && t.state == TxState::Unstarted)
                .count() as u64;
            if queued >= max_queued {
                return Err(TxmError::QueueFull {
                    address: format!("{:?}", new.from_address),
                    queued,
                });
            }
        }

        inner.next_tx_id += 1;
        let tx = Transaction {
            id: inner.next_tx_id,
            from_address: new.from_address,
            to_address: new.to_address,
            payload: new.payload,
            value: new.value,
            gas_limit: new.gas_limit,
            subject: new.subject,
            nonce: None,
            state: TxState::Unstarted,
            error: None,
            broadcast_at: None,
            initial_broadcast_at: None,
            created_at: Utc::now(),
            attempts: Vec::new(),
        };
        inner.txs.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn prune_unstarted_queue(&self, subject: Uuid, queue_size: u32) -> TxmResult<Vec<i64>> {
        let mut inner = self.inner.write().await;
        let mut queued: Vec<i64> = inner
            .txs
            .values()
            .filter(|t| t.state == TxState::Unstarted && t.subject == Some(subject))
            .map(|t| t.id)
            .collect();
        queued.sort_unstable_by(|a, b| b.cmp(a));

        let pruned: Vec<i64> = queued.into_iter().skip(queue_size as usize).collect();
        for id in &pruned {
            inner.delete_transaction(*id);
        }
        Ok(pruned)
    }

    async fn abandon(&self, address: Address) -> TxmResult<u64> {
        let mut inner = self.inner.write().await;
        let ids: Vec<i64> = inner
            .txs
            .values()
            .filter(|t| {
                t.from_address == address
                    && matches!(t.state, TxState::Unstarted | TxState::InProgress)
            })
            .map(|t| t.id)
            .collect();

        for id in &ids {
            inner
                .attempts
                .retain(|_, a| !(a.tx_id == *id && a.state == AttemptState::InProgress));
            let tx = inner.tx_mut(*id)?;
            tx.state = TxState::FatalError;
            tx.nonce = None;
            tx.error = Some(ABANDONED.to_string());
        }
        Ok(ids.len() as u64)
    }

    async fn find_in_progress_transaction(
        &self,
        address: Address,
    ) -> TxmResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .txs
            .values()
            .find(|t| t.from_address == address && t.state == TxState::InProgress)
            .map(|t| inner.full(t)))
    }

    async fn next_unstarted_transaction(
        &self,
        address: Address,
    ) -> TxmResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .txs
            .values()
            .filter(|t| t.from_address == address && t.state == TxState::Unstarted)
            .min_by(|a, b| {
                a.value
                    .cmp(&b.value)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .cloned())
    }

    async fn count_unconfirmed(&self, address: Address) -> TxmResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .txs
            .values()
            .filter(|t| t.from_address == address && t.state == TxState::Unconfirmed)
            .count() as u64)
    }

    async fn save_in_progress(
        &self,
        tx_id: i64,
        nonce: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Transaction> {
        let mut inner = self.inner.write().await;
        let tx = inner.tx(tx_id)?;
        if tx.state != TxState::Unstarted {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is {}, expected unstarted",
                tx_id, tx.state
            )));
        }
        let from = tx.from_address;
        if inner
            .txs
            .values()
            .any(|t| t.from_address == from && t.state == TxState::InProgress)
        {
            return Err(TxmError::InvariantViolation(format!(
                "address {:?} already has an in-progress transaction",
                from
            )));
        }

        inner.insert_attempt(tx_id, attempt, AttemptState::InProgress)?;
        let tx = inner.tx_mut(tx_id)?;
        tx.nonce = Some(nonce);
        tx.state = TxState::InProgress;
        let tx = inner.tx(tx_id)?;
        Ok(inner.full(tx))
    }

    async fn replace_in_progress_attempt(
        &self,
        old_attempt_id: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Attempt> {
        let mut inner = self.inner.write().await;
        let tx_id = match inner.attempts.get(&old_attempt_id) {
            Some(a) if a.state == AttemptState::InProgress => a.tx_id,
            _ => {
                return Err(TxmError::InvariantViolation(format!(
                    "attempt {} is not in progress",
                    old_attempt_id
                )))
            }
        };
        inner.attempts.remove(&old_attempt_id);
        inner.insert_attempt(tx_id, attempt, AttemptState::InProgress)
    }

    async fn save_fatal(&self, tx_id: i64, error: String) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tx(tx_id)?.state != TxState::InProgress {
            return Err(TxmError::InvariantViolation(format!(
                "cannot fail transaction {} outside in_progress",
                tx_id
            )));
        }
        inner.attempts.retain(|_, a| a.tx_id != tx_id);
        let tx = inner.tx_mut(tx_id)?;
        tx.state = TxState::FatalError;
        tx.nonce = None;
        tx.broadcast_at = None;
        tx.initial_broadcast_at = None;
        tx.error = Some(error);
        Ok(())
    }

    async fn save_broadcast(
        &self,
        tx_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        inner.mark_broadcast(tx_id, attempt_id, now)
    }

    async fn save_broadcast_and_requeue(
        &self,
        tx_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> TxmResult<Transaction> {
        let mut inner = self.inner.write().await;
        inner.mark_broadcast(tx_id, attempt_id, now)?;

        let original = inner.tx(tx_id)?.clone();
        inner.next_tx_id += 1;
        let clone = Transaction {
            id: inner.next_tx_id,
            nonce: None,
            state: TxState::Unstarted,
            error: None,
            broadcast_at: None,
            initial_broadcast_at: None,
            created_at: Utc::now(),
            attempts: Vec::new(),
            ..original
        };
        inner.txs.insert(clone.id, clone.clone());
        Ok(clone)
    }

    async fn set_broadcast_before_block_num(&self, block_num: i64) -> TxmResult<u64> {
        let mut inner = self.inner.write().await;
        let unconfirmed: HashSet<i64> = inner
            .txs
            .values()
            .filter(|t| t.state == TxState::Unconfirmed)
            .map(|t| t.id)
            .collect();
        let mut updated = 0;
        for a in inner.attempts.values_mut() {
            if a.state == AttemptState::Broadcast
                && a.broadcast_before_block_num.is_none()
                && unconfirmed.contains(&a.tx_id)
            {
                a.broadcast_before_block_num = Some(block_num);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn find_unconfirmed_with_broadcast_attempts(&self) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|t| t.state == TxState::Unconfirmed)
            .map(|t| inner.hydrate(t, |a| a.state == AttemptState::Broadcast, false))
            .collect();
        txs.sort_by_key(|t| (t.nonce, t.id));
        Ok(txs)
    }

    async fn save_fetched_receipts(&self, receipts: Vec<ChainReceipt>) -> TxmResult<Vec<i64>> {
        let mut inner = self.inner.write().await;
        let mut confirmed = Vec::new();

        for r in receipts {
            let (Some(block_hash), Some(block_number)) = (r.block_hash, r.block_number) else {
                continue;
            };
            let Some(attempt_id) = inner
                .attempts
                .values()
                .find(|a| a.hash == r.tx_hash)
                .map(|a| a.id)
            else {
                return Err(TxmError::InvariantViolation(format!(
                    "receipt for unknown attempt {:?}",
                    r.tx_hash
                )));
            };

            let existing = inner
                .receipts
                .values()
                .find(|x| x.tx_hash == r.tx_hash && x.block_hash == block_hash)
                .map(|x| x.id);
            match existing {
                Some(id) => {
                    if let Some(x) = inner.receipts.get_mut(&id) {
                        x.block_number = block_number;
                        x.transaction_index = r.transaction_index;
                        x.receipt = r.raw.clone();
                    }
                }
                None => {
                    inner.next_receipt_id += 1;
                    let id = inner.next_receipt_id;
                    inner.receipts.insert(
                        id,
                        Receipt {
                            id,
                            tx_hash: r.tx_hash,
                            block_hash,
                            block_number,
                            transaction_index: r.transaction_index,
                            receipt: r.raw.clone(),
                            created_at: Utc::now(),
                        },
                    );
                }
            }

            let tx_id = match inner.attempts.get_mut(&attempt_id) {
                Some(a) => {
                    a.state = AttemptState::Broadcast;
                    a.broadcast_before_block_num.get_or_insert(block_number);
                    a.tx_id
                }
                None => continue,
            };
            let tx = inner.tx_mut(tx_id)?;
            if tx.state == TxState::Unconfirmed {
                tx.state = TxState::Confirmed;
                confirmed.push(tx_id);
            }
        }
        Ok(confirmed)
    }

    async fn mark_old_missing_receipt_errored(&self, cutoff_block: i64) -> TxmResult<Vec<i64>> {
        let mut inner = self.inner.write().await;
        let mut max_confirmed: HashMap<Address, i64> = HashMap::new();
        for t in inner.txs.values().filter(|t| t.state == TxState::Confirmed) {
            if let Some(n) = t.nonce {
                let entry = max_confirmed.entry(t.from_address).or_insert(n);
                *entry = (*entry).max(n);
            }
        }

        let doomed: Vec<i64> = inner
            .txs
            .values()
            .filter(|t| t.state == TxState::Unconfirmed)
            .filter(|t| match (t.nonce, max_confirmed.get(&t.from_address)) {
                (Some(n), Some(max)) => n < *max,
                _ => false,
            })
            .filter(|t| {
                let mut attempts = inner.attempts_of(t.id).peekable();
                attempts.peek().is_some()
                    && attempts.all(|a| {
                        matches!(a.broadcast_before_block_num, Some(b) if b <= cutoff_block)
                    })
            })
            .map(|t| t.id)
            .collect();

        for id in &doomed {
            let tx = inner.tx_mut(*id)?;
            tx.state = TxState::FatalError;
            tx.error = Some(crate::tx::confirmer::MISSING_RECEIPT.to_string());
        }
        Ok(doomed)
    }

    async fn find_transactions_requiring_gas_bump(
        &self,
        address: Address,
        block_num: i64,
        threshold: u64,
        depth: u32,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let cutoff = block_num - threshold as i64;
        let mut txs: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|t| t.from_address == address && t.state == TxState::Unconfirmed)
            .filter(|t| {
                let mut attempts = inner.attempts_of(t.id).peekable();
                attempts.peek().is_some()
                    && attempts.all(|a| {
                        a.state == AttemptState::Broadcast
                            && matches!(a.broadcast_before_block_num, Some(b) if b <= cutoff)
                    })
            })
            .map(|t| inner.full(t))
            .collect();
        txs.sort_by_key(|t| t.nonce);
        if depth > 0 {
            txs.truncate(depth as usize);
        }
        Ok(txs)
    }

    async fn find_transactions_with_in_progress_attempts(
        &self,
        address: Address,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|t| t.from_address == address && t.state == TxState::Unconfirmed)
            .filter(|t| {
                inner
                    .attempts_of(t.id)
                    .any(|a| a.state == AttemptState::InProgress)
            })
            .map(|t| inner.full(t))
            .collect();
        txs.sort_by_key(|t| t.nonce);
        Ok(txs)
    }

    async fn save_in_progress_attempt(
        &self,
        tx_id: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Attempt> {
        let mut inner = self.inner.write().await;
        let state = inner.tx(tx_id)?.state;
        if state != TxState::Unconfirmed {
            return Err(TxmError::InvariantViolation(format!(
                "cannot add attempt to transaction {} in state {}",
                tx_id, state
            )));
        }
        inner.insert_attempt(tx_id, attempt, AttemptState::InProgress)
    }

    async fn mark_attempt_broadcast(&self, attempt_id: i64, now: DateTime<Utc>) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let tx_id = match inner.attempts.get_mut(&attempt_id) {
            Some(a) if a.state == AttemptState::InProgress => {
                a.state = AttemptState::Broadcast;
                a.tx_id
            }
            _ => {
                return Err(TxmError::InvariantViolation(format!(
                    "attempt {} is not in progress",
                    attempt_id
                )))
            }
        };
        let tx = inner.tx_mut(tx_id)?;
        if tx.broadcast_at.map_or(true, |at| at < now) {
            tx.broadcast_at = Some(now);
        }
        Ok(())
    }

    async fn delete_in_progress_attempt(&self, attempt_id: i64) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        match inner.attempts.get(&attempt_id) {
            Some(a) if a.state == AttemptState::InProgress => {
                inner.attempts.remove(&attempt_id);
                Ok(())
            }
            _ => Err(TxmError::InvariantViolation(format!(
                "attempt {} is not in progress",
                attempt_id
            ))),
        }
    }

    async fn mark_unconfirmed_fatal(&self, tx_id: i64, error: String) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tx(tx_id)?.state != TxState::Unconfirmed {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is not unconfirmed",
                tx_id
            )));
        }
        inner
            .attempts
            .retain(|_, a| !(a.tx_id == tx_id && a.state == AttemptState::InProgress));
        let tx = inner.tx_mut(tx_id)?;
        tx.state = TxState::FatalError;
        tx.error = Some(error);
        Ok(())
    }

    async fn find_confirmed_with_receipts_since(
        &self,
        min_block: i64,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|t| t.state == TxState::Confirmed)
            .filter(|t| inner.receipt_blocks_of(t.id).iter().any(|b| *b >= min_block))
            .map(|t| inner.full(t))
            .collect();
        txs.sort_by_key(|t| (t.from_address, t.nonce));
        Ok(txs)
    }

    async fn mark_for_rebroadcast(&self, tx_id: i64, attempt_id: i64) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tx(tx_id)?.state != TxState::Confirmed {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is not confirmed",
                tx_id
            )));
        }
        if !matches!(inner.attempts.get(&attempt_id), Some(a) if a.tx_id == tx_id) {
            return Err(TxmError::InvariantViolation(format!(
                "attempt {} does not belong to transaction {}",
                attempt_id, tx_id
            )));
        }

        let hashes: HashSet<_> = inner.attempts_of(tx_id).map(|a| a.hash).collect();
        inner.receipts.retain(|_, r| !hashes.contains(&r.tx_hash));
        inner.tx_mut(tx_id)?.state = TxState::Unconfirmed;
        for a in inner.attempts.values_mut().filter(|a| a.tx_id == tx_id) {
            a.broadcast_before_block_num = None;
            if a.id == attempt_id {
                a.state = AttemptState::InProgress;
            }
        }
        Ok(())
    }

    async fn find_transaction_by_nonce(
        &self,
        address: Address,
        nonce: i64,
    ) -> TxmResult<Option<Transaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .txs
            .values()
            .find(|t| {
                t.from_address == address
                    && t.nonce == Some(nonce)
                    && matches!(t.state, TxState::Unconfirmed | TxState::Confirmed)
            })
            .map(|t| inner.full(t)))
    }

    async fn find_attempts_requiring_resend(
        &self,
        address: Address,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> TxmResult<Vec<Attempt>> {
        let inner = self.inner.read().await;
        let mut eligible: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|t| {
                t.from_address == address
                    && t.state == TxState::Unconfirmed
                    && matches!(t.broadcast_at, Some(at) if at <= older_than)
            })
            .map(|t| inner.hydrate(t, |a| a.state != AttemptState::InProgress, false))
            .collect();
        eligible.sort_by_key(|t| t.nonce);

        let mut attempts: Vec<Attempt> = eligible
            .into_iter()
            .filter_map(|t| t.attempts.into_iter().next())
            .collect();
        if limit > 0 {
            attempts.truncate(limit as usize);
        }
        Ok(attempts)
    }

    async fn update_broadcast_ats(&self, now: DateTime<Utc>, tx_ids: Vec<i64>) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        for id in tx_ids {
            if let Some(tx) = inner.txs.get_mut(&id) {
                if tx.broadcast_at.map_or(false, |at| at < now) {
                    tx.broadcast_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn reap_transactions(
        &self,
        min_block_to_keep: i64,
        older_than: DateTime<Utc>,
    ) -> TxmResult<u64> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<i64> = inner
            .txs
            .values()
            .filter(|t| t.created_at < older_than)
            .filter(|t| match t.state {
                TxState::FatalError => true,
                TxState::Confirmed => {
                    let blocks = inner.receipt_blocks_of(t.id);
                    !blocks.is_empty() && blocks.iter().all(|b| *b < min_block_to_keep)
                }
                _ => false,
            })
            .map(|t| t.id)
            .collect();

        for id in &doomed {
            inner.delete_transaction(*id);
        }
        Ok(doomed.len() as u64)
    }

    async fn find_transaction(&self, tx_id: i64) -> TxmResult<Transaction> {
        let inner = self.inner.read().await;
        let tx = inner.tx(tx_id)?;
        Ok(inner.full(tx))
    }

    async fn transactions(&self, offset: u64, limit: u64) -> TxmResult<Page<Transaction>> {
        let inner = self.inner.read().await;
        let items = inner
            .txs
            .values()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            total: inner.txs.len() as u64,
        })
    }

    async fn attempts(&self, offset: u64, limit: u64) -> TxmResult<Page<Attempt>> {
        let inner = self.inner.read().await;
        let items = inner
            .attempts
            .values()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            total: inner.attempts.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{new_tx, raw_attempt, receipt_for};
    use crate::tx::gas::GasPrice;

    async fn store_with_key() -> (InMemoryTxStore, Address) {
        let store = InMemoryTxStore::new();
        let address = Address::repeat_byte(0x11);
        store.ensure_key(address).await.unwrap();
        store.init_next_nonce(address, 0).await.unwrap();
        (store, address)
    }

    #[tokio::test]
    async fn rejects_second_in_progress_transaction_per_address() {
        let (store, address) = store_with_key().await;
        let a = store.create_transaction(new_tx(address), 0).await.unwrap();
        let b = store.create_transaction(new_tx(address), 0).await.unwrap();

        store
            .save_in_progress(a.id, 0, raw_attempt(1, GasPrice::Legacy(10)))
            .await
            .unwrap();
        let err = store
            .save_in_progress(b.id, 1, raw_attempt(2, GasPrice::Legacy(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn save_broadcast_checks_nonce_optimistically() {
        let (store, address) = store_with_key().await;
        let tx = store.create_transaction(new_tx(address), 0).await.unwrap();
        let tx = store
            .save_in_progress(tx.id, 0, raw_attempt(1, GasPrice::Legacy(10)))
            .await
            .unwrap();

        store.fast_forward_nonce(address, 0, 5).await.unwrap();
        let err = store
            .save_broadcast(tx.id, tx.attempts[0].id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::OptimisticLock(_)));

        let tx = store.find_transaction(tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::InProgress);
    }

    #[tokio::test]
    async fn applying_same_receipt_twice_keeps_one_row() {
        let (store, address) = store_with_key().await;
        let tx = store.create_transaction(new_tx(address), 0).await.unwrap();
        let tx = store
            .save_in_progress(tx.id, 0, raw_attempt(1, GasPrice::Legacy(10)))
            .await
            .unwrap();
        let attempt = tx.attempts[0].clone();
        store
            .save_broadcast(tx.id, attempt.id, Utc::now())
            .await
            .unwrap();

        let receipt = receipt_for(attempt.hash, 7, 0xaa);
        let first = store
            .save_fetched_receipts(vec![receipt.clone()])
            .await
            .unwrap();
        assert_eq!(first, vec![tx.id]);
        // Already confirmed: not reported again
        let second = store.save_fetched_receipts(vec![receipt]).await.unwrap();
        assert!(second.is_empty());

        let tx = store.find_transaction(tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Confirmed);
        assert_eq!(store.receipt_count().await, 1);
        assert_eq!(tx.attempts[0].receipts.len(), 1);
    }

    #[tokio::test]
    async fn gas_bump_skips_transactions_without_attempts() {
        let (store, address) = store_with_key().await;
        let tx = store.create_transaction(new_tx(address), 0).await.unwrap();
        store
            .update_transaction(tx.id, |t| {
                t.state = TxState::Unconfirmed;
                t.nonce = Some(0);
            })
            .await;

        let due = store
            .find_transactions_requiring_gas_bump(address, 100, 3, 0)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_newest_for_subject() {
        let (store, address) = store_with_key().await;
        let subject = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let mut new = new_tx(address);
            new.subject = Some(subject);
            ids.push(store.create_transaction(new, 0).await.unwrap().id);
        }
        let other = store.create_transaction(new_tx(address), 0).await.unwrap();

        let pruned = store.prune_unstarted_queue(subject, 2).await.unwrap();
        assert_eq!(pruned, vec![ids[1], ids[0]]);
        assert!(store.find_transaction(other.id).await.is_ok());
        assert!(store.find_transaction(ids[3]).await.is_ok());
    }

    #[tokio::test]
    async fn queue_capacity_is_enforced() {
        let (store, address) = store_with_key().await;
        store.create_transaction(new_tx(address), 2).await.unwrap();
        store.create_transaction(new_tx(address), 2).await.unwrap();
        let err = store.create_transaction(new_tx(address), 2).await.unwrap_err();
        assert!(matches!(err, TxmError::QueueFull { queued: 2, .. }));
    }

    #[tokio::test]
    async fn abandon_fails_queued_work() {
        let (store, address) = store_with_key().await;
        let a = store.create_transaction(new_tx(address), 0).await.unwrap();
        store
            .save_in_progress(a.id, 0, raw_attempt(1, GasPrice::Legacy(10)))
            .await
            .unwrap();
        store.create_transaction(new_tx(address), 0).await.unwrap();

        assert_eq!(store.abandon(address).await.unwrap(), 2);
        let a = store.find_transaction(a.id).await.unwrap();
        assert_eq!(a.state, TxState::FatalError);
        assert_eq!(a.error.as_deref(), Some(ABANDONED));
        assert!(a.attempts.is_empty());
    }
}
