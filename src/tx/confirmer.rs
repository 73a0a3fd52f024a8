//! Confirmer: reconciles broadcast transactions against the chain on every head
//!
//! Per head, under the global confirmer lock:
//! 1. Stamp new broadcast attempts with the head number
//! 2. Fetch receipts for unconfirmed transactions
//! 3. Fail transactions whose receipt never appeared although a later nonce confirmed
//! 4. Re-send leftover in-progress attempts, then bump attempts stuck for too many blocks
//! 5. Demote confirmed transactions whose receipts were reorged out, and re-send them
//!
//! [`Confirmer::force_rebroadcast`] is the operator escape hatch for nonce gaps.

use super::attempt::AttemptBuilder;
use super::errors::{self, SendErrorKind};
use super::fanout;
use super::gas::{BumpError, GasEstimator, GasPrice};
use crate::chain::{BatchRequest, BatchResponse, ChainClient, ChainReceipt, HeadChain};
use crate::config::{GasConfig, TxmConfig};
use crate::error::{TxmError, TxmResult};
use crate::metrics::MetricsRecorder;
use crate::state::{Attempt, AttemptState, LockTarget, NewAttempt, Transaction, TxStore};

use chrono::Utc;
use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error recorded on unconfirmed transactions that never got a receipt
/// while a later nonce from the same address was confirmed
pub const MISSING_RECEIPT: &str =
    "could not get receipt: a later nonce was confirmed and no receipt appeared within finality depth";

/// Error recorded when a nonce was consumed on chain by a transaction we do not hold
pub const NONCE_CONSUMED: &str =
    "nonce was consumed by another transaction and no receipt appeared within finality depth";

/// What to send for a transaction that is due a bump
enum Rebroadcast {
    /// A new, higher-priced attempt
    Bumped(NewAttempt),
    /// No higher price is allowed; send the richest attempt again as is
    Unchanged(Attempt),
}

pub struct Confirmer {
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    estimator: Arc<dyn GasEstimator>,
    builder: Arc<AttemptBuilder>,
    metrics: Arc<dyn MetricsRecorder>,
    config: TxmConfig,
    gas: GasConfig,
}

impl Confirmer {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        estimator: Arc<dyn GasEstimator>,
        builder: Arc<AttemptBuilder>,
        metrics: Arc<dyn MetricsRecorder>,
        config: TxmConfig,
        gas: GasConfig,
    ) -> Self {
        Self {
            store,
            client,
            estimator,
            builder,
            metrics,
            config,
            gas,
        }
    }

    /// Run every duty for a new head
    pub async fn process_head(&self, chain: &HeadChain) -> TxmResult<()> {
        let lock = self.store.advisory_lock(LockTarget::Confirmer).await?;
        let result = self.process_head_locked(chain).await;
        lock.release().await?;
        result
    }

    async fn process_head_locked(&self, chain: &HeadChain) -> TxmResult<()> {
        let head = chain.number();
        debug!(head, "Confirmer processing head");

        self.set_broadcast_before_block_num(head).await?;
        self.check_for_receipts(head).await?;
        self.mark_old_missing_receipts_errored(head).await?;
        self.bump_gas_where_necessary(head).await?;
        self.ensure_confirmed_transactions_in_longest_chain(chain)
            .await
    }

    pub async fn set_broadcast_before_block_num(&self, head: i64) -> TxmResult<()> {
        let stamped = self.store.set_broadcast_before_block_num(head).await?;
        if stamped > 0 {
            debug!(head, stamped, "Stamped broadcast attempts with head");
        }
        Ok(())
    }

    /// Fetch receipts for every unconfirmed transaction and confirm the ones
    /// that have been mined
    pub async fn check_for_receipts(&self, head: i64) -> TxmResult<()> {
        let txs = self.store.find_unconfirmed_with_broadcast_attempts().await?;
        if txs.is_empty() {
            return Ok(());
        }
        debug!(head, unconfirmed = txs.len(), "Checking for receipts");

        let results = fanout::bounded(txs, self.config.fanout_concurrency, |tx| async move {
            self.fetch_receipt(&tx).await
        })
        .await;

        let mut receipts = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(Some(receipt)) => receipts.push(receipt),
                Ok(None) => {}
                Err(e) => failures.push(e),
            }
        }

        if !receipts.is_empty() {
            for receipt in receipts.iter().filter(|r| r.reverted()) {
                warn!(
                    attempt_hash = ?receipt.tx_hash,
                    block_number = ?receipt.block_number,
                    "Transaction reverted on chain"
                );
                self.metrics.reverted_receipt();
            }
            let confirmed = self.store.save_fetched_receipts(receipts).await?;
            for tx_id in &confirmed {
                info!(tx_id, head, "Transaction confirmed");
                self.metrics.confirmed();
            }
        }

        TxmError::aggregate(failures)
    }

    /// Receipt of the first mined attempt, asking for the richest attempts first
    async fn fetch_receipt(&self, tx: &Transaction) -> TxmResult<Option<ChainReceipt>> {
        if let [attempt] = tx.attempts.as_slice() {
            return match self.client.transaction_receipt(attempt.hash).await {
                Ok(receipt) => self.accept_receipt(attempt, receipt),
                Err(e) if errors::is_receipt_not_ready(&e) => Ok(None),
                Err(e) => Err(e),
            };
        }

        for chunk in tx.attempts.chunks(self.config.rpc_batch_size.max(1)) {
            let requests = chunk.iter().map(|a| BatchRequest::Receipt(a.hash)).collect();
            let responses = self.client.batch_call(requests).await?;
            for (attempt, response) in chunk.iter().zip(responses) {
                let receipt = match response {
                    BatchResponse::Receipt(Ok(receipt)) => receipt,
                    BatchResponse::Receipt(Err(message)) => {
                        let e = TxmError::Rpc(message);
                        if errors::is_receipt_not_ready(&e) {
                            debug!(attempt_hash = ?attempt.hash, "Receipt not ready yet");
                            continue;
                        }
                        return Err(e);
                    }
                    BatchResponse::Block(_) => {
                        return Err(TxmError::Internal(
                            "block response to a receipt request".to_string(),
                        ))
                    }
                };
                if let Some(receipt) = self.accept_receipt(attempt, receipt)? {
                    return Ok(Some(receipt));
                }
            }
        }
        Ok(None)
    }

    fn accept_receipt(
        &self,
        attempt: &Attempt,
        receipt: Option<ChainReceipt>,
    ) -> TxmResult<Option<ChainReceipt>> {
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        if receipt.tx_hash != attempt.hash {
            self.metrics.invariant_violation();
            return Err(TxmError::InvariantViolation(format!(
                "receipt for attempt {:?} carries hash {:?}",
                attempt.hash, receipt.tx_hash
            )));
        }
        if !receipt.is_mined() {
            return Ok(None);
        }
        Ok(Some(receipt))
    }

    /// Fail unconfirmed transactions stuck behind a confirmed later nonce
    pub async fn mark_old_missing_receipts_errored(&self, head: i64) -> TxmResult<()> {
        let cutoff = head - self.config.finality_depth as i64;
        if cutoff <= 0 {
            return Ok(());
        }
        let failed = self.store.mark_old_missing_receipt_errored(cutoff).await?;
        for tx_id in &failed {
            error!(
                tx_id,
                cutoff,
                "Transaction never got a receipt although a later nonce confirmed; marking fatal"
            );
            self.metrics.fatal_error();
        }
        Ok(())
    }

    /// Re-send leftover in-progress attempts and bump stuck transactions, per address
    pub async fn bump_gas_where_necessary(&self, head: i64) -> TxmResult<()> {
        let addresses = self.builder.keys().addresses();
        let results = fanout::bounded(addresses, self.config.fanout_concurrency, |address| async move {
            self.rebroadcast_where_necessary(address, head).await.map_err(|e| {
                warn!(address = ?address, head, "Rebroadcast failed: {}", e);
                e
            })
        })
        .await;
        TxmError::aggregate(results.into_iter().filter_map(Result::err).collect())
    }

    async fn rebroadcast_where_necessary(&self, address: Address, head: i64) -> TxmResult<()> {
        self.handle_any_in_progress_attempts(address, head).await?;

        if self.gas.bump_threshold == 0 {
            return Ok(());
        }
        let txs = self
            .store
            .find_transactions_requiring_gas_bump(
                address,
                head,
                self.gas.bump_threshold,
                self.gas.bump_tx_depth,
            )
            .await?;

        // Lowest nonce first; a failure leaves later nonces for the next head
        for tx in txs {
            match self.attempt_for_rebroadcast(&tx).await? {
                Rebroadcast::Bumped(new) => {
                    let attempt = self.store.save_in_progress_attempt(tx.id, new).await?;
                    self.handle_in_progress_attempt(&tx, &attempt, head, false)
                        .await?;
                }
                Rebroadcast::Unchanged(previous) => {
                    self.resend_unchanged(&tx, &previous, head).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_any_in_progress_attempts(&self, address: Address, head: i64) -> TxmResult<()> {
        let txs = self
            .store
            .find_transactions_with_in_progress_attempts(address)
            .await?;
        for tx in txs {
            let Some(attempt) = tx.in_progress_attempt().cloned() else {
                continue;
            };
            self.handle_in_progress_attempt(&tx, &attempt, head, false)
                .await?;
        }
        Ok(())
    }

    async fn attempt_for_rebroadcast(&self, tx: &Transaction) -> TxmResult<Rebroadcast> {
        let previous = tx.attempts.first().cloned().ok_or_else(|| {
            TxmError::InvariantViolation(format!(
                "unconfirmed transaction {} has no attempts",
                tx.id
            ))
        })?;

        match self.estimator.bump(previous.gas_price, tx.gas_limit).await {
            Ok((gas_price, gas_limit)) => {
                info!(
                    tx_id = tx.id,
                    nonce = ?tx.nonce,
                    old_price = %previous.gas_price,
                    new_price = %gas_price,
                    "Bumping gas for stuck transaction"
                );
                self.metrics.gas_bump();
                let attempt = self.builder.repriced_attempt(tx, gas_price, gas_limit)?;
                Ok(Rebroadcast::Bumped(attempt))
            }
            Err(TxmError::GasBump(e)) => {
                if matches!(e, BumpError::ExceedsLimit { .. }) {
                    self.metrics.gas_bump_exceeds_limit();
                }
                error!(
                    tx_id = tx.id,
                    nonce = ?tx.nonce,
                    price = %previous.gas_price,
                    "Cannot bump gas, re-sending the richest attempt unchanged: {}",
                    e
                );
                Ok(Rebroadcast::Unchanged(previous))
            }
            Err(e) => Err(e),
        }
    }

    /// Send an in-progress attempt of an unconfirmed transaction and record
    /// the outcome.
    ///
    /// `reorged` marks an attempt that was already mined once and demoted.
    /// Such an attempt is never discarded and never fails the transaction on
    /// the spot: it is recorded as broadcast and receipts decide.
    async fn handle_in_progress_attempt(
        &self,
        tx: &Transaction,
        attempt: &Attempt,
        head: i64,
        reorged: bool,
    ) -> TxmResult<()> {
        let err = match self
            .client
            .send_raw_transaction(attempt.signed_raw_tx.clone())
            .await
        {
            Ok(()) => return self.store.mark_attempt_broadcast(attempt.id, Utc::now()).await,
            Err(e) => e,
        };

        let kind = errors::from_error(&err);
        self.metrics.send_error(kind.as_str());
        match kind {
            SendErrorKind::AlreadyInMempool => {
                self.store.mark_attempt_broadcast(attempt.id, Utc::now()).await
            }
            SendErrorKind::TerminallyUnderpriced
            | SendErrorKind::TemporarilyUnderpriced
            | SendErrorKind::ReplacementUnderpriced => {
                // The price was raised regardless, so the attempt is kept
                warn!(
                    tx_id = tx.id,
                    attempt_hash = ?attempt.hash,
                    price = %attempt.gas_price,
                    "Re-priced attempt was not accepted ({}): {}",
                    kind,
                    err
                );
                self.store.mark_attempt_broadcast(attempt.id, Utc::now()).await
            }
            SendErrorKind::Fatal if reorged || !has_other_broadcast_attempt(tx, attempt) => {
                warn!(
                    tx_id = tx.id,
                    attempt_hash = ?attempt.hash,
                    "Node rejected the only broadcast attempt, keeping it for receipts: {}",
                    err
                );
                self.store.mark_attempt_broadcast(attempt.id, Utc::now()).await
            }
            SendErrorKind::Fatal => {
                error!(
                    tx_id = tx.id,
                    attempt_hash = ?attempt.hash,
                    "Fatal error sending attempt, discarding it: {}",
                    err
                );
                self.store.delete_in_progress_attempt(attempt.id).await
            }
            SendErrorKind::NonceTooLow => {
                if !reorged && self.nonce_consumed_elsewhere(tx, head) {
                    return self.fail_consumed_nonce(tx).await;
                }
                // Most likely an earlier attempt was mined; receipts will tell
                debug!(tx_id = tx.id, nonce = ?tx.nonce, "Nonce too low on re-send");
                self.store.mark_attempt_broadcast(attempt.id, Utc::now()).await
            }
            SendErrorKind::InsufficientFunds | SendErrorKind::Unknown => {
                warn!(
                    tx_id = tx.id,
                    attempt_hash = ?attempt.hash,
                    "Attempt left in progress after send failed ({}): {}",
                    kind,
                    err
                );
                Err(err)
            }
        }
    }

    async fn resend_unchanged(&self, tx: &Transaction, previous: &Attempt, head: i64) -> TxmResult<()> {
        let err = match self
            .client
            .send_raw_transaction(previous.signed_raw_tx.clone())
            .await
        {
            Ok(()) => return self.store.update_broadcast_ats(Utc::now(), vec![tx.id]).await,
            Err(e) => e,
        };

        let kind = errors::from_error(&err);
        self.metrics.send_error(kind.as_str());
        match kind {
            SendErrorKind::NonceTooLow if self.nonce_consumed_elsewhere(tx, head) => {
                self.fail_consumed_nonce(tx).await
            }
            SendErrorKind::Unknown | SendErrorKind::InsufficientFunds => Err(err),
            _ => {
                debug!(tx_id = tx.id, attempt_hash = ?previous.hash, "Unchanged re-send: {}", err);
                Ok(())
            }
        }
    }

    /// Nonce-too-low with no receipt for any attempt, for longer than the finality depth.
    /// Block stamps restart when a reorg demotes the transaction.
    fn nonce_consumed_elsewhere(&self, tx: &Transaction, head: i64) -> bool {
        if tx.has_receipts() {
            return false;
        }
        let cutoff = head - self.config.finality_depth as i64;
        matches!(
            tx.attempts.iter().filter_map(|a| a.broadcast_before_block_num).min(),
            Some(first) if first <= cutoff
        )
    }

    async fn fail_consumed_nonce(&self, tx: &Transaction) -> TxmResult<()> {
        error!(
            address = ?tx.from_address,
            tx_id = tx.id,
            nonce = ?tx.nonce,
            "Nonce was consumed by a transaction this manager does not hold; marking fatal"
        );
        self.store
            .mark_unconfirmed_fatal(tx.id, NONCE_CONSUMED.to_string())
            .await?;
        self.metrics.fatal_error();
        Ok(())
    }

    /// Demote confirmed transactions whose receipts fell off the canonical
    /// chain, and re-send their richest attempt
    pub async fn ensure_confirmed_transactions_in_longest_chain(
        &self,
        chain: &HeadChain,
    ) -> TxmResult<()> {
        let txs = self
            .store
            .find_confirmed_with_receipts_since(chain.earliest().number)
            .await?;

        let mut failures = Vec::new();
        for tx in txs {
            if has_receipt_in_chain(&tx, chain) {
                continue;
            }
            if let Err(e) = self.rebroadcast_reorged(&tx, chain.number()).await {
                error!(tx_id = tx.id, "Failed to re-send reorged transaction: {}", e);
                failures.push(e);
            }
        }
        TxmError::aggregate(failures)
    }

    async fn rebroadcast_reorged(&self, tx: &Transaction, head: i64) -> TxmResult<()> {
        let richest = tx.attempts.first().ok_or_else(|| {
            TxmError::InvariantViolation(format!("confirmed transaction {} has no attempts", tx.id))
        })?;
        warn!(
            address = ?tx.from_address,
            tx_id = tx.id,
            nonce = ?tx.nonce,
            attempt_hash = ?richest.hash,
            head,
            "Receipt no longer in the canonical chain; re-sending transaction"
        );
        self.store.mark_for_rebroadcast(tx.id, richest.id).await?;
        self.metrics.reorg_rebroadcast();

        let tx = self.store.find_transaction(tx.id).await?;
        let attempt = tx.in_progress_attempt().cloned().ok_or_else(|| {
            TxmError::InvariantViolation(format!(
                "transaction {} has no in-progress attempt after demotion",
                tx.id
            ))
        })?;
        self.handle_in_progress_attempt(&tx, &attempt, head, true)
            .await
    }

    /// Re-send one legacy attempt per nonce in `begin..=end` at the given
    /// price. Nonces without a transaction get a zero-value transfer to self.
    /// Nothing is persisted; failures are logged per nonce.
    pub async fn force_rebroadcast(
        &self,
        address: Address,
        begin_nonce: i64,
        end_nonce: i64,
        gas_price_wei: u64,
        gas_limit: Option<u64>,
    ) -> TxmResult<u64> {
        info!(
            address = ?address,
            begin_nonce,
            end_nonce,
            gas_price_wei,
            "Force rebroadcasting nonce range"
        );
        let mut sent = 0;
        for nonce in begin_nonce..=end_nonce {
            let attempt = match self.store.find_transaction_by_nonce(address, nonce).await {
                Ok(Some(tx)) => self.builder.new_attempt(
                    &tx,
                    nonce,
                    GasPrice::Legacy(gas_price_wei),
                    gas_limit.unwrap_or(tx.gas_limit),
                ),
                Ok(None) => {
                    debug!(address = ?address, nonce, "No transaction for nonce, sending empty one");
                    self.builder.new_empty_attempt(
                        address,
                        nonce,
                        GasPrice::Legacy(gas_price_wei),
                        gas_limit.unwrap_or(self.config.default_gas_limit),
                    )
                }
                Err(e) => Err(e),
            };

            let result = match attempt {
                Ok(attempt) => self
                    .client
                    .send_raw_transaction(attempt.signed_raw_tx)
                    .await
                    .map(|_| attempt.hash),
                Err(e) => Err(e),
            };
            match result {
                Ok(hash) => {
                    info!(address = ?address, nonce, attempt_hash = ?hash, "Force rebroadcast sent");
                    sent += 1;
                }
                Err(e) => error!(address = ?address, nonce, "Force rebroadcast failed: {}", e),
            }
        }
        Ok(sent)
    }
}

/// Whether any receipt of `tx` is on `chain`. Receipts below the window are
/// taken as final, and receipts above the head cannot be judged yet.
fn has_receipt_in_chain(tx: &Transaction, chain: &HeadChain) -> bool {
    let earliest = chain.earliest().number;
    let head = chain.number();
    tx.attempts
        .iter()
        .flat_map(|a| a.receipts.iter())
        .any(|r| {
            r.block_number < earliest
                || r.block_number > head
                || chain.hash_at_height(r.block_number) == Some(r.block_hash)
        })
}

fn has_other_broadcast_attempt(tx: &Transaction, attempt: &Attempt) -> bool {
    tx.attempts
        .iter()
        .any(|a| a.id != attempt.id && a.state == AttemptState::Broadcast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingRecorder;
    use crate::state::{AttemptState, InMemoryTxStore, TxState};
    use crate::testutil::{
        block_hash, forked_chain, head_chain, mined_receipt, new_tx, test_address, test_builder,
        test_estimator, test_gas_config, FakeChainClient,
    };
    use ethers::types::Bytes;

    struct Harness {
        store: InMemoryTxStore,
        client: Arc<FakeChainClient>,
        metrics: Arc<CountingRecorder>,
        confirmer: Confirmer,
    }

    fn harness(config: TxmConfig) -> Harness {
        let store = InMemoryTxStore::new();
        let client = Arc::new(FakeChainClient::new());
        let metrics = Arc::new(CountingRecorder::new());
        let confirmer = Confirmer::new(
            Arc::new(store.clone()),
            client.clone(),
            test_estimator(),
            test_builder(),
            metrics.clone(),
            config,
            test_gas_config(),
        );
        Harness {
            store,
            client,
            metrics,
            confirmer,
        }
    }

    fn config() -> TxmConfig {
        TxmConfig {
            finality_depth: 10,
            ..TxmConfig::default()
        }
    }

    /// Queue and broadcast a transaction at `nonce` with a signed legacy attempt
    async fn broadcast_tx(h: &Harness, nonce: i64, price: u64) -> Transaction {
        let address = test_address();
        h.store.ensure_key(address).await.unwrap();
        if h.store.get_key(address).await.unwrap().next_nonce.is_none() {
            h.store.init_next_nonce(address, nonce).await.unwrap();
        }
        let tx = h.store.create_transaction(new_tx(address), 0).await.unwrap();
        let attempt = test_builder()
            .new_attempt(&tx, nonce, GasPrice::Legacy(price), 21_000)
            .unwrap();
        let tx = h.store.save_in_progress(tx.id, nonce, attempt).await.unwrap();
        h.store
            .save_broadcast(tx.id, tx.attempts[0].id, Utc::now())
            .await
            .unwrap();
        h.store.find_transaction(tx.id).await.unwrap()
    }

    /// Add a broadcast attempt at `price`, stamped with `bbbn`
    async fn add_attempt(h: &Harness, tx: &Transaction, price: u64, bbbn: i64) -> Attempt {
        let new = test_builder()
            .repriced_attempt(tx, GasPrice::Legacy(price), 21_000)
            .unwrap();
        let attempt = h.store.save_in_progress_attempt(tx.id, new).await.unwrap();
        h.store
            .mark_attempt_broadcast(attempt.id, Utc::now())
            .await
            .unwrap();
        h.store
            .update_attempt(attempt.id, |a| a.broadcast_before_block_num = Some(bbbn))
            .await;
        attempt
    }

    #[tokio::test]
    async fn confirms_on_receipt_and_is_idempotent() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let attempt = &tx.attempts[0];
        h.client
            .set_receipt(attempt.hash, mined_receipt(attempt.hash, 5, block_hash(5, 0)));

        h.confirmer.check_for_receipts(6).await.unwrap();
        let confirmed = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(confirmed.state, TxState::Confirmed);
        assert_eq!(h.store.receipt_count().await, 1);
        assert_eq!(h.metrics.count("confirmed"), 1);

        // Applying the same receipt again changes nothing
        let again = h
            .store
            .save_fetched_receipts(vec![mined_receipt(attempt.hash, 5, block_hash(5, 0))])
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(h.store.receipt_count().await, 1);
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Confirmed
        );
    }

    #[tokio::test]
    async fn finds_receipt_of_any_attempt() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let cheap = tx.attempts[0].clone();
        add_attempt(&h, &tx, 36, 2).await;
        add_attempt(&h, &tx, 43, 3).await;
        // The cheapest attempt is the one mined
        h.client
            .set_receipt(cheap.hash, mined_receipt(cheap.hash, 4, block_hash(4, 0)));

        h.confirmer.check_for_receipts(5).await.unwrap();
        let tx = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Confirmed);
        let with_receipt: Vec<_> = tx.attempts.iter().filter(|a| !a.receipts.is_empty()).collect();
        assert_eq!(with_receipt.len(), 1);
        assert_eq!(with_receipt[0].hash, cheap.hash);
    }

    #[tokio::test]
    async fn pending_receipt_does_not_confirm() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let hash = tx.attempts[0].hash;
        let mut pending = mined_receipt(hash, 0, block_hash(0, 0));
        pending.block_hash = None;
        pending.block_number = None;
        h.client.set_receipt(hash, pending);

        h.confirmer.check_for_receipts(5).await.unwrap();
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Unconfirmed
        );
    }

    #[tokio::test]
    async fn mismatched_receipt_is_an_invariant_violation() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let hash = tx.attempts[0].hash;
        h.client.set_receipt(
            hash,
            mined_receipt(ethers::types::H256::repeat_byte(0x77), 5, block_hash(5, 0)),
        );

        let err = h.confirmer.check_for_receipts(6).await.unwrap_err();
        assert!(matches!(err, TxmError::InvariantViolation(_)));
        assert_eq!(h.metrics.count("invariant_violation"), 1);
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Unconfirmed
        );
    }

    #[tokio::test]
    async fn reverted_receipt_still_confirms() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let hash = tx.attempts[0].hash;
        let mut receipt = mined_receipt(hash, 5, block_hash(5, 0));
        receipt.status = Some(0);
        h.client.set_receipt(hash, receipt);

        h.confirmer.check_for_receipts(6).await.unwrap();
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Confirmed
        );
        assert_eq!(h.metrics.count("reverted_receipt"), 1);
    }

    #[tokio::test]
    async fn bumps_only_after_threshold() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        h.confirmer.set_broadcast_before_block_num(10).await.unwrap();

        // 12 - 3 < 10: too young
        h.confirmer.bump_gas_where_necessary(12).await.unwrap();
        assert_eq!(h.store.find_transaction(tx.id).await.unwrap().attempts.len(), 1);

        h.confirmer.bump_gas_where_necessary(13).await.unwrap();
        let bumped = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(bumped.attempts.len(), 2);
        assert_eq!(bumped.attempts[0].gas_price, GasPrice::Legacy(36));
        assert_eq!(bumped.attempts[0].state, AttemptState::Broadcast);
        assert_eq!(h.client.sent().last(), Some(&bumped.attempts[0].signed_raw_tx));
        assert_eq!(h.metrics.count("gas_bump"), 1);

        // The new attempt has no block number yet, so no second bump
        h.confirmer.bump_gas_where_necessary(20).await.unwrap();
        assert_eq!(h.store.find_transaction(tx.id).await.unwrap().attempts.len(), 2);
    }

    #[tokio::test]
    async fn bump_at_limit_resends_richest_unchanged() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 480).await;
        h.confirmer.set_broadcast_before_block_num(10).await.unwrap();

        h.confirmer.bump_gas_where_necessary(13).await.unwrap();
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.attempts.len(), 1);
        assert_eq!(h.client.sent(), vec![tx.attempts[0].signed_raw_tx.clone()]);
        assert_eq!(h.metrics.count("gas_bump_exceeds_limit"), 1);
    }

    #[tokio::test]
    async fn fatal_bump_discards_only_the_new_attempt() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        h.confirmer.set_broadcast_before_block_num(10).await.unwrap();
        h.client.fail_next_send("intrinsic gas too low");

        h.confirmer.bump_gas_where_necessary(13).await.unwrap();
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::Unconfirmed);
        assert_eq!(after.attempts.len(), 1);
        assert_eq!(after.attempts[0].gas_price, GasPrice::Legacy(30));
    }

    #[tokio::test]
    async fn underpriced_bump_is_still_recorded() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        h.confirmer.set_broadcast_before_block_num(10).await.unwrap();
        h.client.fail_next_send("replacement transaction underpriced");

        h.confirmer.bump_gas_where_necessary(13).await.unwrap();
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.attempts.len(), 2);
        assert!(after
            .attempts
            .iter()
            .all(|a| a.state == AttemptState::Broadcast));
    }

    #[tokio::test]
    async fn unknown_error_leaves_attempt_in_progress_for_next_head() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        h.confirmer.set_broadcast_before_block_num(10).await.unwrap();
        h.client.push_send(Err(TxmError::Timeout {
            operation: "eth_sendRawTransaction".to_string(),
        }));

        assert!(h.confirmer.bump_gas_where_necessary(13).await.is_err());
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert!(after.in_progress_attempt().is_some());

        // Next head re-sends the leftover attempt before anything else
        h.confirmer.bump_gas_where_necessary(14).await.unwrap();
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert!(after.in_progress_attempt().is_none());
        assert_eq!(after.attempts.len(), 2);
    }

    #[tokio::test]
    async fn sustained_nonce_too_low_without_receipt_is_fatal() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        h.confirmer.set_broadcast_before_block_num(10).await.unwrap();

        // Within finality depth: recorded as broadcast
        h.client.fail_next_send("nonce too low");
        h.confirmer.bump_gas_where_necessary(13).await.unwrap();
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Unconfirmed
        );

        // Past finality depth of the first broadcast
        h.client.fail_next_send("nonce too low");
        let all = h.store.find_transaction(tx.id).await.unwrap();
        for a in &all.attempts {
            h.store
                .update_attempt(a.id, |a| a.broadcast_before_block_num = Some(10))
                .await;
        }
        h.confirmer.bump_gas_where_necessary(25).await.unwrap();
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::FatalError);
        assert_eq!(after.error.as_deref(), Some(NONCE_CONSUMED));
        assert_eq!(h.metrics.count("fatal_error"), 1);
    }

    #[tokio::test]
    async fn reorged_receipt_demotes_and_resends_unchanged() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let attempt = tx.attempts[0].clone();
        h.store
            .save_fetched_receipts(vec![mined_receipt(attempt.hash, 18, block_hash(18, 0))])
            .await
            .unwrap();

        // Canonical chain keeps block 18 on branch 0: nothing happens
        h.confirmer
            .ensure_confirmed_transactions_in_longest_chain(&head_chain(20, 10, 0))
            .await
            .unwrap();
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Confirmed
        );

        // Block 18 replaced by a fork
        let forked = forked_chain(20, 10, 17, 1);
        h.confirmer
            .ensure_confirmed_transactions_in_longest_chain(&forked)
            .await
            .unwrap();
        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::Unconfirmed);
        assert!(!after.has_receipts());
        assert_eq!(after.nonce, Some(0));
        assert_eq!(after.attempts.len(), 1);
        assert_eq!(after.attempts[0].state, AttemptState::Broadcast);
        assert_eq!(h.client.sent(), vec![attempt.signed_raw_tx.clone()]);
        assert_eq!(h.metrics.count("reorg_rebroadcast"), 1);
    }

    #[tokio::test]
    async fn reorged_resend_answered_nonce_too_low_waits_for_receipts() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let a1 = tx.attempts[0].clone();
        h.store
            .update_attempt(a1.id, |a| a.broadcast_before_block_num = Some(5))
            .await;
        let a2 = add_attempt(&h, &tx, 36, 15).await;
        h.store
            .save_fetched_receipts(vec![mined_receipt(a2.hash, 18, block_hash(18, 0))])
            .await
            .unwrap();

        // Re-mined on the new branch, so the node already has the nonce
        h.client.fail_next_send("nonce too low");
        h.confirmer
            .ensure_confirmed_transactions_in_longest_chain(&forked_chain(20, 10, 17, 1))
            .await
            .unwrap();

        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::Unconfirmed);
        assert!(after.error.is_none());
        assert_eq!(after.attempts.len(), 2);
        assert!(after
            .attempts
            .iter()
            .all(|a| a.state == AttemptState::Broadcast && a.broadcast_before_block_num.is_none()));
        assert_eq!(h.metrics.count("fatal_error"), 0);

        // The receipt on the new branch confirms it again
        h.confirmer.set_broadcast_before_block_num(21).await.unwrap();
        h.client
            .set_receipt(a2.hash, mined_receipt(a2.hash, 19, block_hash(19, 1)));
        h.confirmer.check_for_receipts(21).await.unwrap();
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Confirmed
        );
    }

    #[tokio::test]
    async fn fatal_answer_to_reorged_resend_keeps_the_mined_attempt() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let attempt = tx.attempts[0].clone();
        h.store
            .save_fetched_receipts(vec![mined_receipt(attempt.hash, 18, block_hash(18, 0))])
            .await
            .unwrap();

        h.client.fail_next_send("nonce too high");
        h.confirmer
            .ensure_confirmed_transactions_in_longest_chain(&forked_chain(20, 10, 17, 1))
            .await
            .unwrap();

        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::Unconfirmed);
        assert_eq!(after.attempts.len(), 1);
        assert_eq!(after.attempts[0].hash, attempt.hash);
        assert_eq!(after.attempts[0].state, AttemptState::Broadcast);

        // Still visible to receipt checks and bumping on later heads
        h.confirmer.set_broadcast_before_block_num(21).await.unwrap();
        assert_eq!(
            h.store
                .find_unconfirmed_with_broadcast_attempts()
                .await
                .unwrap()
                .len(),
            1
        );
        h.confirmer.bump_gas_where_necessary(40).await.unwrap();
        let bumped = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(bumped.attempts.len(), 2);
        assert_eq!(bumped.attempts[1].hash, attempt.hash);
    }

    #[tokio::test]
    async fn reorg_with_receipts_on_several_forks_resends_richest() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let a1 = tx.attempts[0].clone();
        let a2 = add_attempt(&h, &tx, 36, 15).await;
        let a3 = add_attempt(&h, &tx, 43, 16).await;
        h.store
            .save_fetched_receipts(vec![
                mined_receipt(a1.hash, 16, block_hash(16, 2)),
                mined_receipt(a2.hash, 17, block_hash(17, 3)),
                mined_receipt(a3.hash, 18, block_hash(18, 4)),
            ])
            .await
            .unwrap();

        h.confirmer
            .ensure_confirmed_transactions_in_longest_chain(&head_chain(20, 10, 0))
            .await
            .unwrap();

        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::Unconfirmed);
        assert_eq!(h.client.sent(), vec![a3.signed_raw_tx.clone()]);
        assert_eq!(after.attempts[0].hash, a3.hash);
    }

    #[tokio::test]
    async fn receipts_below_window_are_final() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let attempt = tx.attempts[0].clone();
        h.store
            .save_fetched_receipts(vec![mined_receipt(attempt.hash, 5, block_hash(5, 9))])
            .await
            .unwrap();

        h.confirmer
            .ensure_confirmed_transactions_in_longest_chain(&head_chain(20, 10, 0))
            .await
            .unwrap();
        assert_eq!(
            h.store.find_transaction(tx.id).await.unwrap().state,
            TxState::Confirmed
        );
        assert!(h.client.sent().is_empty());
    }

    #[tokio::test]
    async fn marks_missing_receipts_behind_confirmed_nonce() {
        let h = harness(config());
        let stuck = broadcast_tx(&h, 0, 30).await;
        let later = broadcast_tx(&h, 1, 30).await;
        h.confirmer.set_broadcast_before_block_num(3).await.unwrap();
        h.store
            .save_fetched_receipts(vec![mined_receipt(
                later.attempts[0].hash,
                4,
                block_hash(4, 0),
            )])
            .await
            .unwrap();

        // Head 12: cutoff 2 is before the broadcast
        h.confirmer.mark_old_missing_receipts_errored(12).await.unwrap();
        assert_eq!(
            h.store.find_transaction(stuck.id).await.unwrap().state,
            TxState::Unconfirmed
        );

        h.confirmer.mark_old_missing_receipts_errored(13).await.unwrap();
        let failed = h.store.find_transaction(stuck.id).await.unwrap();
        assert_eq!(failed.state, TxState::FatalError);
        assert_eq!(failed.error.as_deref(), Some(MISSING_RECEIPT));
    }

    #[tokio::test]
    async fn process_head_runs_duties_in_order() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 0, 30).await;
        let attempt = tx.attempts[0].clone();
        h.client
            .set_receipt(attempt.hash, mined_receipt(attempt.hash, 20, block_hash(20, 0)));

        let chain = head_chain(20, 10, 0);
        h.confirmer.process_head(&chain).await.unwrap();

        let after = h.store.find_transaction(tx.id).await.unwrap();
        assert_eq!(after.state, TxState::Confirmed);
        assert_eq!(after.attempts[0].broadcast_before_block_num, Some(20));
        assert!(h.client.sent().is_empty());
    }

    #[tokio::test]
    async fn force_rebroadcast_fills_gaps_with_empty_transactions() {
        let h = harness(config());
        let tx = broadcast_tx(&h, 1, 30).await;
        h.client.fail_next_send("nonce too low");

        let sent = h
            .confirmer
            .force_rebroadcast(test_address(), 0, 2, 100, Some(50_000))
            .await
            .unwrap();

        // Nonce 0 failed and was skipped; nonces 1 and 2 went out
        assert_eq!(sent, 2);
        let raws: Vec<Bytes> = h.client.sent();
        assert_eq!(raws.len(), 3);
        assert_ne!(raws[1], tx.attempts[0].signed_raw_tx);
        // No rows were written
        assert_eq!(h.store.transaction_count().await, 1);
        assert_eq!(h.store.find_transaction(tx.id).await.unwrap().attempts.len(), 1);
    }
}
