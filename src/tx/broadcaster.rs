//! Broadcaster: promotes queued transactions for one address at a time
//!
//! Each transaction is promoted `unstarted -> in_progress -> unconfirmed` (or
//! `fatal_error`) under the address's advisory lock:
//! 1. Resume any `in_progress` row left by a crash. Whether its send reached
//!    a node is unknown, so it is sent again.
//! 2. Take the next queued row, assign the next nonce, sign and persist the
//!    first attempt as `in_progress`.
//! 3. Send, and persist the outcome according to the classified error.

use super::attempt::AttemptBuilder;
use super::errors::{self, SendErrorKind};
use super::gas::GasEstimator;
use crate::chain::ChainClient;
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::metrics::MetricsRecorder;
use crate::state::{Attempt, LockTarget, Transaction, TxStore};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// How a promote cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promoted {
    /// A transaction left `unstarted`; there may be more
    One,
    /// Nothing queued, or the in-flight limit was reached
    Idle,
}

pub struct Broadcaster {
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    estimator: Arc<dyn GasEstimator>,
    builder: Arc<AttemptBuilder>,
    metrics: Arc<dyn MetricsRecorder>,
    config: TxmConfig,
    triggers: DashMap<Address, Arc<Notify>>,
}

impl Broadcaster {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        estimator: Arc<dyn GasEstimator>,
        builder: Arc<AttemptBuilder>,
        metrics: Arc<dyn MetricsRecorder>,
        config: TxmConfig,
    ) -> Self {
        Self {
            store,
            client,
            estimator,
            builder,
            metrics,
            config,
            triggers: DashMap::new(),
        }
    }

    fn register(&self, address: Address) -> Arc<Notify> {
        self.triggers
            .entry(address)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake the worker of `address` now instead of at its next poll
    pub fn trigger(&self, address: Address) {
        match self.triggers.get(&address) {
            Some(notify) => notify.notify_one(),
            None => warn!(address = ?address, "Trigger for an address with no broadcaster, ignoring"),
        }
    }

    /// Worker loop for one address. Finishes its current cycle before
    /// honouring shutdown.
    pub async fn run_key(self: Arc<Self>, address: Address, mut shutdown: watch::Receiver<bool>) {
        let trigger = self.register(address);
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        info!(address = ?address, "Broadcaster started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.process_unstarted_for(address).await {
                if e.should_alert() {
                    error!(address = ?address, "Broadcast cycle failed: {}", e);
                } else {
                    warn!(address = ?address, "Broadcast cycle failed, retrying next cycle: {}", e);
                }
            }
        }
        info!(address = ?address, "Broadcaster stopped");
    }

    /// Promote queued transactions until the queue is empty, the in-flight
    /// limit is hit, or a send fails with an unknown outcome
    pub async fn process_unstarted_for(&self, address: Address) -> TxmResult<()> {
        self.store.ensure_key(address).await?;
        loop {
            let lock = self.store.advisory_lock(LockTarget::Key(address)).await?;
            let result = self.promote_one(address).await;
            lock.release().await?;

            match result? {
                Promoted::One => continue,
                Promoted::Idle => return Ok(()),
            }
        }
    }

    async fn promote_one(&self, address: Address) -> TxmResult<Promoted> {
        if let Some(tx) = self.store.find_in_progress_transaction(address).await? {
            info!(
                address = ?address,
                tx_id = tx.id,
                nonce = ?tx.nonce,
                "Resuming in-progress transaction"
            );
            self.handle_in_progress(tx, true).await?;
        }

        if self.config.max_in_flight > 0 {
            let in_flight = self.store.count_unconfirmed(address).await?;
            if in_flight >= self.config.max_in_flight {
                debug!(
                    address = ?address,
                    in_flight,
                    max = self.config.max_in_flight,
                    "Too many transactions in flight, not promoting more"
                );
                return Ok(Promoted::Idle);
            }
        }

        let Some(tx) = self.store.next_unstarted_transaction(address).await? else {
            return Ok(Promoted::Idle);
        };

        let nonce = self.next_nonce(address).await?;
        let (gas_price, gas_limit) = self.estimator.estimate(&tx.payload, tx.gas_limit).await?;
        let attempt = self.builder.new_attempt(&tx, nonce, gas_price, gas_limit)?;
        debug!(
            address = ?address,
            tx_id = tx.id,
            nonce,
            attempt_hash = ?attempt.hash,
            gas_price = %gas_price,
            "Promoting transaction"
        );

        let tx = self.store.save_in_progress(tx.id, nonce, attempt).await?;
        self.handle_in_progress(tx, false).await?;
        Ok(Promoted::One)
    }

    /// The key's next nonce, reading the chain on the address's first use
    async fn next_nonce(&self, address: Address) -> TxmResult<i64> {
        if let Some(nonce) = self.store.get_key(address).await?.next_nonce {
            return Ok(nonce);
        }
        let nonce = self.client.pending_nonce_at(address).await? as i64;
        self.store.init_next_nonce(address, nonce).await?;
        info!(address = ?address, nonce, "Initialised next nonce from chain");
        Ok(nonce)
    }

    /// Send the in-progress attempt and persist the outcome. `resumed` is set
    /// when the row was left over by an earlier process.
    async fn handle_in_progress(&self, tx: Transaction, resumed: bool) -> TxmResult<()> {
        if tx.attempts.len() != 1 {
            self.metrics.invariant_violation();
            return Err(TxmError::InvariantViolation(format!(
                "in-progress transaction {} has {} attempts, expected exactly 1",
                tx.id,
                tx.attempts.len()
            )));
        }
        let mut attempt = match tx.in_progress_attempt() {
            Some(a) => a.clone(),
            None => {
                self.metrics.invariant_violation();
                return Err(TxmError::InvariantViolation(format!(
                    "in-progress transaction {} has no in-progress attempt",
                    tx.id
                )));
            }
        };

        loop {
            let err = match self
                .client
                .send_raw_transaction(attempt.signed_raw_tx.clone())
                .await
            {
                Ok(()) => return self.save_sent(&tx, &attempt).await,
                Err(e) => e,
            };

            let kind = errors::from_error(&err);
            self.metrics.send_error(kind.as_str());
            match kind {
                SendErrorKind::AlreadyInMempool => {
                    debug!(tx_id = tx.id, attempt_hash = ?attempt.hash, "Already in mempool");
                    return self.save_sent(&tx, &attempt).await;
                }
                SendErrorKind::Fatal => {
                    error!(
                        address = ?tx.from_address,
                        tx_id = tx.id,
                        nonce = ?tx.nonce,
                        attempt_hash = ?attempt.hash,
                        "Fatal error sending transaction, releasing nonce: {}",
                        err
                    );
                    self.store.save_fatal(tx.id, err.to_string()).await?;
                    self.metrics.fatal_error();
                    return Ok(());
                }
                SendErrorKind::NonceTooLow | SendErrorKind::ReplacementUnderpriced if resumed => {
                    info!(
                        tx_id = tx.id,
                        nonce = ?tx.nonce,
                        "Resumed send rejected with {}; assuming the earlier send landed",
                        kind
                    );
                    return self.store.save_broadcast(tx.id, attempt.id, Utc::now()).await;
                }
                SendErrorKind::NonceTooLow | SendErrorKind::ReplacementUnderpriced => {
                    let requeued = self
                        .store
                        .save_broadcast_and_requeue(tx.id, attempt.id, Utc::now())
                        .await?;
                    warn!(
                        address = ?tx.from_address,
                        tx_id = tx.id,
                        nonce = ?tx.nonce,
                        requeued_tx_id = requeued.id,
                        "Nonce was used by another sender ({}); requeued as a new transaction",
                        kind
                    );
                    return Ok(());
                }
                SendErrorKind::TerminallyUnderpriced => {
                    attempt = self.reprice(&tx, &attempt).await?;
                    continue;
                }
                SendErrorKind::TemporarilyUnderpriced => {
                    warn!(
                        tx_id = tx.id,
                        attempt_hash = ?attempt.hash,
                        "Node is temporarily refusing transactions at this price, retrying next cycle: {}",
                        err
                    );
                    return Err(err);
                }
                SendErrorKind::InsufficientFunds => {
                    error!(
                        address = ?tx.from_address,
                        tx_id = tx.id,
                        "Insufficient funds to send transaction, retrying next cycle: {}",
                        err
                    );
                    return Err(err);
                }
                SendErrorKind::Unknown => return Err(err),
            }
        }
    }

    /// Swap the in-progress attempt for a bumped one
    async fn reprice(&self, tx: &Transaction, attempt: &Attempt) -> TxmResult<Attempt> {
        let (gas_price, gas_limit) = match self.estimator.bump(attempt.gas_price, tx.gas_limit).await {
            Ok(bumped) => bumped,
            Err(e) => {
                if matches!(e, TxmError::GasBump(_)) {
                    self.metrics.gas_bump_exceeds_limit();
                }
                return Err(e);
            }
        };
        let new = self.builder.repriced_attempt(tx, gas_price, gas_limit)?;
        warn!(
            tx_id = tx.id,
            nonce = ?tx.nonce,
            old_price = %attempt.gas_price,
            new_price = %gas_price,
            "Transaction underpriced for this node, bumping gas"
        );
        self.store.replace_in_progress_attempt(attempt.id, new).await
    }

    async fn save_sent(&self, tx: &Transaction, attempt: &Attempt) -> TxmResult<()> {
        let now = Utc::now();
        self.store.save_broadcast(tx.id, attempt.id, now).await?;
        if tx.initial_broadcast_at.is_none() {
            self.metrics
                .time_until_broadcast((now - tx.created_at).to_std().unwrap_or_default());
        }
        self.metrics.broadcast();
        info!(
            address = ?tx.from_address,
            tx_id = tx.id,
            nonce = ?tx.nonce,
            attempt_hash = ?attempt.hash,
            gas_price = %attempt.gas_price,
            "Transaction broadcast"
        );
        Ok(())
    }
}
