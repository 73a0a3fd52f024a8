//! Resender: re-sends attempts that have gone quiet
//!
//! Nodes drop transactions from their mempool without telling anyone. Any
//! unconfirmed transaction whose last send is older than the threshold gets
//! its richest attempt sent again, unchanged.

use super::attempt::KeyStore;
use super::errors::{self, SendErrorKind};
use super::fanout;
use crate::chain::ChainClient;
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::metrics::MetricsRecorder;
use crate::state::{Attempt, TxStore};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Resender {
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    keys: Arc<KeyStore>,
    metrics: Arc<dyn MetricsRecorder>,
    config: TxmConfig,
}

impl Resender {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        keys: Arc<KeyStore>,
        metrics: Arc<dyn MetricsRecorder>,
        config: TxmConfig,
    ) -> Self {
        Self {
            store,
            client,
            keys,
            metrics,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.resend_after_threshold_secs == 0 {
            info!("Resender disabled");
            return;
        }
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.resend_interval_secs.max(1),
        ));
        info!(
            threshold_secs = self.config.resend_after_threshold_secs,
            "Resender started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resend_unconfirmed_at(Utc::now()).await {
                        warn!("Resend cycle failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Resender stopped");
    }

    /// Re-send for every key. Returns the number of attempts the nodes took.
    pub async fn resend_unconfirmed_at(&self, now: DateTime<Utc>) -> TxmResult<u64> {
        let older_than = now - ChronoDuration::seconds(self.config.resend_after_threshold_secs as i64);

        let mut resent = 0;
        let mut failures = Vec::new();
        for address in self.keys.addresses() {
            match self.resend_for(address, older_than, now).await {
                Ok(n) => resent += n,
                Err(e) => {
                    warn!(address = ?address, "Resend failed: {}", e);
                    failures.push(e);
                }
            }
        }
        TxmError::aggregate(failures)?;
        Ok(resent)
    }

    async fn resend_for(
        &self,
        address: Address,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TxmResult<u64> {
        let limit = u32::try_from(self.config.max_in_flight).unwrap_or(u32::MAX);
        let attempts = self
            .store
            .find_attempts_requiring_resend(address, older_than, limit)
            .await?;
        if attempts.is_empty() {
            return Ok(0);
        }
        info!(
            address = ?address,
            count = attempts.len(),
            "Re-sending transactions not sent for {}s",
            self.config.resend_after_threshold_secs
        );

        let outcomes = fanout::bounded(attempts, self.config.fanout_concurrency, |attempt| async move {
            let result = self.client.send_raw_transaction(attempt.signed_raw_tx.clone()).await;
            (attempt, result)
        })
        .await;

        let mut accepted = Vec::new();
        for (attempt, result) in outcomes {
            if reached_node(&attempt, result) {
                accepted.push(attempt.tx_id);
            }
        }
        let count = accepted.len() as u64;
        if count > 0 {
            self.store.update_broadcast_ats(now, accepted).await?;
            self.metrics.resent(count);
        }
        Ok(count)
    }
}

/// Whether the node now knows the transaction, or has moved past its nonce
fn reached_node(attempt: &Attempt, result: TxmResult<()>) -> bool {
    let Err(err) = result else {
        return true;
    };
    match errors::from_error(&err) {
        SendErrorKind::Unknown | SendErrorKind::InsufficientFunds => {
            warn!(tx_id = attempt.tx_id, attempt_hash = ?attempt.hash, "Resend failed: {}", err);
            false
        }
        kind => {
            debug!(tx_id = attempt.tx_id, attempt_hash = ?attempt.hash, "Resend answered with {}: {}", kind, err);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingRecorder;
    use crate::state::InMemoryTxStore;
    use crate::testutil::{new_tx, test_address, test_builder, FakeChainClient};
    use crate::tx::gas::GasPrice;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct Harness {
        store: InMemoryTxStore,
        client: Arc<FakeChainClient>,
        metrics: Arc<CountingRecorder>,
        resender: Resender,
    }

    fn harness() -> Harness {
        let store = InMemoryTxStore::new();
        let client = Arc::new(FakeChainClient::new());
        let metrics = Arc::new(CountingRecorder::new());
        let config = TxmConfig {
            resend_after_threshold_secs: 250,
            ..TxmConfig::default()
        };
        let resender = Resender::new(
            Arc::new(store.clone()),
            client.clone(),
            test_builder().keys().clone(),
            metrics.clone(),
            config,
        );
        Harness {
            store,
            client,
            metrics,
            resender,
        }
    }

    /// Broadcast a transaction at `nonce` with attempts at each price, last sent at `sent_at`
    async fn unconfirmed(h: &Harness, nonce: i64, prices: &[u64], sent_at: DateTime<Utc>) -> Vec<Attempt> {
        let address = test_address();
        h.store.ensure_key(address).await.unwrap();
        if nonce == 0 {
            h.store.init_next_nonce(address, 0).await.unwrap();
        }
        let builder = test_builder();
        let tx = h.store.create_transaction(new_tx(address), 0).await.unwrap();
        let first = builder
            .new_attempt(&tx, nonce, GasPrice::Legacy(prices[0]), 21_000)
            .unwrap();
        let tx = h.store.save_in_progress(tx.id, nonce, first).await.unwrap();
        h.store
            .save_broadcast(tx.id, tx.attempts[0].id, sent_at)
            .await
            .unwrap();
        for price in &prices[1..] {
            let new = builder
                .repriced_attempt(&tx, GasPrice::Legacy(*price), 21_000)
                .unwrap();
            let a = h.store.save_in_progress_attempt(tx.id, new).await.unwrap();
            h.store.mark_attempt_broadcast(a.id, sent_at).await.unwrap();
        }
        h.store
            .update_transaction(tx.id, |t| t.broadcast_at = Some(sent_at))
            .await;
        h.store.find_transaction(tx.id).await.unwrap().attempts
    }

    #[tokio::test]
    async fn resends_richest_attempt_of_stale_transactions() {
        let h = harness();
        let first = unconfirmed(&h, 0, &[30, 43, 36], at(100)).await;
        let second = unconfirmed(&h, 1, &[30], at(200)).await;
        let third = unconfirmed(&h, 2, &[30], at(300)).await;

        let resent = h.resender.resend_unconfirmed_at(at(500)).await.unwrap();

        assert_eq!(resent, 2);
        assert_eq!(
            h.client.sent(),
            vec![first[0].signed_raw_tx.clone(), second[0].signed_raw_tx.clone()]
        );
        assert_eq!(first[0].gas_price, GasPrice::Legacy(43));
        assert_eq!(h.metrics.count("resent"), 2);

        let touched = h.store.find_transaction(first[0].tx_id).await.unwrap();
        assert_eq!(touched.broadcast_at, Some(at(500)));
        let untouched = h.store.find_transaction(third[0].tx_id).await.unwrap();
        assert_eq!(untouched.broadcast_at, Some(at(300)));
    }

    #[tokio::test]
    async fn failed_resend_is_retried_next_cycle() {
        let h = harness();
        let attempts = unconfirmed(&h, 0, &[30], at(100)).await;
        h.client.push_send(Err(TxmError::Timeout {
            operation: "eth_sendRawTransaction".to_string(),
        }));

        assert_eq!(h.resender.resend_unconfirmed_at(at(500)).await.unwrap(), 0);
        let tx = h.store.find_transaction(attempts[0].tx_id).await.unwrap();
        assert_eq!(tx.broadcast_at, Some(at(100)));

        assert_eq!(h.resender.resend_unconfirmed_at(at(600)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn already_known_counts_as_sent() {
        let h = harness();
        unconfirmed(&h, 0, &[30], at(100)).await;
        h.client.fail_next_send("already known");

        assert_eq!(h.resender.resend_unconfirmed_at(at(500)).await.unwrap(), 1);
    }
}
