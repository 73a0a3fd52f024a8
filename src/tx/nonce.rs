//! Startup reconciliation of local nonces against the chain
//!
//! The local `next_nonce` is authoritative. The only correction made is to
//! move it forward when the chain shows the address was used elsewhere,
//! since a nonce gap would block every later transaction.

use super::fanout;
use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::metrics::MetricsRecorder;
use crate::state::TxStore;

use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct NonceSyncer {
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl NonceSyncer {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            client,
            metrics,
        }
    }

    /// Sync every address in parallel. Fails if any address failed, after
    /// all of them have been tried.
    pub async fn sync_all(&self, addresses: &[Address], concurrency: usize) -> TxmResult<()> {
        let results = fanout::bounded(addresses.to_vec(), concurrency, |address| async move {
            self.sync(address).await.map_err(|e| {
                error!(address = ?address, "Nonce sync failed: {}", e);
                e
            })
        })
        .await;

        TxmError::aggregate(results.into_iter().filter_map(Result::err).collect())
    }

    /// Reconcile one address. A never-used address is left alone; its first
    /// nonce is read lazily by the broadcaster.
    pub async fn sync(&self, address: Address) -> TxmResult<()> {
        let key = self.store.ensure_key(address).await?;
        let Some(local) = key.next_nonce else {
            debug!(address = ?address, "Address never used, nothing to sync");
            return Ok(());
        };

        // A row in progress has reserved `local` without incrementing it yet
        let in_progress = self
            .store
            .find_in_progress_transaction(address)
            .await?
            .is_some();
        let effective_local = if in_progress { local + 1 } else { local };

        let chain_nonce = self.client.pending_nonce_at(address).await? as i64;
        if chain_nonce <= effective_local {
            debug!(
                address = ?address,
                local = effective_local,
                chain = chain_nonce,
                "Local nonce is up to date"
            );
            return Ok(());
        }

        let new_next = if in_progress {
            chain_nonce - 1
        } else {
            chain_nonce
        };
        warn!(
            address = ?address,
            local = effective_local,
            chain = chain_nonce,
            new_next_nonce = new_next,
            "Address was used outside this transaction manager; fast-forwarding local nonce. \
             Transactions with the skipped nonces are not tracked"
        );
        self.store
            .fast_forward_nonce(address, local, new_next)
            .await?;
        self.metrics.nonce_fast_forward();
        Ok(())
    }
}
