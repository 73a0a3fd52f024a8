//! Queue admission policies applied when a transaction is created

use crate::error::TxmResult;
use crate::state::TxStore;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait TxStrategy: Send + Sync {
    /// Correlation subject stamped on queued transactions
    fn subject(&self) -> Option<Uuid>;

    /// Drop queued transactions the policy no longer wants sent.
    /// Returns the ids removed.
    async fn prune_queue(&self, store: &dyn TxStore) -> TxmResult<Vec<i64>>;
}

/// Send every queued transaction
#[derive(Debug, Clone, Copy, Default)]
pub struct SendEveryStrategy;

#[async_trait]
impl TxStrategy for SendEveryStrategy {
    fn subject(&self) -> Option<Uuid> {
        None
    }

    async fn prune_queue(&self, _store: &dyn TxStore) -> TxmResult<Vec<i64>> {
        Ok(Vec::new())
    }
}

/// Keep only the newest `queue_size` unsent transactions for a subject
#[derive(Debug, Clone, Copy)]
pub struct DropOldestStrategy {
    subject: Uuid,
    queue_size: u32,
}

impl DropOldestStrategy {
    pub fn new(subject: Uuid, queue_size: u32) -> Self {
        Self {
            subject,
            queue_size,
        }
    }
}

#[async_trait]
impl TxStrategy for DropOldestStrategy {
    fn subject(&self) -> Option<Uuid> {
        Some(self.subject)
    }

    async fn prune_queue(&self, store: &dyn TxStore) -> TxmResult<Vec<i64>> {
        let pruned = store
            .prune_unstarted_queue(self.subject, self.queue_size)
            .await?;
        if !pruned.is_empty() {
            debug!(
                subject = %self.subject,
                count = pruned.len(),
                "Dropped oldest queued transactions"
            );
        }
        Ok(pruned)
    }
}

/// Drop-oldest for a positive queue size, otherwise send-every
pub fn new_queueing_strategy(subject: Uuid, queue_size: u32) -> Arc<dyn TxStrategy> {
    if queue_size > 0 {
        Arc::new(DropOldestStrategy::new(subject, queue_size))
    } else {
        Arc::new(SendEveryStrategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryTxStore;
    use crate::testutil::new_tx;
    use ethers::types::Address;

    #[tokio::test]
    async fn drop_oldest_keeps_newest_for_subject() {
        let store = InMemoryTxStore::new();
        let from = Address::repeat_byte(1);
        store.ensure_key(from).await.unwrap();

        let subject = Uuid::new_v4();
        let strategy = new_queueing_strategy(subject, 2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let mut req = new_tx(from);
            req.subject = strategy.subject();
            ids.push(store.create_transaction(req, 0).await.unwrap().id);
        }
        // Another subject is untouched
        let mut other = new_tx(from);
        other.subject = Some(Uuid::new_v4());
        store.create_transaction(other, 0).await.unwrap();

        let mut pruned = strategy.prune_queue(&store).await.unwrap();
        pruned.sort_unstable();
        assert_eq!(pruned, vec![ids[0], ids[1]]);
        assert_eq!(store.transaction_count().await, 3);
    }

    #[tokio::test]
    async fn send_every_prunes_nothing() {
        let store = InMemoryTxStore::new();
        let strategy = new_queueing_strategy(Uuid::new_v4(), 0);
        assert!(strategy.subject().is_none());
        assert!(strategy.prune_queue(&store).await.unwrap().is_empty());
    }
}
