//! Head tracker: polls the latest head and publishes its ancestor window

use super::{ChainClient, Head, HeadChain};
use crate::error::{TxmError, TxmResult};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, warn};

const MAX_WALK_RESTARTS: usize = 3;

pub struct HeadTracker {
    client: Arc<dyn ChainClient>,
    /// Heads kept per chain, including the newest
    window: usize,
    latest: RwLock<Option<HeadChain>>,
    sender: broadcast::Sender<HeadChain>,
}

impl HeadTracker {
    pub fn new(client: Arc<dyn ChainClient>, finality_depth: u64) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            client,
            window: finality_depth.max(1) as usize,
            latest: RwLock::new(None),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeadChain> {
        self.sender.subscribe()
    }

    pub async fn latest(&self) -> Option<HeadChain> {
        self.latest.read().await.clone()
    }

    /// Fetch the latest head. Returns the new chain if the head changed.
    pub async fn poll_once(&self) -> TxmResult<Option<HeadChain>> {
        let head = self
            .client
            .head_by_number(None)
            .await?
            .ok_or_else(|| TxmError::Rpc("latest head not found".to_string()))?;

        let previous = self.latest.read().await.clone();
        if previous.as_ref().map(|c| c.hash()) == Some(head.hash) {
            return Ok(None);
        }

        let mut chain = None;
        for attempt in 0..MAX_WALK_RESTARTS {
            match self.walk(head, previous.as_ref()).await? {
                Some(c) => {
                    chain = Some(c);
                    break;
                }
                None => debug!(attempt, head = head.number, "Ancestor walk broke, restarting"),
            }
        }
        let chain = chain.ok_or_else(|| {
            TxmError::Rpc(format!(
                "could not build a linked ancestor chain for head {}",
                head.number
            ))
        })?;

        *self.latest.write().await = Some(chain.clone());
        // No subscribers is fine
        let _ = self.sender.send(chain.clone());
        Ok(Some(chain))
    }

    /// Walk parents from `head`, reusing ancestors already held. `None` if a
    /// fetched parent does not link.
    async fn walk(&self, head: Head, previous: Option<&HeadChain>) -> TxmResult<Option<HeadChain>> {
        let mut heads = vec![head];

        while heads.len() < self.window {
            let child = heads[heads.len() - 1];
            if child.number == 0 {
                break;
            }

            if let Some(prev) = previous {
                if let Some(pos) = prev.heads().iter().position(|h| h.hash == child.parent_hash) {
                    let needed = self.window - heads.len();
                    heads.extend(prev.heads()[pos..].iter().take(needed).copied());
                    break;
                }
            }

            let parent = match self.client.head_by_number(Some(child.number - 1)).await? {
                Some(p) => p,
                None => break,
            };
            if parent.hash != child.parent_hash {
                return Ok(None);
            }
            heads.push(parent);
        }

        Ok(HeadChain::new(heads))
    }

    /// Poll until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(Some(chain)) => debug!(head = chain.number(), depth = chain.len(), "New head"),
                        Ok(None) => {}
                        Err(e) if e.is_retryable() => warn!("Head poll failed: {}", e),
                        Err(e) => error!("Head poll failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
