//! TxManager: the queueing API and the lifecycle of every background loop

use super::attempt::{AttemptBuilder, KeyStore};
use super::broadcaster::Broadcaster;
use super::confirmer::Confirmer;
use super::gas::GasEstimator;
use super::nonce::NonceSyncer;
use super::reaper::Reaper;
use super::resender::Resender;
use super::strategy::TxStrategy;
use crate::chain::{ChainClient, HeadChain, HeadTracker};
use crate::config::{GasConfig, TxmConfig};
use crate::error::{TxmError, TxmResult};
use crate::metrics::MetricsRecorder;
use crate::state::{LockTarget, NewTransaction, Transaction, TxStore};

use ethers::types::{Address, Bytes, U256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A logical send request
pub struct TxRequest {
    pub from_address: Address,
    pub to_address: Address,
    pub payload: Bytes,
    pub value: U256,
    /// Gas limit hint; chain-specific adjustments apply on top
    pub gas_limit: u64,
    pub strategy: Arc<dyn TxStrategy>,
}

pub struct TxManager {
    store: Arc<dyn TxStore>,
    keys: Arc<KeyStore>,
    estimator: Arc<dyn GasEstimator>,
    tracker: Arc<HeadTracker>,
    nonce_syncer: NonceSyncer,
    broadcaster: Arc<Broadcaster>,
    confirmer: Arc<Confirmer>,
    resender: Arc<Resender>,
    reaper: Arc<Reaper>,
    config: TxmConfig,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TxManager {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        estimator: Arc<dyn GasEstimator>,
        keys: Arc<KeyStore>,
        metrics: Arc<dyn MetricsRecorder>,
        config: TxmConfig,
        gas: GasConfig,
    ) -> Self {
        let builder = Arc::new(AttemptBuilder::new(keys.clone(), client.chain_id()));
        let tracker = Arc::new(HeadTracker::new(client.clone(), config.finality_depth));
        let (shutdown, _) = watch::channel(false);

        Self {
            nonce_syncer: NonceSyncer::new(store.clone(), client.clone(), metrics.clone()),
            broadcaster: Arc::new(Broadcaster::new(
                store.clone(),
                client.clone(),
                estimator.clone(),
                builder.clone(),
                metrics.clone(),
                config.clone(),
            )),
            confirmer: Arc::new(Confirmer::new(
                store.clone(),
                client.clone(),
                estimator.clone(),
                builder,
                metrics.clone(),
                config.clone(),
                gas,
            )),
            resender: Arc::new(Resender::new(
                store.clone(),
                client,
                keys.clone(),
                metrics.clone(),
                config.clone(),
            )),
            reaper: Arc::new(Reaper::new(store.clone(), metrics, config.clone())),
            store,
            keys,
            estimator,
            tracker,
            config,
            started: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TxStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub async fn latest_head(&self) -> Option<HeadChain> {
        self.tracker.latest().await
    }

    /// Queue a transaction and wake its address's broadcaster
    pub async fn create_transaction(&self, request: TxRequest) -> TxmResult<Transaction> {
        let from = request.from_address;
        self.require_key(from)?;
        self.store.ensure_key(from).await?;

        let tx = self
            .store
            .create_transaction(
                NewTransaction {
                    from_address: from,
                    to_address: request.to_address,
                    payload: request.payload,
                    value: request.value,
                    gas_limit: request.gas_limit,
                    subject: request.strategy.subject(),
                },
                self.config.max_queued,
            )
            .await?;
        info!(address = ?from, tx_id = tx.id, "Transaction queued");

        let pruned = request.strategy.prune_queue(self.store.as_ref()).await?;
        if pruned.contains(&tx.id) {
            warn!(address = ?from, tx_id = tx.id, "Queued transaction was dropped by its strategy");
        }

        self.broadcaster.trigger(from);
        Ok(tx)
    }

    /// Wake the broadcaster of `address`
    pub fn trigger(&self, address: Address) {
        self.broadcaster.trigger(address);
    }

    /// Sync nonces, then spawn one broadcaster per key and the head,
    /// resender and reaper loops. Refuses to start if any nonce sync fails.
    pub async fn start(&self) -> TxmResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TxmError::Internal("transaction manager already started".to_string()));
        }

        let addresses = self.keys.addresses();
        for address in &addresses {
            self.store.ensure_key(*address).await?;
        }
        if let Err(e) = self
            .nonce_syncer
            .sync_all(&addresses, self.config.fanout_concurrency)
            .await
        {
            self.started.store(false, Ordering::SeqCst);
            error!("Nonce sync failed, not starting: {}", e);
            return Err(e);
        }

        let mut handles = self.handles.lock().await;
        for address in addresses.iter().copied() {
            let broadcaster = self.broadcaster.clone();
            handles.push(tokio::spawn(
                broadcaster.run_key(address, self.shutdown.subscribe()),
            ));
        }

        let heads = self.tracker.subscribe();
        handles.push(tokio::spawn(self.tracker.clone().run(
            self.config.head_poll_interval(),
            self.shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(run_head_consumers(
            heads,
            self.estimator.clone(),
            self.confirmer.clone(),
            self.shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(self.resender.clone().run(self.shutdown.subscribe())));
        handles.push(tokio::spawn(
            self.reaper
                .clone()
                .run(self.tracker.clone(), self.shutdown.subscribe()),
        ));

        info!(keys = addresses.len(), "Transaction manager started");
        Ok(())
    }

    /// Signal shutdown and wait for every loop to finish its current cycle
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Transaction manager stopped");
    }

    /// Fail every queued and in-progress transaction of `address`
    pub async fn abandon(&self, address: Address) -> TxmResult<u64> {
        self.store.ensure_key(address).await?;
        let lock = self.store.advisory_lock(LockTarget::Key(address)).await?;
        let result = self.store.abandon(address).await;
        lock.release().await?;

        let abandoned = result?;
        warn!(address = ?address, abandoned, "Abandoned pending transactions");
        Ok(abandoned)
    }

    /// Re-send a nonce range at a fixed legacy price, filling gaps with empty transactions
    pub async fn force_rebroadcast(
        &self,
        address: Address,
        begin_nonce: i64,
        end_nonce: i64,
        gas_price_wei: u64,
        gas_limit: Option<u64>,
    ) -> TxmResult<u64> {
        self.require_key(address)?;
        if begin_nonce < 0 || end_nonce < begin_nonce {
            return Err(TxmError::Nonce {
                address: format!("{:?}", address),
                message: format!("invalid nonce range {}..={}", begin_nonce, end_nonce),
            });
        }
        self.confirmer
            .force_rebroadcast(address, begin_nonce, end_nonce, gas_price_wei, gas_limit)
            .await
    }

    fn require_key(&self, address: Address) -> TxmResult<()> {
        if self.keys.contains(address) {
            Ok(())
        } else {
            Err(TxmError::KeyNotFound {
                address: format!("{:?}", address),
            })
        }
    }
}

/// Feed every new head to the estimator, then the confirmer
async fn run_head_consumers(
    mut heads: broadcast::Receiver<HeadChain>,
    estimator: Arc<dyn GasEstimator>,
    confirmer: Arc<Confirmer>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let chain = tokio::select! {
            received = heads.recv() => match received {
                Ok(chain) => chain,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Head consumer fell behind, skipping to newer heads");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        if let Err(e) = estimator.on_new_head(&chain).await {
            warn!(head = chain.number(), "Gas estimator update failed: {}", e);
        }
        if let Err(e) = confirmer.process_head(&chain).await {
            if e.should_alert() {
                error!(head = chain.number(), "Confirmer failed: {}", e);
            } else {
                warn!(head = chain.number(), "Confirmer failed, retrying next head: {}", e);
            }
        }
    }
}
