//! Reaper: deletes old terminal transactions

use crate::chain::HeadTracker;
use crate::config::TxmConfig;
use crate::error::TxmResult;
use crate::metrics::MetricsRecorder;
use crate::state::TxStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Reaper {
    store: Arc<dyn TxStore>,
    metrics: Arc<dyn MetricsRecorder>,
    config: TxmConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn TxStore>, metrics: Arc<dyn MetricsRecorder>, config: TxmConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Reap on every interval against the tracker's latest head
    pub async fn run(self: Arc<Self>, tracker: Arc<HeadTracker>, mut shutdown: watch::Receiver<bool>) {
        if self.config.reaper_threshold_secs == 0 {
            info!("Reaper disabled");
            return;
        }
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.reaper_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(chain) = tracker.latest().await else {
                        debug!("No head yet, skipping reap");
                        continue;
                    };
                    if let Err(e) = self.reap_at(chain.number(), Utc::now()).await {
                        warn!("Reap failed: {}", e);
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

    /// Delete terminal transactions created before `now - threshold`.
    /// Confirmed ones also need every receipt to be a finality depth below `head`.
    pub async fn reap_at(&self, head: i64, now: DateTime<Utc>) -> TxmResult<u64> {
        if self.config.reaper_threshold_secs == 0 {
            return Ok(0);
        }
        let min_block_to_keep = head - self.config.finality_depth as i64;
        let older_than = now - ChronoDuration::seconds(self.config.reaper_threshold_secs as i64);

        let reaped = self
            .store
            .reap_transactions(min_block_to_keep, older_than)
            .await?;
        if reaped > 0 {
            info!(reaped, head, "Reaped old transactions");
            self.metrics.reaped(reaped);
        }
        Ok(reaped)
    }
}
