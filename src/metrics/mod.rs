//! Prometheus metrics for monitoring
//!
//! Components never touch a global registry. Each one is handed a
//! [`MetricsRecorder`]:
//! - [`PrometheusRecorder`]: counters on its own registry, served by [`MetricsServer`]
//! - [`NoopRecorder`]: discards everything
//! - [`CountingRecorder`]: in-memory counts for tests

use crate::error::{TxmError, TxmResult};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use dashmap::DashMap;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Events the transaction manager reports
pub trait MetricsRecorder: Send + Sync {
    fn broadcast(&self);
    fn confirmed(&self);
    fn fatal_error(&self);
    /// A send failed and was classified as `kind`
    fn send_error(&self, kind: &str);
    fn gas_bump(&self);
    fn gas_bump_exceeds_limit(&self);
    fn reorg_rebroadcast(&self);
    fn resent(&self, count: u64);
    fn reaped(&self, count: u64);
    fn nonce_fast_forward(&self);
    fn invariant_violation(&self);
    fn reverted_receipt(&self);
    /// Time from creation to first successful send
    fn time_until_broadcast(&self, elapsed: Duration);
}

pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn broadcast(&self) {}
    fn confirmed(&self) {}
    fn fatal_error(&self) {}
    fn send_error(&self, _kind: &str) {}
    fn gas_bump(&self) {}
    fn gas_bump_exceeds_limit(&self) {}
    fn reorg_rebroadcast(&self) {}
    fn resent(&self, _count: u64) {}
    fn reaped(&self, _count: u64) {}
    fn nonce_fast_forward(&self) {}
    fn invariant_violation(&self) {}
    fn reverted_receipt(&self) {}
    fn time_until_broadcast(&self, _elapsed: Duration) {}
}

/// Counts every event by name
#[derive(Default)]
pub struct CountingRecorder {
    counts: DashMap<String, u64>,
}

impl CountingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).map(|c| *c).unwrap_or(0)
    }

    fn add(&self, name: &str, n: u64) {
        *self.counts.entry(name.to_string()).or_insert(0) += n;
    }
}

impl MetricsRecorder for CountingRecorder {
    fn broadcast(&self) {
        self.add("broadcast", 1);
    }
    fn confirmed(&self) {
        self.add("confirmed", 1);
    }
    fn fatal_error(&self) {
        self.add("fatal_error", 1);
    }
    fn send_error(&self, kind: &str) {
        self.add(&format!("send_error.{}", kind), 1);
    }
    fn gas_bump(&self) {
        self.add("gas_bump", 1);
    }
    fn gas_bump_exceeds_limit(&self) {
        self.add("gas_bump_exceeds_limit", 1);
    }
    fn reorg_rebroadcast(&self) {
        self.add("reorg_rebroadcast", 1);
    }
    fn resent(&self, count: u64) {
        self.add("resent", count);
    }
    fn reaped(&self, count: u64) {
        self.add("reaped", count);
    }
    fn nonce_fast_forward(&self) {
        self.add("nonce_fast_forward", 1);
    }
    fn invariant_violation(&self) {
        self.add("invariant_violation", 1);
    }
    fn reverted_receipt(&self) {
        self.add("reverted_receipt", 1);
    }
    fn time_until_broadcast(&self, _elapsed: Duration) {
        self.add("time_until_broadcast", 1);
    }
}

/// Prometheus counters on a registry owned by the recorder
pub struct PrometheusRecorder {
    registry: Registry,
    broadcasts: IntCounter,
    confirmations: IntCounter,
    fatal_errors: IntCounter,
    send_errors: IntCounterVec,
    gas_bumps: IntCounter,
    gas_bump_limit: IntCounter,
    reorg_rebroadcasts: IntCounter,
    resends: IntCounter,
    reaped: IntCounter,
    nonce_fast_forwards: IntCounter,
    invariant_violations: IntCounter,
    reverted_receipts: IntCounter,
    time_until_broadcast: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str, chain_id: u64) -> TxmResult<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help).const_label("chain_id", chain_id.to_string()))
        .map_err(metrics_error)?;
    registry.register(Box::new(c.clone())).map_err(metrics_error)?;
    Ok(c)
}

fn metrics_error(e: prometheus::Error) -> TxmError {
    TxmError::Internal(format!("metrics registration failed: {}", e))
}

impl PrometheusRecorder {
    pub fn new(chain_id: u64) -> TxmResult<Self> {
        let registry = Registry::new();
        let r = &registry;

        let send_errors = IntCounterVec::new(
            Opts::new("txm_send_errors_total", "Failed sends by classified error kind")
                .const_label("chain_id", chain_id.to_string()),
            &["kind"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(send_errors.clone()))
            .map_err(metrics_error)?;

        let time_until_broadcast = Histogram::with_opts(
            HistogramOpts::new(
                "txm_time_until_broadcast_seconds",
                "Time from queueing to first successful send",
            )
            .const_label("chain_id", chain_id.to_string())
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(time_until_broadcast.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            broadcasts: counter(r, "txm_broadcasts_total", "Transactions sent for the first time", chain_id)?,
            confirmations: counter(r, "txm_confirmations_total", "Transactions confirmed by a receipt", chain_id)?,
            fatal_errors: counter(r, "txm_fatal_errors_total", "Transactions moved to fatal_error", chain_id)?,
            gas_bumps: counter(r, "txm_gas_bumps_total", "Attempts re-priced by the confirmer", chain_id)?,
            gas_bump_limit: counter(
                r,
                "txm_gas_bump_exceeds_limit_total",
                "Bumps refused because the price would exceed the configured max",
                chain_id,
            )?,
            reorg_rebroadcasts: counter(
                r,
                "txm_reorg_rebroadcasts_total",
                "Confirmed transactions re-sent after a reorg",
                chain_id,
            )?,
            resends: counter(r, "txm_resends_total", "Attempts re-sent by the resender", chain_id)?,
            reaped: counter(r, "txm_reaped_total", "Transactions deleted by the reaper", chain_id)?,
            nonce_fast_forwards: counter(
                r,
                "txm_nonce_fast_forwards_total",
                "Local nonces moved forward to match the chain",
                chain_id,
            )?,
            invariant_violations: counter(
                r,
                "txm_invariant_violations_total",
                "Unexpected store or chain states",
                chain_id,
            )?,
            reverted_receipts: counter(r, "txm_reverted_receipts_total", "Receipts with status 0", chain_id)?,
            send_errors,
            time_until_broadcast,
            registry,
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn broadcast(&self) {
        self.broadcasts.inc();
    }
    fn confirmed(&self) {
        self.confirmations.inc();
    }
    fn fatal_error(&self) {
        self.fatal_errors.inc();
    }
    fn send_error(&self, kind: &str) {
        self.send_errors.with_label_values(&[kind]).inc();
    }
    fn gas_bump(&self) {
        self.gas_bumps.inc();
    }
    fn gas_bump_exceeds_limit(&self) {
        self.gas_bump_limit.inc();
    }
    fn reorg_rebroadcast(&self) {
        self.reorg_rebroadcasts.inc();
    }
    fn resent(&self, count: u64) {
        self.resends.inc_by(count);
    }
    fn reaped(&self, count: u64) {
        self.reaped.inc_by(count);
    }
    fn nonce_fast_forward(&self) {
        self.nonce_fast_forwards.inc();
    }
    fn invariant_violation(&self) {
        self.invariant_violations.inc();
    }
    fn reverted_receipt(&self) {
        self.reverted_receipts.inc();
    }
    fn time_until_broadcast(&self, elapsed: Duration) {
        self.time_until_broadcast.observe(elapsed.as_secs_f64());
    }
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
    registry: Registry,
}

impl MetricsServer {
    pub fn new(port: u16, registry: Registry) -> Self {
        Self { port, registry }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> TxmResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.registry);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxmError::Internal(format!("failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| TxmError::Internal(format!("metrics server failed: {}", e)))
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Text exposition of every metric in `registry`
pub fn render(registry: &Registry) -> TxmResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(metrics_error)?;
    String::from_utf8(buffer).map_err(|e| TxmError::Internal(e.to_string()))
}
