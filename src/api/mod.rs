//! Operator HTTP API: health, paginated history and manual interventions

use crate::config::ApiConfig;
use crate::error::{TxmError, TxmResult};
use crate::tx::TxManager;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TxManager>,
}

pub fn router(manager: Arc<TxManager>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/transactions", get(list_transactions))
        .route("/transactions/:id", get(get_transaction))
        .route("/attempts", get(list_attempts))
        .route("/force-rebroadcast", post(force_rebroadcast))
        .route("/trigger/:address", post(trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}

/// Run the HTTP API server until shutdown
pub async fn run_server(
    config: ApiConfig,
    manager: Arc<TxManager>,
    mut shutdown: watch::Receiver<bool>,
) -> TxmResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxmError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| TxmError::Internal(format!("API server failed: {}", e)))
}

/// A [`TxmError`] rendered as a JSON error body
struct ApiError(TxmError);

impl From<TxmError> for ApiError {
    fn from(e: TxmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TxmError::TransactionNotFound { .. } | TxmError::KeyNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            TxmError::Nonce { .. } | TxmError::Config(_) => StatusCode::BAD_REQUEST,
            TxmError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("API request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.manager.store().health_check().await.is_ok();
    let head = state.manager.latest_head().await.map(|c| c.number());
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: database,
            database,
            head,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct Pagination {
    offset: Option<u64>,
    limit: Option<u64>,
}

impl Pagination {
    fn bounds(&self) -> (u64, u64) {
        (
            self.offset.unwrap_or(0),
            self.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
        )
    }
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = page.bounds();
    Ok(Json(state.manager.store().transactions(offset, limit).await?))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.store().find_transaction(id).await?))
}

async fn list_attempts(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = page.bounds();
    Ok(Json(state.manager.store().attempts(offset, limit).await?))
}

#[derive(Debug, Deserialize)]
struct ForceRebroadcastRequest {
    address: Address,
    begin_nonce: i64,
    end_nonce: i64,
    gas_price_wei: u64,
    /// Zero keeps each transaction's own limit
    #[serde(default)]
    gas_limit: u64,
}

async fn force_rebroadcast(
    State(state): State<AppState>,
    Json(req): Json<ForceRebroadcastRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let gas_limit = (req.gas_limit > 0).then_some(req.gas_limit);
    let sent = state
        .manager
        .force_rebroadcast(
            req.address,
            req.begin_nonce,
            req.end_nonce,
            req.gas_price_wei,
            gas_limit,
        )
        .await?;
    Ok(Json(ForceRebroadcastResponse { sent }))
}

async fn trigger(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address: Address = address
        .parse()
        .map_err(|e| TxmError::Config(format!("invalid address {}: {}", address, e)))?;
    if !state.manager.keys().contains(address) {
        return Err(TxmError::KeyNotFound {
            address: format!("{:?}", address),
        }
        .into());
    }
    state.manager.trigger(address);
    Ok(StatusCode::ACCEPTED)
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    head: Option<i64>,
}

#[derive(Serialize)]
struct ForceRebroadcastResponse {
    sent: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopRecorder;
    use crate::state::InMemoryTxStore;
    use crate::testutil::{
        test_address, test_builder, test_estimator, test_gas_config, FakeChainClient,
    };
    use crate::tx::{SendEveryStrategy, TxRequest};
    use crate::config::TxmConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::{Bytes, U256};
    use tower::ServiceExt;

    fn app() -> (Arc<TxManager>, Arc<FakeChainClient>) {
        let client = Arc::new(FakeChainClient::new());
        let manager = Arc::new(TxManager::new(
            Arc::new(InMemoryTxStore::new()),
            client.clone(),
            test_estimator(),
            test_builder().keys().clone(),
            Arc::new(NoopRecorder),
            TxmConfig::default(),
            test_gas_config(),
        ));
        (manager, client)
    }

    async fn call(manager: &Arc<TxManager>, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router(manager.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_ready() {
        let (manager, _) = app();
        let (status, body) = call(&manager, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&manager, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert!(body["head"].is_null());
    }

    #[tokio::test]
    async fn lists_and_fetches_transactions() {
        let (manager, _) = app();
        let tx = manager
            .create_transaction(TxRequest {
                from_address: test_address(),
                to_address: Address::repeat_byte(0x42),
                payload: Bytes::default(),
                value: U256::zero(),
                gas_limit: 21_000,
                strategy: Arc::new(SendEveryStrategy),
            })
            .await
            .unwrap();

        let (status, body) = call(&manager, get("/transactions?limit=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (status, body) = call(&manager, get(&format!("/transactions/{}", tx.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "unstarted");

        let (status, _) = call(&manager, get("/transactions/999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn force_rebroadcast_sends_range() {
        let (manager, client) = app();
        let body = serde_json::json!({
            "address": format!("{:?}", test_address()),
            "begin_nonce": 0,
            "end_nonce": 1,
            "gas_price_wei": 100,
        });
        let request = Request::builder()
            .method("POST")
            .uri("/force-rebroadcast")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let (status, body) = call(&manager, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sent"], 2);
        assert_eq!(client.sent().len(), 2);
    }

    #[tokio::test]
    async fn trigger_validates_address() {
        let (manager, _) = app();
        let post = |uri: String| {
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        let (status, _) = call(&manager, post(format!("/trigger/{:?}", test_address()))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = call(&manager, post("/trigger/not-an-address".to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&manager, post(format!("/trigger/{:?}", Address::repeat_byte(7)))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
