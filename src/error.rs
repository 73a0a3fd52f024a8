//! Error types for the transaction manager

use crate::tx::gas::BumpError;

use thiserror::Error;

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    /// JSON-RPC error response. The node's message is kept verbatim so it
    /// can be classified.
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Nonce error for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error(transparent)]
    GasBump(#[from] BumpError),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: i64 },

    #[error("Key {address} not found")]
    KeyNotFound { address: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Optimistic lock failed: {0}")]
    OptimisticLock(String),

    #[error("Queue for {address} is full ({queued} unstarted transactions)")]
    QueueFull { address: String, queued: u64 },

    #[error("{0} error(s): {1}")]
    Multiple(usize, String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxmError::ChainConnection { .. }
                | TxmError::Rpc(_)
                | TxmError::Timeout { .. }
                | TxmError::Database(_)
                | TxmError::OptimisticLock(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxmError::InvariantViolation(_)
                | TxmError::OptimisticLock(_)
                | TxmError::GasBump(_)
                | TxmError::Wallet(_)
        )
    }

    /// Collapse per-item errors into one, or `Ok` if there were none.
    pub fn aggregate(errors: Vec<TxmError>) -> TxmResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap_or_else(|| {
                TxmError::Internal("empty error list".to_string())
            })),
            n => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(TxmError::Multiple(n, joined))
            }
        }
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;
