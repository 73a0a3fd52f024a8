//! evm-txm - reliable transaction delivery for EVM signing keys
//!
//! Queued transactions are promoted to signed, nonce-sequenced attempts,
//! re-priced while stuck, confirmed by receipt and re-sent when a reorg drops
//! them. All state lives in a [`state::TxStore`] so work survives restarts.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod tx;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{TxmError, TxmResult};
pub use tx::{TxManager, TxRequest};
