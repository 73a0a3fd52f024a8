//! Transaction delivery: queueing, nonce sequencing, gas pricing, broadcast,
//! confirmation and reorg recovery

pub mod attempt;
pub mod broadcaster;
pub mod confirmer;
pub mod errors;
pub mod fanout;
pub mod gas;
pub mod manager;
pub mod nonce;
pub mod reaper;
pub mod resender;
pub mod strategy;

pub use attempt::{AttemptBuilder, KeyStore};
pub use broadcaster::Broadcaster;
pub use confirmer::Confirmer;
pub use errors::SendErrorKind;
pub use gas::{new_estimator, GasEstimator, GasPrice};
pub use manager::{TxManager, TxRequest};
pub use nonce::NonceSyncer;
pub use reaper::Reaper;
pub use resender::Resender;
pub use strategy::{new_queueing_strategy, DropOldestStrategy, SendEveryStrategy, TxStrategy};
