//! Advisory locks serializing work across processes that share a signing key

use crate::error::TxmResult;

use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// Lock class for per-key broadcaster work
pub const CLASS_KEY: i32 = 1;
/// Lock class for the head-driven confirmer
pub const CLASS_CONFIRMER: i32 = 2;

/// What an advisory lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTarget {
    Key(ethers::types::Address),
    Confirmer,
}

enum Held {
    Postgres {
        conn: Option<PoolConnection<Postgres>>,
        class: i32,
        object: i32,
    },
    Local(Option<OwnedMutexGuard<()>>),
}

/// A held advisory lock. Call [`AdvisoryLockGuard::release`] when done.
///
/// A Postgres guard dropped without release closes its session, which makes
/// the server drop the lock.
pub struct AdvisoryLockGuard {
    held: Held,
}

impl AdvisoryLockGuard {
    pub(crate) fn postgres(conn: PoolConnection<Postgres>, class: i32, object: i32) -> Self {
        Self {
            held: Held::Postgres {
                conn: Some(conn),
                class,
                object,
            },
        }
    }

    pub(crate) fn local(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            held: Held::Local(Some(guard)),
        }
    }

    pub async fn release(mut self) -> TxmResult<()> {
        match &mut self.held {
            Held::Postgres {
                conn,
                class,
                object,
            } => {
                if let Some(mut c) = conn.take() {
                    let unlocked = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                        .bind(*class)
                        .bind(*object)
                        .execute(&mut *c)
                        .await;
                    if let Err(e) = unlocked {
                        drop(c.detach());
                        return Err(e.into());
                    }
                }
            }
            Held::Local(guard) => {
                guard.take();
            }
        }
        Ok(())
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        if let Held::Postgres { conn, class, object } = &mut self.held {
            if let Some(c) = conn.take() {
                warn!(
                    class = *class,
                    object = *object,
                    "Advisory lock dropped without release, closing session"
                );
                drop(c.detach());
            }
        }
    }
}

/// In-process stand-in for advisory locks
#[derive(Default)]
pub struct LocalLocks {
    locks: DashMap<(i32, i32), Arc<Mutex<()>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, class: i32, object: i32) -> AdvisoryLockGuard {
        let mutex = self
            .locks
            .entry((class, object))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        AdvisoryLockGuard::local(mutex.lock_owned().await)
    }
}
