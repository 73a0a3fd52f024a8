//! PostgreSQL transaction store

use super::lock::{AdvisoryLockGuard, LockTarget, CLASS_CONFIRMER, CLASS_KEY};
use super::models::*;
use super::{TxStore, ABANDONED};
use crate::chain::ChainReceipt;
use crate::config::DatabaseConfig;
use crate::error::{TxmError, TxmResult};
use crate::tx::gas::GasPrice;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

const TX_COLUMNS: &str = "t.id, t.from_address, t.to_address, t.payload, t.value::TEXT AS value, \
     t.gas_limit, t.subject, t.nonce, t.state, t.error, t.broadcast_at, t.initial_broadcast_at, \
     t.created_at";

const ATTEMPT_COLUMNS: &str = "a.id, a.tx_id, a.gas_price, a.gas_fee_cap, a.gas_tip_cap, \
     a.gas_limit, a.signed_raw_tx, a.hash, a.state, a.broadcast_before_block_num, a.created_at";

const REAP_BATCH_SIZE: i64 = 1000;

/// PostgreSQL-backed [`TxStore`]
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    /// Connect a new pool
    pub async fn new(config: &DatabaseConfig) -> TxmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TxmResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                id SERIAL PRIMARY KEY,
                address BYTEA NOT NULL UNIQUE,
                next_nonce BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id BIGSERIAL PRIMARY KEY,
                from_address BYTEA NOT NULL REFERENCES keys (address),
                to_address BYTEA NOT NULL,
                payload BYTEA NOT NULL,
                value NUMERIC(78, 0) NOT NULL,
                gas_limit BIGINT NOT NULL,
                subject UUID,
                nonce BIGINT,
                state VARCHAR(20) NOT NULL,
                error TEXT,
                broadcast_at TIMESTAMPTZ,
                initial_broadcast_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT chk_nonce_assigned CHECK (
                    (state = 'unstarted' AND nonce IS NULL)
                    OR state = 'fatal_error'
                    OR (state IN ('in_progress', 'unconfirmed', 'confirmed') AND nonce IS NOT NULL)
                ),
                CONSTRAINT chk_error_only_when_fatal CHECK (state = 'fatal_error' OR error IS NULL)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_one_in_progress
            ON transactions (from_address) WHERE state = 'in_progress'
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_from_nonce
            ON transactions (from_address, nonce) WHERE nonce IS NOT NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_from_state
            ON transactions (from_address, state)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_unstarted_subject
            ON transactions (subject, id) WHERE state = 'unstarted'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                id BIGSERIAL PRIMARY KEY,
                tx_id BIGINT NOT NULL REFERENCES transactions (id) ON DELETE CASCADE,
                gas_price BIGINT,
                gas_fee_cap BIGINT,
                gas_tip_cap BIGINT,
                gas_limit BIGINT NOT NULL,
                signed_raw_tx BYTEA NOT NULL,
                hash BYTEA NOT NULL UNIQUE,
                state VARCHAR(20) NOT NULL,
                broadcast_before_block_num BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT chk_one_fee_model CHECK (
                    (gas_price IS NOT NULL) <> (gas_fee_cap IS NOT NULL AND gas_tip_cap IS NOT NULL)
                )
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_in_progress
            ON attempts (tx_id) WHERE state = 'in_progress'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS receipts (
                id BIGSERIAL PRIMARY KEY,
                tx_hash BYTEA NOT NULL REFERENCES attempts (hash) ON DELETE CASCADE,
                block_hash BYTEA NOT NULL,
                block_number BIGINT NOT NULL,
                transaction_index BIGINT NOT NULL,
                receipt JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (tx_hash, block_hash)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_receipts_block_number
            ON receipts (block_number)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }

    async fn load_attempts(
        &self,
        txs: &mut [Transaction],
        only_state: Option<AttemptState>,
        with_receipts: bool,
    ) -> TxmResult<()> {
        if txs.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = txs.iter().map(|t| t.id).collect();

        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts a WHERE a.tx_id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut receipts: HashMap<H256, Vec<Receipt>> = HashMap::new();
        if with_receipts {
            let rows = sqlx::query(
                r#"
                SELECT r.id, r.tx_hash, r.block_hash, r.block_number, r.transaction_index,
                       r.receipt, r.created_at
                FROM receipts r
                JOIN attempts a ON a.hash = r.tx_hash
                WHERE a.tx_id = ANY($1)
                "#,
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let receipt = receipt_from_row(&row)?;
                receipts.entry(receipt.tx_hash).or_default().push(receipt);
            }
        }

        let mut by_tx: HashMap<i64, Vec<Attempt>> = HashMap::new();
        for row in rows {
            let mut attempt = attempt_from_row(&row)?;
            if only_state.map_or(false, |s| s != attempt.state) {
                continue;
            }
            attempt.receipts = receipts.remove(&attempt.hash).unwrap_or_default();
            by_tx.entry(attempt.tx_id).or_default().push(attempt);
        }

        for tx in txs.iter_mut() {
            tx.attempts = by_tx.remove(&tx.id).unwrap_or_default();
            tx.sort_attempts();
        }
        Ok(())
    }

    async fn fetch_transactions(&self, rows: Vec<PgRow>) -> TxmResult<Vec<Transaction>> {
        let mut txs = rows
            .iter()
            .map(tx_from_row)
            .collect::<TxmResult<Vec<_>>>()?;
        self.load_attempts(&mut txs, None, true).await?;
        Ok(txs)
    }
}

async fn insert_attempt(
    conn: &mut PgConnection,
    tx_id: i64,
    attempt: &NewAttempt,
    state: AttemptState,
) -> TxmResult<Attempt> {
    let (gas_price, fee_cap, tip_cap) = match attempt.gas_price {
        GasPrice::Legacy(p) => (Some(p as i64), None, None),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => (
            None,
            Some(max_fee_per_gas as i64),
            Some(max_priority_fee_per_gas as i64),
        ),
    };

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO attempts AS a
            (tx_id, gas_price, gas_fee_cap, gas_tip_cap, gas_limit, signed_raw_tx, hash, state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {ATTEMPT_COLUMNS}
        "#
    ))
    .bind(tx_id)
    .bind(gas_price)
    .bind(fee_cap)
    .bind(tip_cap)
    .bind(attempt.gas_limit as i64)
    .bind(attempt.signed_raw_tx.to_vec())
    .bind(attempt.hash.as_bytes())
    .bind(state.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| constraint_violation(e, "insert attempt"))?;

    attempt_from_row(&row)
}

/// Increment the key's nonce and move an in-progress transaction to unconfirmed
async fn mark_broadcast(
    conn: &mut PgConnection,
    tx_id: i64,
    attempt_id: i64,
    now: DateTime<Utc>,
) -> TxmResult<()> {
    let incremented = sqlx::query(
        r#"
        UPDATE keys SET next_nonce = next_nonce + 1, updated_at = NOW()
        FROM transactions t
        WHERE t.id = $1 AND keys.address = t.from_address AND keys.next_nonce = t.nonce
        "#,
    )
    .bind(tx_id)
    .execute(&mut *conn)
    .await?;
    if incremented.rows_affected() == 0 {
        return Err(TxmError::OptimisticLock(format!(
            "could not increment nonce for transaction {}: key missing or nonce changed by another process",
            tx_id
        )));
    }

    let updated = sqlx::query(
        r#"
        UPDATE transactions
        SET state = 'unconfirmed', broadcast_at = $2,
            initial_broadcast_at = COALESCE(initial_broadcast_at, $2)
        WHERE id = $1 AND state = 'in_progress'
        "#,
    )
    .bind(tx_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(TxmError::InvariantViolation(format!(
            "transaction {} is no longer in_progress",
            tx_id
        )));
    }

    let updated = sqlx::query(
        "UPDATE attempts SET state = 'broadcast' WHERE id = $1 AND tx_id = $2 AND state = 'in_progress'",
    )
    .bind(attempt_id)
    .bind(tx_id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(TxmError::InvariantViolation(format!(
            "attempt {} is not the in-progress attempt of transaction {}",
            attempt_id, tx_id
        )));
    }
    Ok(())
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn health_check(&self) -> TxmResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_key(&self, address: Address) -> TxmResult<Key> {
        sqlx::query("INSERT INTO keys (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
            .bind(address.as_bytes())
            .execute(&self.pool)
            .await?;
        self.get_key(address).await
    }

    async fn get_key(&self, address: Address) -> TxmResult<Key> {
        let row = sqlx::query("SELECT id, address, next_nonce FROM keys WHERE address = $1")
            .bind(address.as_bytes())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TxmError::KeyNotFound {
                address: format!("{:?}", address),
            })?;

        Ok(Key {
            id: row.get("id"),
            address: address_from(&row, "address")?,
            next_nonce: row.get("next_nonce"),
        })
    }

    async fn init_next_nonce(&self, address: Address, nonce: i64) -> TxmResult<()> {
        let updated = sqlx::query(
            "UPDATE keys SET next_nonce = $2, updated_at = NOW() WHERE address = $1 AND next_nonce IS NULL",
        )
        .bind(address.as_bytes())
        .bind(nonce)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::OptimisticLock(format!(
                "next nonce for {:?} was already initialised",
                address
            )));
        }
        Ok(())
    }

    async fn fast_forward_nonce(&self, address: Address, old: i64, new: i64) -> TxmResult<()> {
        let updated = sqlx::query(
            "UPDATE keys SET next_nonce = $3, updated_at = NOW() WHERE address = $1 AND next_nonce = $2",
        )
        .bind(address.as_bytes())
        .bind(old)
        .bind(new)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::OptimisticLock(format!(
                "next nonce for {:?} is no longer {}",
                address, old
            )));
        }
        Ok(())
    }

    async fn advisory_lock(&self, target: LockTarget) -> TxmResult<AdvisoryLockGuard> {
        let (class, object) = match target {
            LockTarget::Key(address) => (CLASS_KEY, self.get_key(address).await?.id),
            LockTarget::Confirmer => (CLASS_CONFIRMER, 0),
        };

        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1, $2)")
            .bind(class)
            .bind(object)
            .execute(&mut *conn)
            .await?;
        debug!(class, object, "Acquired advisory lock");
        Ok(AdvisoryLockGuard::postgres(conn, class, object))
    }

    async fn create_transaction(
        &self,
        new: NewTransaction,
        max_queued: u64,
    ) -> TxmResult<Transaction> {
        let mut dbtx = self.pool.begin().await?;

        if max_queued > 0 {
            let queued: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM transactions WHERE from_address = $1 AND state = 'unstarted'",
            )
            .bind(new.from_address.as_bytes())
            .fetch_one(&mut *dbtx)
            .await?
            .get("n");
            if queued as u64 >= max_queued {
                return Err(TxmError::QueueFull {
                    address: format!("{:?}", new.from_address),
                    queued: queued as u64,
                });
            }
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO transactions AS t
                (from_address, to_address, payload, value, gas_limit, subject, state)
            VALUES ($1, $2, $3, CAST($4 AS NUMERIC), $5, $6, 'unstarted')
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(new.from_address.as_bytes())
        .bind(new.to_address.as_bytes())
        .bind(new.payload.to_vec())
        .bind(new.value.to_string())
        .bind(new.gas_limit as i64)
        .bind(new.subject)
        .fetch_one(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        tx_from_row(&row)
    }

    async fn prune_unstarted_queue(&self, subject: Uuid, queue_size: u32) -> TxmResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM transactions
            WHERE state = 'unstarted' AND subject = $1 AND id < (
                SELECT MIN(id) FROM (
                    SELECT id FROM transactions
                    WHERE state = 'unstarted' AND subject = $1
                    ORDER BY id DESC
                    LIMIT $2
                ) newest
            )
            RETURNING id
            "#,
        )
        .bind(subject)
        .bind(queue_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn abandon(&self, address: Address) -> TxmResult<u64> {
        let mut dbtx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM attempts
            WHERE state = 'in_progress' AND tx_id IN (
                SELECT id FROM transactions WHERE from_address = $1 AND state = 'in_progress'
            )
            "#,
        )
        .bind(address.as_bytes())
        .execute(&mut *dbtx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE transactions SET state = 'fatal_error', nonce = NULL, error = $2
            WHERE from_address = $1 AND state IN ('unstarted', 'in_progress')
            "#,
        )
        .bind(address.as_bytes())
        .bind(ABANDONED)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(updated.rows_affected())
    }

    async fn find_in_progress_transaction(
        &self,
        address: Address,
    ) -> TxmResult<Option<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions t WHERE t.from_address = $1 AND t.state = 'in_progress'"
        ))
        .bind(address.as_bytes())
        .fetch_all(&self.pool)
        .await?;
        Ok(self.fetch_transactions(rows).await?.into_iter().next())
    }

    async fn next_unstarted_transaction(
        &self,
        address: Address,
    ) -> TxmResult<Option<Transaction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions t
            WHERE t.from_address = $1 AND t.state = 'unstarted'
            ORDER BY t.value ASC, t.created_at ASC, t.id ASC
            LIMIT 1
            "#
        ))
        .bind(address.as_bytes())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tx_from_row).transpose()
    }

    async fn count_unconfirmed(&self, address: Address) -> TxmResult<u64> {
        let n: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM transactions WHERE from_address = $1 AND state = 'unconfirmed'",
        )
        .bind(address.as_bytes())
        .fetch_one(&self.pool)
        .await?
        .get("n");
        Ok(n as u64)
    }

    async fn save_in_progress(
        &self,
        tx_id: i64,
        nonce: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Transaction> {
        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE transactions SET nonce = $2, state = 'in_progress' WHERE id = $1 AND state = 'unstarted'",
        )
        .bind(tx_id)
        .bind(nonce)
        .execute(&mut *dbtx)
        .await
        .map_err(|e| constraint_violation(e, "mark transaction in_progress"))?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is not unstarted",
                tx_id
            )));
        }
        insert_attempt(&mut dbtx, tx_id, &attempt, AttemptState::InProgress).await?;

        dbtx.commit().await?;
        self.find_transaction(tx_id).await
    }

    async fn replace_in_progress_attempt(
        &self,
        old_attempt_id: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Attempt> {
        let mut dbtx = self.pool.begin().await?;
        let tx_id: i64 = sqlx::query(
            "DELETE FROM attempts WHERE id = $1 AND state = 'in_progress' RETURNING tx_id",
        )
        .bind(old_attempt_id)
        .fetch_optional(&mut *dbtx)
        .await?
        .ok_or_else(|| {
            TxmError::InvariantViolation(format!("attempt {} is not in progress", old_attempt_id))
        })?
        .get("tx_id");

        let inserted = insert_attempt(&mut dbtx, tx_id, &attempt, AttemptState::InProgress).await?;
        dbtx.commit().await?;
        Ok(inserted)
    }

    async fn save_fatal(&self, tx_id: i64, error: String) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        sqlx::query("DELETE FROM attempts WHERE tx_id = $1")
            .bind(tx_id)
            .execute(&mut *dbtx)
            .await?;
        let updated = sqlx::query(
            r#"
            UPDATE transactions
            SET state = 'fatal_error', nonce = NULL, broadcast_at = NULL,
                initial_broadcast_at = NULL, error = $2
            WHERE id = $1 AND state = 'in_progress'
            "#,
        )
        .bind(tx_id)
        .bind(&error)
        .execute(&mut *dbtx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::InvariantViolation(format!(
                "cannot fail transaction {} outside in_progress",
                tx_id
            )));
        }
        dbtx.commit().await?;
        Ok(())
    }

    async fn save_broadcast(
        &self,
        tx_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        mark_broadcast(&mut dbtx, tx_id, attempt_id, now).await?;
        dbtx.commit().await?;
        Ok(())
    }

    async fn save_broadcast_and_requeue(
        &self,
        tx_id: i64,
        attempt_id: i64,
        now: DateTime<Utc>,
    ) -> TxmResult<Transaction> {
        let mut dbtx = self.pool.begin().await?;
        mark_broadcast(&mut dbtx, tx_id, attempt_id, now).await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO transactions AS t
                (from_address, to_address, payload, value, gas_limit, subject, state)
            SELECT from_address, to_address, payload, value, gas_limit, subject, 'unstarted'
            FROM transactions WHERE id = $1
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(tx_id)
        .fetch_one(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        tx_from_row(&row)
    }

    async fn set_broadcast_before_block_num(&self, block_num: i64) -> TxmResult<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE attempts SET broadcast_before_block_num = $1
            WHERE broadcast_before_block_num IS NULL AND state = 'broadcast'
              AND tx_id IN (SELECT id FROM transactions WHERE state = 'unconfirmed')
            "#,
        )
        .bind(block_num)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn find_unconfirmed_with_broadcast_attempts(&self) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions t WHERE t.state = 'unconfirmed' ORDER BY t.nonce ASC, t.id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut txs = rows
            .iter()
            .map(tx_from_row)
            .collect::<TxmResult<Vec<_>>>()?;
        self.load_attempts(&mut txs, Some(AttemptState::Broadcast), false)
            .await?;
        Ok(txs)
    }

    async fn save_fetched_receipts(&self, receipts: Vec<ChainReceipt>) -> TxmResult<Vec<i64>> {
        let mut dbtx = self.pool.begin().await?;
        let mut confirmed = Vec::new();

        for r in receipts {
            let (Some(block_hash), Some(block_number)) = (r.block_hash, r.block_number) else {
                continue;
            };

            sqlx::query(
                r#"
                INSERT INTO receipts (tx_hash, block_hash, block_number, transaction_index, receipt)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (tx_hash, block_hash) DO UPDATE SET
                    block_number = EXCLUDED.block_number,
                    transaction_index = EXCLUDED.transaction_index,
                    receipt = EXCLUDED.receipt
                "#,
            )
            .bind(r.tx_hash.as_bytes())
            .bind(block_hash.as_bytes())
            .bind(block_number)
            .bind(r.transaction_index as i64)
            .bind(&r.raw)
            .execute(&mut *dbtx)
            .await
            .map_err(|e| constraint_violation(e, "insert receipt"))?;

            let tx_id: Option<i64> = sqlx::query(
                r#"
                UPDATE attempts
                SET state = 'broadcast',
                    broadcast_before_block_num = COALESCE(broadcast_before_block_num, $2)
                WHERE hash = $1
                RETURNING tx_id
                "#,
            )
            .bind(r.tx_hash.as_bytes())
            .bind(block_number)
            .fetch_optional(&mut *dbtx)
            .await?
            .map(|row| row.get("tx_id"));

            if let Some(tx_id) = tx_id {
                let updated = sqlx::query(
                    "UPDATE transactions SET state = 'confirmed' WHERE id = $1 AND state = 'unconfirmed'",
                )
                .bind(tx_id)
                .execute(&mut *dbtx)
                .await?;
                if updated.rows_affected() > 0 {
                    confirmed.push(tx_id);
                }
            }
        }

        dbtx.commit().await?;
        Ok(confirmed)
    }

    async fn mark_old_missing_receipt_errored(&self, cutoff_block: i64) -> TxmResult<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            UPDATE transactions t SET state = 'fatal_error', error = $2
            WHERE t.state = 'unconfirmed'
              AND t.nonce < (
                  SELECT MAX(c.nonce) FROM transactions c
                  WHERE c.from_address = t.from_address AND c.state = 'confirmed'
              )
              AND EXISTS (SELECT 1 FROM attempts a WHERE a.tx_id = t.id)
              AND NOT EXISTS (
                  SELECT 1 FROM attempts a
                  WHERE a.tx_id = t.id
                    AND (a.broadcast_before_block_num IS NULL OR a.broadcast_before_block_num > $1)
              )
            RETURNING t.id
            "#,
        )
        .bind(cutoff_block)
        .bind(crate::tx::confirmer::MISSING_RECEIPT)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn find_transactions_requiring_gas_bump(
        &self,
        address: Address,
        block_num: i64,
        threshold: u64,
        depth: u32,
    ) -> TxmResult<Vec<Transaction>> {
        let limit = if depth > 0 { Some(depth as i64) } else { None };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions t
            WHERE t.from_address = $1 AND t.state = 'unconfirmed'
              AND EXISTS (SELECT 1 FROM attempts a WHERE a.tx_id = t.id)
              AND NOT EXISTS (
                  SELECT 1 FROM attempts a
                  WHERE a.tx_id = t.id
                    AND (a.state <> 'broadcast'
                         OR a.broadcast_before_block_num IS NULL
                         OR a.broadcast_before_block_num > $2)
              )
            ORDER BY t.nonce ASC
            LIMIT $3
            "#
        ))
        .bind(address.as_bytes())
        .bind(block_num - threshold as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_transactions(rows).await
    }

    async fn find_transactions_with_in_progress_attempts(
        &self,
        address: Address,
    ) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions t
            WHERE t.from_address = $1 AND t.state = 'unconfirmed'
              AND EXISTS (SELECT 1 FROM attempts a WHERE a.tx_id = t.id AND a.state = 'in_progress')
            ORDER BY t.nonce ASC
            "#
        ))
        .bind(address.as_bytes())
        .fetch_all(&self.pool)
        .await?;
        self.fetch_transactions(rows).await
    }

    async fn save_in_progress_attempt(
        &self,
        tx_id: i64,
        attempt: NewAttempt,
    ) -> TxmResult<Attempt> {
        let mut dbtx = self.pool.begin().await?;
        let state: Option<String> =
            sqlx::query("SELECT state FROM transactions WHERE id = $1 FOR UPDATE")
                .bind(tx_id)
                .fetch_optional(&mut *dbtx)
                .await?
                .map(|row| row.get("state"));
        match state.as_deref() {
            Some("unconfirmed") => {}
            Some(other) => {
                return Err(TxmError::InvariantViolation(format!(
                    "cannot add attempt to transaction {} in state {}",
                    tx_id, other
                )))
            }
            None => return Err(TxmError::TransactionNotFound { tx_id }),
        }

        let inserted = insert_attempt(&mut dbtx, tx_id, &attempt, AttemptState::InProgress).await?;
        dbtx.commit().await?;
        Ok(inserted)
    }

    async fn mark_attempt_broadcast(&self, attempt_id: i64, now: DateTime<Utc>) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        let tx_id: i64 = sqlx::query(
            "UPDATE attempts SET state = 'broadcast' WHERE id = $1 AND state = 'in_progress' RETURNING tx_id",
        )
        .bind(attempt_id)
        .fetch_optional(&mut *dbtx)
        .await?
        .ok_or_else(|| {
            TxmError::InvariantViolation(format!("attempt {} is not in progress", attempt_id))
        })?
        .get("tx_id");

        sqlx::query(
            "UPDATE transactions SET broadcast_at = $2 WHERE id = $1 AND (broadcast_at IS NULL OR broadcast_at < $2)",
        )
        .bind(tx_id)
        .bind(now)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(())
    }

    async fn delete_in_progress_attempt(&self, attempt_id: i64) -> TxmResult<()> {
        let deleted = sqlx::query("DELETE FROM attempts WHERE id = $1 AND state = 'in_progress'")
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(TxmError::InvariantViolation(format!(
                "attempt {} is not in progress",
                attempt_id
            )));
        }
        Ok(())
    }

    async fn mark_unconfirmed_fatal(&self, tx_id: i64, error: String) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        sqlx::query("DELETE FROM attempts WHERE tx_id = $1 AND state = 'in_progress'")
            .bind(tx_id)
            .execute(&mut *dbtx)
            .await?;
        let updated = sqlx::query(
            "UPDATE transactions SET state = 'fatal_error', error = $2 WHERE id = $1 AND state = 'unconfirmed'",
        )
        .bind(tx_id)
        .bind(&error)
        .execute(&mut *dbtx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is not unconfirmed",
                tx_id
            )));
        }
        dbtx.commit().await?;
        Ok(())
    }

    async fn find_confirmed_with_receipts_since(
        &self,
        min_block: i64,
    ) -> TxmResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions t
            WHERE t.state = 'confirmed'
              AND EXISTS (
                  SELECT 1 FROM attempts a JOIN receipts r ON r.tx_hash = a.hash
                  WHERE a.tx_id = t.id AND r.block_number >= $1
              )
            ORDER BY t.from_address, t.nonce ASC
            "#
        ))
        .bind(min_block)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_transactions(rows).await
    }

    async fn mark_for_rebroadcast(&self, tx_id: i64, attempt_id: i64) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM receipts WHERE tx_hash IN (SELECT hash FROM attempts WHERE tx_id = $1)",
        )
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;

        let updated = sqlx::query(
            "UPDATE transactions SET state = 'unconfirmed' WHERE id = $1 AND state = 'confirmed'",
        )
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::InvariantViolation(format!(
                "transaction {} is not confirmed",
                tx_id
            )));
        }

        // Older attempts restart their block clock too
        sqlx::query("UPDATE attempts SET broadcast_before_block_num = NULL WHERE tx_id = $1")
            .bind(tx_id)
            .execute(&mut *dbtx)
            .await?;

        let updated = sqlx::query(
            r#"
            UPDATE attempts SET state = 'in_progress'
            WHERE id = $1 AND tx_id = $2
            "#,
        )
        .bind(attempt_id)
        .bind(tx_id)
        .execute(&mut *dbtx)
        .await
        .map_err(|e| constraint_violation(e, "rebroadcast attempt"))?;
        if updated.rows_affected() == 0 {
            return Err(TxmError::InvariantViolation(format!(
                "attempt {} does not belong to transaction {}",
                attempt_id, tx_id
            )));
        }

        dbtx.commit().await?;
        Ok(())
    }

    async fn find_transaction_by_nonce(
        &self,
        address: Address,
        nonce: i64,
    ) -> TxmResult<Option<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM transactions t
            WHERE t.from_address = $1 AND t.nonce = $2 AND t.state IN ('unconfirmed', 'confirmed')
            "#
        ))
        .bind(address.as_bytes())
        .bind(nonce)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.fetch_transactions(rows).await?.into_iter().next())
    }

    async fn find_attempts_requiring_resend(
        &self,
        address: Address,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> TxmResult<Vec<Attempt>> {
        let limit = if limit > 0 { Some(limit as i64) } else { None };
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT ON (t.nonce) {ATTEMPT_COLUMNS}
            FROM attempts a
            JOIN transactions t ON t.id = a.tx_id
            WHERE t.from_address = $1 AND t.state = 'unconfirmed'
              AND t.broadcast_at <= $2 AND a.state <> 'in_progress'
            ORDER BY t.nonce ASC, a.gas_price DESC NULLS LAST,
                     a.gas_tip_cap DESC NULLS LAST, a.gas_fee_cap DESC NULLS LAST, a.id DESC
            LIMIT $3
            "#
        ))
        .bind(address.as_bytes())
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn update_broadcast_ats(&self, now: DateTime<Utc>, tx_ids: Vec<i64>) -> TxmResult<()> {
        if tx_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE transactions SET broadcast_at = $1 WHERE id = ANY($2) AND broadcast_at < $1",
        )
        .bind(now)
        .bind(&tx_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_transactions(
        &self,
        min_block_to_keep: i64,
        older_than: DateTime<Utc>,
    ) -> TxmResult<u64> {
        let mut total = 0;

        loop {
            let deleted = sqlx::query(
                r#"
                DELETE FROM transactions WHERE id IN (
                    SELECT t.id FROM transactions t
                    WHERE t.state = 'confirmed' AND t.created_at < $2
                      AND EXISTS (
                          SELECT 1 FROM attempts a JOIN receipts r ON r.tx_hash = a.hash
                          WHERE a.tx_id = t.id
                      )
                      AND NOT EXISTS (
                          SELECT 1 FROM attempts a JOIN receipts r ON r.tx_hash = a.hash
                          WHERE a.tx_id = t.id AND r.block_number >= $1
                      )
                    LIMIT $3
                )
                "#,
            )
            .bind(min_block_to_keep)
            .bind(older_than)
            .bind(REAP_BATCH_SIZE)
            .execute(&self.pool)
            .await?
            .rows_affected();
            total += deleted;
            if (deleted as i64) < REAP_BATCH_SIZE {
                break;
            }
        }

        loop {
            let deleted = sqlx::query(
                r#"
                DELETE FROM transactions WHERE id IN (
                    SELECT id FROM transactions
                    WHERE state = 'fatal_error' AND created_at < $1
                    LIMIT $2
                )
                "#,
            )
            .bind(older_than)
            .bind(REAP_BATCH_SIZE)
            .execute(&self.pool)
            .await?
            .rows_affected();
            total += deleted;
            if (deleted as i64) < REAP_BATCH_SIZE {
                break;
            }
        }

        Ok(total)
    }

    async fn find_transaction(&self, tx_id: i64) -> TxmResult<Transaction> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions t WHERE t.id = $1"
        ))
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_transactions(rows)
            .await?
            .into_iter()
            .next()
            .ok_or(TxmError::TransactionNotFound { tx_id })
    }

    async fn transactions(&self, offset: u64, limit: u64) -> TxmResult<Page<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM transactions t ORDER BY t.id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let items = rows
            .iter()
            .map(tx_from_row)
            .collect::<TxmResult<Vec<_>>>()?;
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM transactions")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    async fn attempts(&self, offset: u64, limit: u64) -> TxmResult<Page<Attempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts a ORDER BY a.id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let items = rows
            .iter()
            .map(attempt_from_row)
            .collect::<TxmResult<Vec<_>>>()?;
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM attempts")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(Page {
            items,
            total: total as u64,
        })
    }
}

/// Unique and check violations mean a lifecycle invariant was about to break
fn constraint_violation(e: sqlx::Error, context: &str) -> TxmError {
    let code = e
        .as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.to_string());
    match code.as_deref() {
        Some("23505") | Some("23514") => {
            TxmError::InvariantViolation(format!("{}: {}", context, e))
        }
        _ => TxmError::Database(e),
    }
}

fn bytes_column(row: &PgRow, column: &str, len: usize) -> TxmResult<Vec<u8>> {
    let bytes: Vec<u8> = row.get(column);
    if bytes.len() != len {
        return Err(TxmError::Internal(format!(
            "column {} holds {} bytes, expected {}",
            column,
            bytes.len(),
            len
        )));
    }
    Ok(bytes)
}

fn address_from(row: &PgRow, column: &str) -> TxmResult<Address> {
    Ok(Address::from_slice(&bytes_column(row, column, 20)?))
}

fn hash_from(row: &PgRow, column: &str) -> TxmResult<H256> {
    Ok(H256::from_slice(&bytes_column(row, column, 32)?))
}

fn tx_from_row(row: &PgRow) -> TxmResult<Transaction> {
    let value: String = row.get("value");
    let state: String = row.get("state");
    let payload: Vec<u8> = row.get("payload");

    Ok(Transaction {
        id: row.get("id"),
        from_address: address_from(row, "from_address")?,
        to_address: address_from(row, "to_address")?,
        payload: Bytes::from(payload),
        value: U256::from_dec_str(&value)
            .map_err(|e| TxmError::Internal(format!("bad value {}: {}", value, e)))?,
        gas_limit: row.get::<i64, _>("gas_limit") as u64,
        subject: row.get("subject"),
        nonce: row.get("nonce"),
        state: TxState::parse(&state)?,
        error: row.get("error"),
        broadcast_at: row.get("broadcast_at"),
        initial_broadcast_at: row.get("initial_broadcast_at"),
        created_at: row.get("created_at"),
        attempts: Vec::new(),
    })
}

fn attempt_from_row(row: &PgRow) -> TxmResult<Attempt> {
    let gas_price: Option<i64> = row.get("gas_price");
    let fee_cap: Option<i64> = row.get("gas_fee_cap");
    let tip_cap: Option<i64> = row.get("gas_tip_cap");
    let gas_price = match (gas_price, fee_cap, tip_cap) {
        (Some(p), _, _) => GasPrice::Legacy(p as u64),
        (None, Some(fee), Some(tip)) => GasPrice::Eip1559 {
            max_fee_per_gas: fee as u64,
            max_priority_fee_per_gas: tip as u64,
        },
        _ => return Err(TxmError::Internal("attempt without a price".to_string())),
    };
    let state: String = row.get("state");
    let raw: Vec<u8> = row.get("signed_raw_tx");

    Ok(Attempt {
        id: row.get("id"),
        tx_id: row.get("tx_id"),
        gas_price,
        gas_limit: row.get::<i64, _>("gas_limit") as u64,
        signed_raw_tx: Bytes::from(raw),
        hash: hash_from(row, "hash")?,
        state: AttemptState::parse(&state)?,
        broadcast_before_block_num: row.get("broadcast_before_block_num"),
        created_at: row.get("created_at"),
        receipts: Vec::new(),
    })
}

fn receipt_from_row(row: &PgRow) -> TxmResult<Receipt> {
    Ok(Receipt {
        id: row.get("id"),
        tx_hash: hash_from(row, "tx_hash")?,
        block_hash: hash_from(row, "block_hash")?,
        block_number: row.get("block_number"),
        transaction_index: row.get::<i64, _>("transaction_index") as u64,
        receipt: row.get("receipt"),
        created_at: row.get("created_at"),
    })
}
