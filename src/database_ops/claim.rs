//! Claim engine: hands out bounded slices of pending rows to concurrent workers.
//!
//! Every claimable table carries the same bookkeeping columns
//! (`claim_status`, `claimed_by`, `claimed_at`, `claim_attempts`, `last_error`).
//! A row is claimable when it is `pending`, or `claimed` by someone whose lease
//! has lapsed, and the table's work predicate holds. The claim is a single
//! `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED LIMIT n)` statement, so two
//! callers can never walk away with the same row.
use anyhow::Result;
use sqlx::PgExecutor;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database_ops::db::Db;

/// What a successful completion does to the claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Terminal: the row is processed for good.
    Done,
    /// Back to `pending`; the predicate decides whether new work shows up later.
    Rearm,
}

#[derive(Debug)]
pub struct ClaimSpec {
    pub name: &'static str,
    pub table: &'static str,
    /// Key column returned by the claim; also the column completion targets.
    pub key: &'static str,
    /// Extra SQL condition over alias `t`.
    pub predicate: &'static str,
    pub completion: Completion,
}

/// Barcodes that still have retailer SKUs waiting for a golden record.
pub const BARCODES: ClaimSpec = ClaimSpec {
    name: "barcodes",
    table: "products",
    key: "id",
    predicate: "EXISTS (SELECT 1 FROM chain_products cp \
                WHERE cp.product_id = t.id AND NOT cp.is_processed)",
    completion: Completion::Rearm,
};

/// Price observations whose barcode already has a golden record.
pub const PRICE_OBSERVATIONS: ClaimSpec = ClaimSpec {
    name: "price_observations",
    table: "prices",
    key: "id",
    predicate: "EXISTS (SELECT 1 FROM chain_products cp \
                JOIN products p ON p.id = cp.product_id \
                JOIN golden_products g ON g.barcode = p.barcode \
                WHERE cp.id = t.chain_product_id)",
    completion: Completion::Done,
};

/// Golden products with normalized prices the aggregator has not folded in yet,
/// or whose best offer lost its source row.
pub const AGGREGATION_QUEUE: ClaimSpec = ClaimSpec {
    name: "aggregation_queue",
    table: "aggregation_queue",
    key: "product_id",
    predicate: "EXISTS (SELECT 1 FROM golden_prices gp \
                WHERE gp.product_id = t.product_id AND NOT gp.aggregated) \
                OR EXISTS (SELECT 1 FROM best_offers b \
                WHERE b.product_id = t.product_id AND b.best_price_date IS NOT NULL \
                AND NOT EXISTS (SELECT 1 FROM golden_prices gp \
                WHERE gp.product_id = b.product_id \
                AND gp.store_id = b.best_price_store_id \
                AND gp.price_date = b.best_price_date))",
    completion: Completion::Rearm,
};

/// Atomically claim up to `limit` rows for `owner`. Returns the claimed keys in
/// ascending order; an empty vector means nothing is pending.
#[instrument(skip(db, spec), fields(spec = spec.name))]
pub async fn claim_batch(
    db: &Db,
    spec: &ClaimSpec,
    owner: Uuid,
    limit: i64,
    lease: Duration,
) -> Result<Vec<i64>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        r#"
        WITH candidates AS (
            SELECT t.{key}
            FROM {table} t
            WHERE (t.claim_status = 'pending'
                   OR (t.claim_status = 'claimed'
                       AND t.claimed_at < now() - make_interval(secs => $3)))
              AND ({predicate})
            ORDER BY t.{key}
            LIMIT $1
            FOR UPDATE OF t SKIP LOCKED
        )
        UPDATE {table} t
        SET claim_status   = 'claimed',
            claimed_by     = $2,
            claimed_at     = now(),
            claim_attempts = t.claim_attempts + 1
        FROM candidates c
        WHERE t.{key} = c.{key}
        RETURNING t.{key}
        "#,
        key = spec.key,
        table = spec.table,
        predicate = spec.predicate,
    );
    let mut ids: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(limit)
        .bind(owner)
        .bind(lease.as_secs_f64())
        .fetch_all(&db.pool)
        .await?;
    ids.sort_unstable();
    debug!(claimed = ids.len(), "claim batch");
    Ok(ids)
}

/// Mark a claimed row finished. Returns false when `owner` no longer holds the
/// claim (lease expired and someone else took it), in which case the caller
/// should roll back whatever it wrote alongside.
pub async fn complete<'e, E>(
    executor: E,
    spec: &ClaimSpec,
    owner: Uuid,
    id: i64,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'e>,
{
    let next = match spec.completion {
        Completion::Done => "done",
        Completion::Rearm => "pending",
    };
    let sql = format!(
        "UPDATE {table} SET claim_status = '{next}', claimed_by = NULL, claimed_at = NULL, \
         last_error = NULL \
         WHERE {key} = $1 AND claimed_by = $2 AND claim_status = 'claimed'",
        table = spec.table,
        key = spec.key,
    );
    let res = sqlx::query(&sql)
        .bind(id)
        .bind(owner)
        .execute(executor)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Park a row as failed with a reason. Failed rows are left for operators and
/// only come back through [`requeue_failed`].
pub async fn fail<'e, E>(
    executor: E,
    spec: &ClaimSpec,
    owner: Uuid,
    id: i64,
    reason: &str,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "UPDATE {table} SET claim_status = 'failed', claimed_by = NULL, claimed_at = NULL, \
         last_error = $3 \
         WHERE {key} = $1 AND claimed_by = $2 AND claim_status = 'claimed'",
        table = spec.table,
        key = spec.key,
    );
    let res = sqlx::query(&sql)
        .bind(id)
        .bind(owner)
        .bind(reason)
        .execute(executor)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Give a single claimed row back without recording a failure.
pub async fn release<'e, E>(
    executor: E,
    spec: &ClaimSpec,
    owner: Uuid,
    id: i64,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "UPDATE {table} SET claim_status = 'pending', claimed_by = NULL, claimed_at = NULL \
         WHERE {key} = $1 AND claimed_by = $2 AND claim_status = 'claimed'",
        table = spec.table,
        key = spec.key,
    );
    let res = sqlx::query(&sql)
        .bind(id)
        .bind(owner)
        .execute(executor)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Return every row still claimed by `owner` (run shutdown).
#[instrument(skip(db, spec), fields(spec = spec.name))]
pub async fn release_owned(db: &Db, spec: &ClaimSpec, owner: Uuid) -> Result<u64> {
    let sql = format!(
        "UPDATE {table} SET claim_status = 'pending', claimed_by = NULL, claimed_at = NULL \
         WHERE claimed_by = $1 AND claim_status = 'claimed'",
        table = spec.table,
    );
    let res = sqlx::query(&sql).bind(owner).execute(&db.pool).await?;
    Ok(res.rows_affected())
}

/// Put every failed row back into the pending pool.
#[instrument(skip(db, spec), fields(spec = spec.name))]
pub async fn requeue_failed(db: &Db, spec: &ClaimSpec) -> Result<u64> {
    let sql = format!(
        "UPDATE {table} SET claim_status = 'pending', last_error = NULL \
         WHERE claim_status = 'failed'",
        table = spec.table,
    );
    let res = sqlx::query(&sql).execute(&db.pool).await?;
    Ok(res.rows_affected())
}
