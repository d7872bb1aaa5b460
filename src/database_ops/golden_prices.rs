use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::{FromRow, PgConnection, PgExecutor};
use tracing::instrument;

use crate::database_ops::db::Db;
use crate::normalization::quantity::BaseUnitKind;
use crate::normalization::unit_price::UnitPrice;

#[derive(Debug, Clone)]
pub struct NormalizedPriceRow {
    pub product_id: i64,
    pub store_id: i64,
    pub price_date: NaiveDate,
    pub regular_price: Option<BigDecimal>,
    pub special_price: Option<BigDecimal>,
    pub unit: UnitPrice,
}

/// Idempotent write of one normalized price. An unchanged row stays
/// aggregated; a changed one is marked dirty again. Returns whether anything
/// was written.
pub async fn upsert_normalized_price(
    conn: &mut PgConnection,
    row: &NormalizedPriceRow,
) -> sqlx::Result<bool> {
    let per = |kind: BaseUnitKind| (row.unit.kind == kind).then(|| row.unit.value.clone());
    let res = sqlx::query(
        r#"
        INSERT INTO golden_prices (
            product_id, store_id, price_date, regular_price, special_price,
            price_per_kg, price_per_l, price_per_piece, is_on_special_offer, aggregated
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
        ON CONFLICT (product_id, store_id, price_date) DO UPDATE SET
            regular_price       = EXCLUDED.regular_price,
            special_price       = EXCLUDED.special_price,
            price_per_kg        = EXCLUDED.price_per_kg,
            price_per_l         = EXCLUDED.price_per_l,
            price_per_piece     = EXCLUDED.price_per_piece,
            is_on_special_offer = EXCLUDED.is_on_special_offer,
            aggregated          = FALSE
        WHERE (golden_prices.regular_price, golden_prices.special_price,
               golden_prices.price_per_kg, golden_prices.price_per_l,
               golden_prices.price_per_piece, golden_prices.is_on_special_offer)
              IS DISTINCT FROM
              (EXCLUDED.regular_price, EXCLUDED.special_price,
               EXCLUDED.price_per_kg, EXCLUDED.price_per_l,
               EXCLUDED.price_per_piece, EXCLUDED.is_on_special_offer)
        "#,
    )
    .bind(row.product_id)
    .bind(row.store_id)
    .bind(row.price_date)
    .bind(&row.regular_price)
    .bind(&row.special_price)
    .bind(per(BaseUnitKind::Weight))
    .bind(per(BaseUnitKind::Volume))
    .bind(per(BaseUnitKind::Count))
    .bind(row.unit.on_special)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Put a product on the aggregator's dirty set. A previously failed entry is
/// re-armed, since new data is a reason to try again.
pub async fn enqueue_aggregation<'e, E: PgExecutor<'e>>(
    executor: E,
    product_id: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO aggregation_queue (product_id) VALUES ($1) \
         ON CONFLICT (product_id) DO UPDATE SET claim_status = 'pending', last_error = NULL \
         WHERE aggregation_queue.claim_status = 'failed'",
    )
    .bind(product_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// One per-unit price as seen by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PricePoint {
    pub id: i64,
    pub store_id: i64,
    pub price_date: NaiveDate,
    pub unit_price: BigDecimal,
}

/// Lock and return the product's rows in `kind`'s unit column, either only the
/// ones not yet folded into the best offer or all of them.
pub async fn lock_price_points(
    conn: &mut PgConnection,
    product_id: i64,
    kind: BaseUnitKind,
    only_dirty: bool,
) -> sqlx::Result<Vec<PricePoint>> {
    let sql = format!(
        "SELECT id, store_id, price_date, {col} AS unit_price \
         FROM golden_prices \
         WHERE product_id = $1 AND {col} IS NOT NULL {dirty} \
         ORDER BY id \
         FOR UPDATE",
        col = kind.price_column(),
        dirty = if only_dirty { "AND NOT aggregated" } else { "" },
    );
    sqlx::query_as::<_, PricePoint>(&sql)
        .bind(product_id)
        .fetch_all(conn)
        .await
}

/// Flag exactly the rows that were folded. Rows committed after the lock was
/// taken stay dirty for the next pass.
pub async fn mark_aggregated(conn: &mut PgConnection, ids: &[i64]) -> sqlx::Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query(
        "UPDATE golden_prices SET aggregated = TRUE WHERE id = ANY($1) AND NOT aggregated",
    )
    .bind(ids)
    .execute(conn)
    .await?;
    Ok(res.rows_affected())
}

/// Delete normalized prices observed more than `older_than_days` ago and queue
/// their products so best offers that pointed at them get rebuilt.
#[instrument(skip(db))]
pub async fn prune_stale_prices(db: &Db, older_than_days: u32) -> anyhow::Result<u64> {
    let days = i32::try_from(older_than_days)?;
    let deleted: i64 = sqlx::query_scalar(
        r#"
        WITH gone AS (
            DELETE FROM golden_prices
            WHERE price_date < current_date - $1::int
            RETURNING product_id
        ), queued AS (
            INSERT INTO aggregation_queue (product_id)
            SELECT DISTINCT product_id FROM gone
            ON CONFLICT (product_id) DO UPDATE SET claim_status = 'pending', last_error = NULL
            WHERE aggregation_queue.claim_status = 'failed'
            RETURNING product_id
        )
        SELECT count(*) FROM gone
        "#,
    )
    .bind(days)
    .fetch_one(&db.pool)
    .await?;
    Ok(deleted as u64)
}
