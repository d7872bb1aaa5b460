use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::{FromRow, PgConnection};

use crate::normalization::quantity::BaseUnitKind;

#[derive(Debug, Clone, FromRow)]
pub struct ProductSeason {
    pub base_unit_type: String,
    pub seasonal_start_month: Option<i16>,
    pub seasonal_end_month: Option<i16>,
}

pub async fn product_season(
    conn: &mut PgConnection,
    product_id: i64,
) -> sqlx::Result<Option<ProductSeason>> {
    sqlx::query_as::<_, ProductSeason>(
        "SELECT base_unit_type, seasonal_start_month, seasonal_end_month \
         FROM golden_products WHERE id = $1",
    )
    .bind(product_id)
    .fetch_optional(conn)
    .await
}

/// True when the product's best offer points at a normalized price that no
/// longer exists. Locks the best offer row.
pub async fn best_offer_orphaned(conn: &mut PgConnection, product_id: i64) -> sqlx::Result<bool> {
    let orphaned: Option<bool> = sqlx::query_scalar(
        r#"
        SELECT NOT EXISTS (
            SELECT 1 FROM golden_prices gp
            WHERE gp.product_id = b.product_id
              AND gp.store_id = b.best_price_store_id
              AND gp.price_date = b.best_price_date
        )
        FROM best_offers b
        WHERE b.product_id = $1 AND b.best_price_date IS NOT NULL
        FOR UPDATE OF b
        "#,
    )
    .bind(product_id)
    .fetch_optional(conn)
    .await?;
    Ok(orphaned.unwrap_or(false))
}

/// Lower the all-time best if `price` beats it (or none is recorded yet).
/// Returns whether the stored best changed.
pub async fn offer_best_price(
    conn: &mut PgConnection,
    product_id: i64,
    kind: BaseUnitKind,
    price: &BigDecimal,
    store_id: i64,
    price_date: NaiveDate,
) -> sqlx::Result<bool> {
    let sql = format!(
        r#"
        INSERT INTO best_offers (product_id, {col}, best_price_store_id, best_price_date, best_price_found_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (product_id) DO UPDATE SET
            {col}               = EXCLUDED.{col},
            best_price_store_id = EXCLUDED.best_price_store_id,
            best_price_date     = EXCLUDED.best_price_date,
            best_price_found_at = EXCLUDED.best_price_found_at
        WHERE best_offers.{col} IS NULL OR EXCLUDED.{col} < best_offers.{col}
        "#,
        col = kind.best_column(),
    );
    let res = sqlx::query(&sql)
        .bind(product_id)
        .bind(price)
        .bind(store_id)
        .bind(price_date)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Same "only if lower" rule for the in-season price, independent of the best.
pub async fn offer_season_price(
    conn: &mut PgConnection,
    product_id: i64,
    price: &BigDecimal,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO best_offers (product_id, lowest_price_in_season)
        VALUES ($1, $2)
        ON CONFLICT (product_id) DO UPDATE SET
            lowest_price_in_season = EXCLUDED.lowest_price_in_season
        WHERE best_offers.lowest_price_in_season IS NULL
           OR EXCLUDED.lowest_price_in_season < best_offers.lowest_price_in_season
        "#,
    )
    .bind(product_id)
    .bind(price)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Overwrite the best offer from scratch. Only used when its source row was
/// deleted; this is the one path where the best price can go up.
pub async fn replace_best_offer(
    conn: &mut PgConnection,
    product_id: i64,
    kind: BaseUnitKind,
    price: &BigDecimal,
    store_id: i64,
    price_date: NaiveDate,
    in_season: Option<&BigDecimal>,
) -> sqlx::Result<()> {
    let sql = format!(
        r#"
        INSERT INTO best_offers (product_id, {col}, best_price_store_id, best_price_date,
                                 best_price_found_at, lowest_price_in_season)
        VALUES ($1, $2, $3, $4, now(), $5)
        ON CONFLICT (product_id) DO UPDATE SET
            best_unit_price_per_kg    = EXCLUDED.best_unit_price_per_kg,
            best_unit_price_per_l     = EXCLUDED.best_unit_price_per_l,
            best_unit_price_per_piece = EXCLUDED.best_unit_price_per_piece,
            best_price_store_id       = EXCLUDED.best_price_store_id,
            best_price_date           = EXCLUDED.best_price_date,
            best_price_found_at       = EXCLUDED.best_price_found_at,
            lowest_price_in_season    = EXCLUDED.lowest_price_in_season
        "#,
        col = kind.best_column(),
    );
    sqlx::query(&sql)
        .bind(product_id)
        .bind(price)
        .bind(store_id)
        .bind(price_date)
        .bind(in_season)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn delete_best_offer(conn: &mut PgConnection, product_id: i64) -> sqlx::Result<bool> {
    let res = sqlx::query("DELETE FROM best_offers WHERE product_id = $1")
        .bind(product_id)
        .execute(conn)
        .await?;
    Ok(res.rows_affected() == 1)
}
