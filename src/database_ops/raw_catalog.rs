//! Reads over the import-owned tables (`products`, `chain_products`, `prices`).
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor};

use crate::normalization::record::{PackageVariant, RawVariant};

#[derive(Debug, Clone, FromRow)]
pub struct ChainProductRow {
    pub id: i64,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub quantity: Option<String>,
    pub unit: Option<String>,
    pub is_processed: bool,
}

impl ChainProductRow {
    pub fn raw_variant(&self) -> RawVariant {
        RawVariant {
            name: self.name.clone(),
            brand: self.brand.clone(),
            category: self.category.clone(),
            quantity: self.quantity.clone(),
            unit: self.unit.clone(),
        }
    }
}

pub async fn barcode_of<'e, E: PgExecutor<'e>>(
    executor: E,
    product_id: i64,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar("SELECT barcode FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(executor)
        .await
}

/// Every retailer SKU of a barcode, processed or not.
pub async fn chain_products_of<'e, E: PgExecutor<'e>>(
    executor: E,
    product_id: i64,
) -> sqlx::Result<Vec<ChainProductRow>> {
    sqlx::query_as::<_, ChainProductRow>(
        "SELECT id, name, brand, category, quantity, unit, is_processed \
         FROM chain_products WHERE product_id = $1 ORDER BY id",
    )
    .bind(product_id)
    .fetch_all(executor)
    .await
}

pub async fn mark_chain_products_processed<'e, E: PgExecutor<'e>>(
    executor: E,
    ids: &[i64],
) -> sqlx::Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query("UPDATE chain_products SET is_processed = TRUE WHERE id = ANY($1)")
        .bind(ids)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

/// A price observation joined with the golden record of its barcode.
#[derive(Debug, Clone, FromRow)]
pub struct PricedObservation {
    pub store_id: i64,
    pub price_date: NaiveDate,
    pub regular_price: Option<BigDecimal>,
    pub special_price: Option<BigDecimal>,
    pub sku_name: String,
    pub sku_quantity: Option<String>,
    pub sku_unit: Option<String>,
    pub golden_id: i64,
    pub base_unit_type: String,
    pub variants: Json<Vec<PackageVariant>>,
}

pub async fn priced_observation<'e, E: PgExecutor<'e>>(
    executor: E,
    price_id: i64,
) -> sqlx::Result<Option<PricedObservation>> {
    sqlx::query_as::<_, PricedObservation>(
        r#"
        SELECT pr.store_id,
               pr.price_date,
               pr.regular_price,
               pr.special_price,
               cp.name       AS sku_name,
               cp.quantity   AS sku_quantity,
               cp.unit       AS sku_unit,
               g.id          AS golden_id,
               g.base_unit_type,
               g.variants
        FROM prices pr
        JOIN chain_products cp ON cp.id = pr.chain_product_id
        JOIN products p        ON p.id = cp.product_id
        JOIN golden_products g ON g.barcode = p.barcode
        WHERE pr.id = $1
        "#,
    )
    .bind(price_id)
    .fetch_optional(executor)
    .await
}
