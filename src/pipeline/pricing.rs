//! Unit price calculator: one price observation in, one normalized price out.
use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{ClaimJob, Outcome};
use crate::database_ops::claim::{self, ClaimSpec, PRICE_OBSERVATIONS};
use crate::database_ops::db::Db;
use crate::database_ops::golden_prices::{
    enqueue_aggregation, upsert_normalized_price, NormalizedPriceRow,
};
use crate::database_ops::raw_catalog::{priced_observation, PricedObservation};
use crate::error::RowError;
use crate::normalization::quantity::{parse_declared, parse_quantity, BaseUnitKind};
use crate::normalization::unit_price::{compute_unit_price, resolve_amount, ObservedPrice};

#[derive(Debug, Default)]
pub struct UnitPriceJob;

impl UnitPriceJob {
    pub fn new() -> Self {
        Self
    }
}

/// Pure part of the calculation: pick the variant, convert, round.
pub fn normalize_observation(obs: &PricedObservation) -> Result<NormalizedPriceRow, RowError> {
    let kind: BaseUnitKind = obs.base_unit_type.parse().map_err(RowError::Malformed)?;
    let declared = parse_declared(obs.sku_quantity.as_deref(), obs.sku_unit.as_deref())
        .or_else(|| parse_quantity(&obs.sku_name));
    let amount = resolve_amount(kind, &obs.variants.0, declared)?;
    let prices = ObservedPrice {
        regular: obs.regular_price.clone(),
        special: obs.special_price.clone(),
    };
    let unit = compute_unit_price(&prices, kind, amount)?;
    Ok(NormalizedPriceRow {
        product_id: obs.golden_id,
        store_id: obs.store_id,
        price_date: obs.price_date,
        regular_price: prices.regular,
        special_price: prices.special,
        unit,
    })
}

#[async_trait]
impl ClaimJob for UnitPriceJob {
    fn name(&self) -> &'static str {
        "unit_prices"
    }

    fn spec(&self) -> &'static ClaimSpec {
        &PRICE_OBSERVATIONS
    }

    #[instrument(skip(self, db, owner))]
    async fn process(&self, db: &Db, owner: Uuid, id: i64) -> Result<Outcome, RowError> {
        let obs = priced_observation(&db.pool, id)
            .await?
            .ok_or_else(|| RowError::Missing(format!("price {id} has no golden record")))?;
        let row = normalize_observation(&obs)?;

        let mut tx = db.pool.begin().await?;
        let written = upsert_normalized_price(&mut *tx, &row).await?;
        enqueue_aggregation(&mut *tx, row.product_id).await?;
        if !claim::complete(&mut *tx, &PRICE_OBSERVATIONS, owner, id).await? {
            return Ok(Outcome::Skipped);
        }
        tx.commit().await?;
        debug!(
            golden_id = row.product_id,
            store_id = row.store_id,
            unit_price = %row.unit.value,
            kind = %row.unit.kind,
            written,
            "normalized price"
        );
        Ok(Outcome::Processed)
    }
}
