//! Best offer aggregator.
//!
//! Per queued product, in one transaction: lock the normalized prices not yet
//! folded in, take their minimum, and lower the stored best with a conditional
//! upsert. The in-season price follows the same rule on its own column. When
//! the row that held the best has been pruned, the offer is rebuilt from what
//! is left.
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{ClaimJob, Outcome};
use crate::database_ops::best_offers::{
    best_offer_orphaned, delete_best_offer, offer_best_price, offer_season_price,
    product_season, replace_best_offer,
};
use crate::database_ops::claim::{self, ClaimSpec, AGGREGATION_QUEUE};
use crate::database_ops::db::Db;
use crate::database_ops::golden_prices::{lock_price_points, mark_aggregated, PricePoint};
use crate::error::RowError;
use crate::normalization::quantity::BaseUnitKind;
use crate::normalization::season::SeasonWindow;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates<'a> {
    /// Cheapest point; ties go to the earliest date, then the lowest store id.
    pub best: Option<&'a PricePoint>,
    /// Cheapest price among points observed inside the season window.
    pub in_season: Option<&'a BigDecimal>,
}

pub fn fold_candidates(points: &[PricePoint], season: Option<SeasonWindow>) -> Candidates<'_> {
    let best = points
        .iter()
        .min_by(|a, b| {
            a.unit_price
                .cmp(&b.unit_price)
                .then(a.price_date.cmp(&b.price_date))
                .then(a.store_id.cmp(&b.store_id))
        });
    let in_season = season.and_then(|w| {
        points
            .iter()
            .filter(|p| w.contains(p.price_date))
            .map(|p| &p.unit_price)
            .min()
    });
    Candidates { best, in_season }
}

#[derive(Debug, Default)]
pub struct BestOfferJob;

impl BestOfferJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClaimJob for BestOfferJob {
    fn name(&self) -> &'static str {
        "best_offers"
    }

    fn spec(&self) -> &'static ClaimSpec {
        &AGGREGATION_QUEUE
    }

    #[instrument(skip(self, db, owner))]
    async fn process(&self, db: &Db, owner: Uuid, id: i64) -> Result<Outcome, RowError> {
        let mut tx = db.pool.begin().await?;
        let product = product_season(&mut *tx, id)
            .await?
            .ok_or_else(|| RowError::Missing(format!("golden product {id} vanished")))?;
        let kind: BaseUnitKind = product.base_unit_type.parse().map_err(RowError::Malformed)?;
        let season =
            SeasonWindow::from_columns(product.seasonal_start_month, product.seasonal_end_month);

        let rebuild = best_offer_orphaned(&mut *tx, id).await?;
        let points = lock_price_points(&mut *tx, id, kind, !rebuild).await?;
        let folded = fold_candidates(&points, season);

        let changed = if rebuild {
            match folded.best {
                Some(best) => {
                    replace_best_offer(
                        &mut *tx,
                        id,
                        kind,
                        &best.unit_price,
                        best.store_id,
                        best.price_date,
                        folded.in_season,
                    )
                    .await?;
                }
                None => {
                    delete_best_offer(&mut *tx, id).await?;
                }
            }
            info!(product_id = id, remaining = points.len(), "best offer rebuilt after its source row was removed");
            true
        } else {
            let mut changed = false;
            if let Some(best) = folded.best {
                changed |= offer_best_price(
                    &mut *tx,
                    id,
                    kind,
                    &best.unit_price,
                    best.store_id,
                    best.price_date,
                )
                .await?;
            }
            if let Some(price) = folded.in_season {
                changed |= offer_season_price(&mut *tx, id, price).await?;
            }
            changed
        };

        let ids: Vec<i64> = points.iter().map(|p| p.id).collect();
        mark_aggregated(&mut *tx, &ids).await?;
        if !claim::complete(&mut *tx, &AGGREGATION_QUEUE, owner, id).await? {
            return Ok(Outcome::Skipped);
        }
        tx.commit().await?;
        debug!(product_id = id, folded = ids.len(), changed, "aggregated");
        if ids.is_empty() && !rebuild {
            Ok(Outcome::Skipped)
        } else {
            Ok(Outcome::Processed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn point(id: i64, store_id: i64, month: u32, day: u32, price: &str) -> PricePoint {
        PricePoint {
            id,
            store_id,
            price_date: NaiveDate::from_ymd_opt(2025, month, day).unwrap(),
            unit_price: BigDecimal::from_str(price).unwrap(),
        }
    }

    #[test]
    fn picks_cheapest_point() {
        let points = vec![
            point(1, 10, 3, 1, "4.9900"),
            point(2, 11, 3, 2, "3.4900"),
            point(3, 12, 3, 3, "3.9900"),
        ];
        let c = fold_candidates(&points, None);
        assert_eq!(c.best.map(|p| p.store_id), Some(11));
        assert!(c.in_season.is_none());
    }

    #[test]
    fn ties_keep_the_earliest_observation() {
        let points = vec![point(1, 20, 5, 9, "2.0000"), point(2, 30, 5, 2, "2.0000")];
        assert_eq!(fold_candidates(&points, None).best.map(|p| p.id), Some(2));
    }

    #[test]
    fn in_season_minimum_ignores_out_of_season_points() {
        let winter = SeasonWindow::new(11, 2);
        let points = vec![
            point(1, 1, 7, 1, "0.9900"),
            point(2, 1, 12, 1, "1.4900"),
            point(3, 2, 1, 15, "1.2900"),
        ];
        let c = fold_candidates(&points, winter);
        assert_eq!(c.best.map(|p| p.id), Some(1));
        assert_eq!(c.in_season, Some(&BigDecimal::from_str("1.29").unwrap()));
    }

    #[test]
    fn nothing_to_fold() {
        let c = fold_candidates(&[], SeasonWindow::new(1, 12));
        assert_eq!(c, Candidates::default());
    }
}
