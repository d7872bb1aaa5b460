//! Golden record normalizer: one barcode in, one canonical product out.
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{ClaimJob, Outcome};
use crate::capability::{Embedder, Normalizer};
use crate::database_ops::claim::{self, ClaimSpec, BARCODES};
use crate::database_ops::db::Db;
use crate::database_ops::golden_products::{ensure_category, golden_by_barcode, upsert_golden};
use crate::database_ops::raw_catalog::{
    barcode_of, chain_products_of, mark_chain_products_processed,
};
use crate::error::RowError;
use crate::normalization::barcode::BarcodeFilter;
use crate::normalization::record::{fingerprint, GoldenDraft, RawVariant};

pub struct GoldenRecordJob {
    normalizer: Arc<dyn Normalizer>,
    embedder: Arc<dyn Embedder>,
    filter: BarcodeFilter,
}

impl GoldenRecordJob {
    pub fn new(
        normalizer: Arc<dyn Normalizer>,
        embedder: Arc<dyn Embedder>,
        filter: BarcodeFilter,
    ) -> Self {
        Self {
            normalizer,
            embedder,
            filter,
        }
    }

    /// Ask the providers for a validated draft and its embedding.
    async fn enrich(
        &self,
        barcode: &str,
        raws: &[RawVariant],
    ) -> Result<(GoldenDraft, Vec<f32>), RowError> {
        let record = self.normalizer.normalize(barcode, raws).await?;
        let draft = GoldenDraft::from_record(record)?;
        let embedding = self.embedder.embed(&draft.text_for_embedding).await?;
        if embedding.len() != self.embedder.dims() {
            return Err(RowError::Malformed(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.embedder.dims()
            )));
        }
        Ok((draft, embedding))
    }
}

#[async_trait]
impl ClaimJob for GoldenRecordJob {
    fn name(&self) -> &'static str {
        "golden_records"
    }

    fn spec(&self) -> &'static ClaimSpec {
        &BARCODES
    }

    #[instrument(skip(self, db, owner))]
    async fn process(&self, db: &Db, owner: Uuid, id: i64) -> Result<Outcome, RowError> {
        let barcode = barcode_of(&db.pool, id)
            .await?
            .ok_or_else(|| RowError::Missing(format!("product {id} vanished")))?;
        self.filter.check(&barcode).map_err(RowError::BarcodeRejected)?;

        let rows = chain_products_of(&db.pool, id).await?;
        if rows.is_empty() {
            return Err(RowError::Missing(format!("barcode {barcode} has no retailer products")));
        }
        let pending: Vec<i64> = rows.iter().filter(|r| !r.is_processed).map(|r| r.id).collect();
        let raws: Vec<RawVariant> = rows.iter().map(|r| r.raw_variant()).collect();
        let digest = fingerprint(&raws);

        let mut conn = db.pool.acquire().await?;
        let existing = golden_by_barcode(&mut *conn, &barcode).await?;
        drop(conn);

        if let Some(head) = existing.as_ref().filter(|h| h.source_fingerprint == digest) {
            // Same inputs as last time: nothing for the providers to add.
            let mut tx = db.pool.begin().await?;
            mark_chain_products_processed(&mut *tx, &pending).await?;
            if !claim::complete(&mut *tx, &BARCODES, owner, id).await? {
                return Ok(Outcome::Skipped);
            }
            tx.commit().await?;
            debug!(%barcode, golden_id = head.id, "inputs unchanged");
            return Ok(Outcome::Skipped);
        }

        let (draft, embedding) = self.enrich(&barcode, &raws).await?;
        if let Some(head) = &existing {
            if head.base_unit_type != draft.base_unit.as_str() {
                return Err(RowError::BaseUnitConflict {
                    stored: head.base_unit_type.clone(),
                    incoming: draft.base_unit.to_string(),
                });
            }
        }

        let mut tx = db.pool.begin().await?;
        let category_id = match draft.category.as_deref() {
            Some(name) => Some(ensure_category(&mut *tx, name).await?),
            None => None,
        };
        let Some(golden_id) =
            upsert_golden(&mut *tx, &barcode, &draft, category_id, &digest, embedding).await?
        else {
            // Written concurrently with another kind; keep what is stored.
            let stored = golden_by_barcode(&mut *tx, &barcode)
                .await?
                .map(|h| h.base_unit_type)
                .unwrap_or_default();
            return Err(RowError::BaseUnitConflict {
                stored,
                incoming: draft.base_unit.to_string(),
            });
        };
        mark_chain_products_processed(&mut *tx, &pending).await?;
        if !claim::complete(&mut *tx, &BARCODES, owner, id).await? {
            return Ok(Outcome::Skipped);
        }
        tx.commit().await?;
        info!(
            %barcode,
            golden_id,
            base_unit = %draft.base_unit,
            variants = draft.variants.len(),
            "golden record written"
        );
        Ok(Outcome::Processed)
    }
}
