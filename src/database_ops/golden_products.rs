use pgvector::Vector;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};

use crate::normalization::record::GoldenDraft;

#[derive(Debug, Clone, FromRow)]
pub struct GoldenHead {
    pub id: i64,
    pub base_unit_type: String,
    pub source_fingerprint: String,
}

pub async fn golden_by_barcode(
    conn: &mut PgConnection,
    barcode: &str,
) -> sqlx::Result<Option<GoldenHead>> {
    sqlx::query_as::<_, GoldenHead>(
        "SELECT id, base_unit_type, source_fingerprint FROM golden_products WHERE barcode = $1",
    )
    .bind(barcode)
    .fetch_optional(conn)
    .await
}

/// Get-or-create a category by exact name.
pub async fn ensure_category(conn: &mut PgConnection, name: &str) -> sqlx::Result<i64> {
    let inserted: Option<i64> = sqlx::query_scalar(
        "INSERT INTO categories (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(id) = inserted {
        return Ok(id);
    }
    sqlx::query_scalar("SELECT id FROM categories WHERE name = $1")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
}

/// Insert or refresh the golden record of `barcode`. Returns `None` when a
/// record exists with a different base unit kind; that row is left as is.
pub async fn upsert_golden(
    conn: &mut PgConnection,
    barcode: &str,
    draft: &GoldenDraft,
    category_id: Option<i64>,
    fingerprint: &str,
    embedding: Vec<f32>,
) -> sqlx::Result<Option<i64>> {
    let (start, end) = match draft.season {
        Some(w) => (Some(w.start() as i16), Some(w.end() as i16)),
        None => (None, None),
    };
    sqlx::query_scalar(
        r#"
        INSERT INTO golden_products (
            barcode, canonical_name, brand, category_id, base_unit_type, variants,
            text_for_embedding, keywords, attributes, is_generic_product,
            seasonal_start_month, seasonal_end_month, source_fingerprint, embedding
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (barcode) DO UPDATE SET
            canonical_name       = EXCLUDED.canonical_name,
            brand                = EXCLUDED.brand,
            category_id          = EXCLUDED.category_id,
            variants             = EXCLUDED.variants,
            text_for_embedding   = EXCLUDED.text_for_embedding,
            keywords             = EXCLUDED.keywords,
            attributes           = EXCLUDED.attributes,
            is_generic_product   = EXCLUDED.is_generic_product,
            seasonal_start_month = EXCLUDED.seasonal_start_month,
            seasonal_end_month   = EXCLUDED.seasonal_end_month,
            source_fingerprint   = EXCLUDED.source_fingerprint,
            embedding            = EXCLUDED.embedding,
            updated_at           = now()
        WHERE golden_products.base_unit_type = EXCLUDED.base_unit_type
        RETURNING id
        "#,
    )
    .bind(barcode)
    .bind(&draft.canonical_name)
    .bind(&draft.brand)
    .bind(category_id)
    .bind(draft.base_unit.as_str())
    .bind(Json(&draft.variants))
    .bind(&draft.text_for_embedding)
    .bind(&draft.keywords)
    .bind(&draft.attributes)
    .bind(draft.is_generic_product)
    .bind(start)
    .bind(end)
    .bind(fingerprint)
    .bind(Vector::from(embedding))
    .fetch_optional(conn)
    .await
}
