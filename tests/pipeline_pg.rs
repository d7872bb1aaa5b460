//! End-to-end runs of the three batch jobs against a scratch Postgres.
//!
//! Needs TEST_DATABASE_URL pointing at a throwaway database with pgvector
//! installed; every table is truncated. Without it the tests return early.

use async_trait::async_trait;
use basket_normalizer::capability::{CapabilityError, Embedder, Normalizer};
use basket_normalizer::database_ops::claim::{self, BARCODES};
use basket_normalizer::database_ops::db::Db;
use basket_normalizer::database_ops::golden_prices::prune_stale_prices;
use basket_normalizer::normalization::barcode::BarcodeFilter;
use basket_normalizer::normalization::record::{NormalizedRecord, RawVariant};
use basket_normalizer::pipeline::{
    BestOfferJob, ClaimJob, GoldenRecordJob, PoolOptions, RunMetrics, RunSummary, Shutdown,
    UnitPriceJob, WorkerPool,
};
use bigdecimal::BigDecimal;
use chrono::{Days, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

// Tests share one database.
static SERIAL: Mutex<()> = Mutex::const_new(());

async fn scratch_db() -> Option<Db> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return None;
    };
    let db = Db::connect(&url, 8).await.expect("connect");
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    Db::run_migrations(&db.pool, &dir).await.expect("migrate");
    sqlx::raw_sql(
        "TRUNCATE best_offers, aggregation_queue, golden_prices, golden_products, categories, \
         prices, chain_products, products, stores RESTART IDENTITY CASCADE",
    )
    .execute(&db.pool)
    .await
    .expect("truncate");
    Some(db)
}

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn store(db: &Db, code: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO stores (chain_code, code) VALUES ('konzum', $1) RETURNING id")
        .bind(code)
        .fetch_one(&db.pool)
        .await
        .unwrap()
}

async fn barcode(db: &Db, code: &str) -> i64 {
    sqlx::query_scalar("INSERT INTO products (barcode) VALUES ($1) RETURNING id")
        .bind(code)
        .fetch_one(&db.pool)
        .await
        .unwrap()
}

async fn sku(
    db: &Db,
    product_id: i64,
    code: &str,
    name: &str,
    quantity: Option<&str>,
    unit: Option<&str>,
) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO chain_products (product_id, chain_code, code, name, quantity, unit) \
         VALUES ($1, 'konzum', $2, $3, $4, $5) RETURNING id",
    )
    .bind(product_id)
    .bind(code)
    .bind(name)
    .bind(quantity)
    .bind(unit)
    .fetch_one(&db.pool)
    .await
    .unwrap()
}

async fn price(db: &Db, sku_id: i64, store_id: i64, date: NaiveDate, regular: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO prices (chain_product_id, store_id, price_date, regular_price) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(sku_id)
    .bind(store_id)
    .bind(date)
    .bind(dec(regular))
    .fetch_one(&db.pool)
    .await
    .unwrap()
}

async fn golden_id(db: &Db, code: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT id FROM golden_products WHERE barcode = $1")
        .bind(code)
        .fetch_optional(&db.pool)
        .await
        .unwrap()
}

async fn best(db: &Db, product_id: i64, column: &str) -> (Option<BigDecimal>, Option<i64>) {
    let sql = format!(
        "SELECT {column}, best_price_store_id FROM best_offers WHERE product_id = $1"
    );
    sqlx::query_as(&sql)
        .bind(product_id)
        .fetch_optional(&db.pool)
        .await
        .unwrap()
        .unwrap_or((None, None))
}

/// Answers from a fixed table keyed by barcode and counts the calls.
#[derive(Default)]
struct ScriptedNormalizer {
    responses: HashMap<String, Value>,
    calls: AtomicUsize,
}

impl ScriptedNormalizer {
    fn with(mut self, barcode: &str, response: Value) -> Self {
        self.responses.insert(barcode.to_string(), response);
        self
    }
}

#[async_trait]
impl Normalizer for ScriptedNormalizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn normalize(
        &self,
        barcode: &str,
        _variants: &[RawVariant],
    ) -> Result<NormalizedRecord, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let v = self
            .responses
            .get(barcode)
            .ok_or_else(|| CapabilityError::Malformed(format!("no script for {barcode}")))?;
        NormalizedRecord::from_value(v).map_err(CapabilityError::Malformed)
    }
}

struct FlatEmbedder;

#[async_trait]
impl Embedder for FlatEmbedder {
    fn name(&self) -> &str {
        "flat"
    }

    fn dims(&self) -> usize {
        768
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Ok(vec![0.01; 768])
    }
}

fn record(name: &str, base: &str, variants: Value) -> Value {
    json!({
        "canonical_name": name,
        "brand": "Zvijezda",
        "category": "Namirnice",
        "base_unit_type": base,
        "variants": variants,
        "text_for_embedding": format!("{name} iz trgovine"),
        "keywords": ["jedan", "dva", "tri", "četiri", "pet", "šest", "sedam", "osam"],
        "is_generic_product": false
    })
}

async fn run(db: &Db, job: Arc<dyn ClaimJob>) -> RunSummary {
    let opts = PoolOptions {
        workers: 2,
        batch_size: 5,
        ..PoolOptions::default()
    };
    let summary = WorkerPool::new(db.clone(), opts, Shutdown::new())
        .run(job)
        .await
        .expect("run");
    assert!(summary.is_success(), "{summary}");
    summary
}

fn golden_job(normalizer: Arc<ScriptedNormalizer>) -> Arc<dyn ClaimJob> {
    Arc::new(GoldenRecordJob::new(
        normalizer,
        Arc::new(FlatEmbedder),
        BarcodeFilter::default(),
    ))
}

#[tokio::test]
async fn oil_is_priced_per_liter_and_cheaper_store_wins() {
    let _serial = SERIAL.lock().await;
    let Some(db) = scratch_db().await else { return };

    let s = store(&db, "S").await;
    let t = store(&db, "T").await;
    let p = barcode(&db, "3858881234567").await;
    let oil = sku(&db, p, "k-1", "Zvijezda ulje suncokretovo 1l", Some("1"), Some("l")).await;
    price(&db, oil, s, day(2025, 3, 1), "4.99").await;

    let normalizer = Arc::new(ScriptedNormalizer::default().with(
        "3858881234567",
        record("Suncokretovo ulje", "VOLUME", json!([{"unit": "l", "value": 1}])),
    ));
    assert_eq!(run(&db, golden_job(normalizer)).await.processed, 1);
    let gid = golden_id(&db, "3858881234567").await.expect("golden record");
    let base: String = sqlx::query_scalar("SELECT base_unit_type FROM golden_products WHERE id = $1")
        .bind(gid)
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(base, "VOLUME");

    assert_eq!(run(&db, Arc::new(UnitPriceJob::new())).await.processed, 1);
    let (per_l, per_kg): (Option<BigDecimal>, Option<BigDecimal>) = sqlx::query_as(
        "SELECT price_per_l, price_per_kg FROM golden_prices WHERE product_id = $1",
    )
    .bind(gid)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(per_l, Some(dec("4.99")));
    assert_eq!(per_kg, None);

    assert_eq!(run(&db, Arc::new(BestOfferJob::new())).await.processed, 1);
    assert_eq!(
        best(&db, gid, "best_unit_price_per_l").await,
        (Some(dec("4.99")), Some(s))
    );

    price(&db, oil, t, day(2025, 3, 2), "3.49").await;
    assert_eq!(run(&db, Arc::new(UnitPriceJob::new())).await.processed, 1);
    assert_eq!(run(&db, Arc::new(BestOfferJob::new())).await.processed, 1);
    assert_eq!(
        best(&db, gid, "best_unit_price_per_l").await,
        (Some(dec("3.49")), Some(t))
    );
}

#[tokio::test]
async fn three_retailer_names_fold_into_one_product_across_overlapping_runs() {
    let _serial = SERIAL.lock().await;
    let Some(db) = scratch_db().await else { return };

    let s = store(&db, "S").await;
    let t = store(&db, "T").await;
    let p = barcode(&db, "3858881234567").await;
    let first = sku(&db, p, "k-1", "Ulje X 1L", None, None).await;
    sku(&db, p, "k-2", "ULJE X, 1l", None, None).await;
    let third = sku(&db, p, "k-3", "Ulje X 1 litra", None, None).await;

    let normalizer = Arc::new(ScriptedNormalizer::default().with(
        "3858881234567",
        record("Ulje X", "VOLUME", json!([{"unit": "l", "value": 1}])),
    ));
    let (a, b) = tokio::join!(
        run(&db, golden_job(normalizer.clone())),
        run(&db, golden_job(normalizer.clone())),
    );
    assert_eq!(a.processed + b.processed, 1);
    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 1);
    let goldens: i64 = sqlx::query_scalar("SELECT count(*) FROM golden_products")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(goldens, 1);
    let unprocessed: i64 =
        sqlx::query_scalar("SELECT count(*) FROM chain_products WHERE NOT is_processed")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(unprocessed, 0);
    let gid = golden_id(&db, "3858881234567").await.expect("golden record");

    price(&db, first, s, day(2025, 3, 1), "4.99").await;
    price(&db, third, t, day(2025, 3, 2), "3.49").await;
    let (a, b) = tokio::join!(
        run(&db, Arc::new(UnitPriceJob::new())),
        run(&db, Arc::new(UnitPriceJob::new())),
    );
    assert_eq!(a.processed + b.processed, 2);

    let (a, b) = tokio::join!(
        run(&db, Arc::new(BestOfferJob::new())),
        run(&db, Arc::new(BestOfferJob::new())),
    );
    assert_eq!(a.processed + b.processed, 1);
    assert_eq!(
        best(&db, gid, "best_unit_price_per_l").await,
        (Some(dec("3.49")), Some(t))
    );
    assert_eq!(best(&db, gid, "lowest_price_in_season").await.0, None);
}

#[tokio::test]
async fn rerunning_on_unchanged_inputs_changes_nothing() {
    let _serial = SERIAL.lock().await;
    let Some(db) = scratch_db().await else { return };

    let s = store(&db, "S").await;
    let p = barcode(&db, "3850000000100").await;
    let flour = sku(&db, p, "k-2", "Brašno T-400 1 kg", Some("1"), Some("kg")).await;
    let price_id = price(&db, flour, s, day(2025, 4, 1), "1.19").await;

    let normalizer = Arc::new(ScriptedNormalizer::default().with(
        "3850000000100",
        record("Pšenično brašno T-400", "WEIGHT", json!([{"unit": "kg", "value": 1}])),
    ));
    run(&db, golden_job(normalizer.clone())).await;
    run(&db, Arc::new(UnitPriceJob::new())).await;
    run(&db, Arc::new(BestOfferJob::new())).await;
    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 1);

    // Same SKU imported again.
    sqlx::query("UPDATE chain_products SET is_processed = FALSE WHERE id = $1")
        .bind(flour)
        .execute(&db.pool)
        .await
        .unwrap();
    let again = run(&db, golden_job(normalizer.clone())).await;
    assert_eq!((again.processed, again.skipped), (0, 1));
    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 1);

    // Same observation replayed.
    sqlx::query("UPDATE prices SET claim_status = 'pending' WHERE id = $1")
        .bind(price_id)
        .execute(&db.pool)
        .await
        .unwrap();
    assert_eq!(run(&db, Arc::new(UnitPriceJob::new())).await.processed, 1);
    let dirty: i64 = sqlx::query_scalar("SELECT count(*) FROM golden_prices WHERE NOT aggregated")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(dirty, 0);
    assert_eq!(run(&db, Arc::new(BestOfferJob::new())).await.processed, 0);

    let gid = golden_id(&db, "3850000000100").await.unwrap();
    assert_eq!(
        best(&db, gid, "best_unit_price_per_kg").await,
        (Some(dec("1.19")), Some(s))
    );
}

#[tokio::test]
async fn unusable_quantities_are_parked_as_failed() {
    let _serial = SERIAL.lock().await;
    let Some(db) = scratch_db().await else { return };

    let s = store(&db, "S").await;
    let zero = barcode(&db, "3850000000001").await;
    sku(&db, zero, "k-3", "Sol", None, None).await;
    let multi = barcode(&db, "3850000000002").await;
    let biscuit = sku(&db, multi, "k-4", "Čajni keks", None, None).await;
    let price_id = price(&db, biscuit, s, day(2025, 5, 1), "2.20").await;

    let normalizer = Arc::new(
        ScriptedNormalizer::default()
            .with(
                "3850000000001",
                record("Morska sol", "WEIGHT", json!([{"unit": "g", "value": 0}])),
            )
            .with(
                "3850000000002",
                record(
                    "Čajni keks",
                    "WEIGHT",
                    json!([{"unit": "g", "value": 250}, {"unit": "g", "value": 500}]),
                ),
            ),
    );
    let summary = run(&db, golden_job(normalizer)).await;
    assert_eq!((summary.processed, summary.failed), (1, 1));
    assert_eq!(golden_id(&db, "3850000000001").await, None);
    let (status, error): (String, Option<String>) =
        sqlx::query_as("SELECT claim_status, last_error FROM products WHERE id = $1")
            .bind(zero)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert!(error.is_some());

    let metrics = RunMetrics::new().unwrap();
    let summary = WorkerPool::new(db.clone(), PoolOptions::default(), Shutdown::new())
        .with_metrics(metrics.clone())
        .run(Arc::new(UnitPriceJob::new()))
        .await
        .unwrap();
    assert_eq!((summary.processed, summary.failed), (0, 1));
    assert_eq!(metrics.item_count("unit_prices", "failed"), 1);
    assert_eq!(metrics.error_count("unit_prices", "unit_ambiguous"), 1);
    let status: String = sqlx::query_scalar("SELECT claim_status FROM prices WHERE id = $1")
        .bind(price_id)
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(status, "failed");
    let written: i64 = sqlx::query_scalar("SELECT count(*) FROM golden_prices")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(written, 0);
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
    let _serial = SERIAL.lock().await;
    let Some(db) = scratch_db().await else { return };

    for i in 0..20 {
        let p = barcode(&db, &format!("38510000000{i:02}")).await;
        sku(&db, p, &format!("c-{i}"), "Artikl", None, None).await;
    }
    let lease = Duration::from_secs(900);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (left, right) = tokio::join!(
        claim::claim_batch(&db, &BARCODES, a, 15, lease),
        claim::claim_batch(&db, &BARCODES, b, 15, lease),
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    let rest = claim::claim_batch(&db, &BARCODES, Uuid::new_v4(), 50, lease)
        .await
        .unwrap();
    let all: HashSet<i64> = left.iter().chain(&right).chain(&rest).copied().collect();
    assert_eq!(all.len(), left.len() + right.len() + rest.len());
    assert_eq!(all.len(), 20);
    assert!(!left.is_empty());
    assert!(claim::claim_batch(&db, &BARCODES, Uuid::new_v4(), 50, lease)
        .await
        .unwrap()
        .is_empty());

    // An expired lease can be taken over; the previous owner can no longer complete.
    let id = left[0];
    tokio::time::sleep(Duration::from_millis(20)).await;
    let c = Uuid::new_v4();
    let taken = claim::claim_batch(&db, &BARCODES, c, 50, Duration::ZERO)
        .await
        .unwrap();
    assert!(taken.contains(&id));
    assert!(!claim::complete(&db.pool, &BARCODES, a, id).await.unwrap());
    assert!(claim::complete(&db.pool, &BARCODES, c, id).await.unwrap());

    let released = claim::release_owned(&db, &BARCODES, c).await.unwrap();
    assert_eq!(released as usize, taken.len() - 1);
}

#[tokio::test]
async fn best_offer_only_rises_when_its_source_is_pruned() {
    let _serial = SERIAL.lock().await;
    let Some(db) = scratch_db().await else { return };

    let s = store(&db, "S").await;
    let t = store(&db, "T").await;
    let p = barcode(&db, "3850000000200").await;
    let eggs = sku(&db, p, "k-5", "Jaja M 10 kom", None, None).await;
    let recent = Utc::now().date_naive().checked_sub_days(Days::new(1)).unwrap();
    price(&db, eggs, s, day(2020, 1, 1), "2.50").await;

    let normalizer = Arc::new(ScriptedNormalizer::default().with(
        "3850000000200",
        record("Jaja M", "COUNT", json!([{"unit": "kom", "value": 10}])),
    ));
    run(&db, golden_job(normalizer)).await;
    run(&db, Arc::new(UnitPriceJob::new())).await;
    run(&db, Arc::new(BestOfferJob::new())).await;
    let gid = golden_id(&db, "3850000000200").await.unwrap();
    assert_eq!(
        best(&db, gid, "best_unit_price_per_piece").await,
        (Some(dec("0.25")), Some(s))
    );

    price(&db, eggs, t, recent, "3.00").await;
    run(&db, Arc::new(UnitPriceJob::new())).await;
    run(&db, Arc::new(BestOfferJob::new())).await;
    assert_eq!(
        best(&db, gid, "best_unit_price_per_piece").await,
        (Some(dec("0.25")), Some(s))
    );

    assert_eq!(prune_stale_prices(&db, 365).await.unwrap(), 1);
    assert_eq!(run(&db, Arc::new(BestOfferJob::new())).await.processed, 1);
    assert_eq!(
        best(&db, gid, "best_unit_price_per_piece").await,
        (Some(dec("0.30")), Some(t))
    );
}
