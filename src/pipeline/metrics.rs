//! Prometheus metrics for one pool run, pushed to a Pushgateway when the run
//! ends (batch jobs live too briefly to be scraped).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `basket_items_total` | Counter | `pipeline`, `outcome` |
//! | `basket_item_errors_total` | Counter | `pipeline`, `kind` |
//! | `basket_batch_size` | Gauge | `pipeline` |
//! | `basket_item_duration_seconds` | Histogram | `pipeline` |
//! | `basket_run_exit_code` | Gauge | `pipeline` |
//!
//! The label is `pipeline` rather than `job`: the Pushgateway owns `job`.
use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::RunSummary;

/// Seconds per unit of work. AI-backed golden records sit at the top end.
pub const ITEM_DURATION_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0];

#[derive(Clone)]
pub struct RunMetrics {
    registry: Registry,
    items_total: IntCounterVec,
    errors_total: IntCounterVec,
    batch_size: IntGaugeVec,
    item_duration: HistogramVec,
    exit_code: IntGaugeVec,
}

impl RunMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let items_total = IntCounterVec::new(
            Opts::new("basket_items_total", "Units of work finished, by outcome"),
            &["pipeline", "outcome"],
        )?;
        registry.register(Box::new(items_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("basket_item_errors_total", "Per-row failures, by error kind"),
            &["pipeline", "kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let batch_size = IntGaugeVec::new(
            Opts::new("basket_batch_size", "Rows in the most recently claimed batch"),
            &["pipeline"],
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let item_duration = HistogramVec::new(
            HistogramOpts::new(
                "basket_item_duration_seconds",
                "Time spent processing one unit of work",
            )
            .buckets(ITEM_DURATION_BUCKETS.to_vec()),
            &["pipeline"],
        )?;
        registry.register(Box::new(item_duration.clone()))?;

        let exit_code = IntGaugeVec::new(
            Opts::new("basket_run_exit_code", "Exit code of the finished run"),
            &["pipeline"],
        )?;
        registry.register(Box::new(exit_code.clone()))?;

        Ok(Self {
            registry,
            items_total,
            errors_total,
            batch_size,
            item_duration,
            exit_code,
        })
    }

    pub fn item_finished(&self, job: &str, outcome: &str, elapsed: Duration) {
        self.items_total.with_label_values(&[job, outcome]).inc();
        self.item_duration
            .with_label_values(&[job])
            .observe(elapsed.as_secs_f64());
    }

    pub fn item_error(&self, job: &str, kind: &str) {
        self.errors_total.with_label_values(&[job, kind]).inc();
    }

    pub fn batch_claimed(&self, job: &str, rows: usize) {
        self.batch_size
            .with_label_values(&[job])
            .set(i64::try_from(rows).unwrap_or(i64::MAX));
    }

    pub fn run_finished(&self, summary: &RunSummary) {
        self.exit_code
            .with_label_values(&[summary.job])
            .set(i64::from(summary.exit_code()));
    }

    pub fn item_count(&self, job: &str, outcome: &str) -> u64 {
        self.items_total.with_label_values(&[job, outcome]).get()
    }

    pub fn error_count(&self, job: &str, kind: &str) -> u64 {
        self.errors_total.with_label_values(&[job, kind]).get()
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics text is not utf-8")
    }

    /// Replace this run's group on the Pushgateway. Grouped by run id so
    /// overlapping runs of the same job do not overwrite each other.
    pub async fn push(&self, gateway: &str, job: &str, run: Uuid) -> Result<()> {
        let families = self.registry.gather();
        let gateway = gateway.to_string();
        let job = job.to_string();
        let grouping = HashMap::from([("run".to_string(), run.to_string())]);
        // The push client is blocking.
        tokio::task::spawn_blocking(move || {
            prometheus::push_metrics(&job, grouping, &gateway, families, None)
        })
        .await
        .context("pushgateway task failed")?
        .context("pushing metrics to the Pushgateway")
    }
}
