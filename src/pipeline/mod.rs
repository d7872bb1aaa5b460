//! Shared orchestration for the three batch jobs.
//!
//! A run owns a random id. N workers loop claim -> process -> commit until the
//! claim comes back empty, the item budget is spent, or shutdown is requested.
//! Per-row failures are recorded on the row and counted; only lost database
//! connectivity stops the run.
pub mod best_offer;
pub mod golden;
pub mod metrics;
pub mod pricing;

use anyhow::Result;
use futures::future::join_all;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::database_ops::claim::{self, ClaimSpec};
use crate::database_ops::db::{is_connectivity_error, Db};
use crate::error::RowError;
use crate::telemetry::run_span;

pub use best_offer::BestOfferJob;
pub use golden::GoldenRecordJob;
pub use metrics::RunMetrics;
pub use pricing::UnitPriceJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Nothing to do, or another worker got there first.
    Skipped,
}

/// One kind of unit of work. `process` owns the claim's completion: it must
/// call [`claim::complete`] inside the same transaction as its writes and
/// return `Skipped` (after rolling back) when the claim was lost.
#[async_trait::async_trait]
pub trait ClaimJob: Send + Sync {
    fn name(&self) -> &'static str;
    fn spec(&self) -> &'static ClaimSpec;
    async fn process(&self, db: &Db, owner: Uuid, id: i64) -> Result<Outcome, RowError>;
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    pub batch_size: i64,
    pub lease: Duration,
    pub max_items: Option<u64>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 50,
            lease: Duration::from_secs(900),
            max_items: None,
        }
    }
}

/// Cooperative stop flag, flipped by Ctrl-C or by a fatal error.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Request shutdown on the first Ctrl-C. In-flight rows finish; unstarted
    /// claims are released when the pool winds down.
    pub fn listen_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight rows");
                flag.request();
            }
        });
    }
}

/// Caps the total number of units a run may claim.
#[derive(Debug)]
struct Budget(Option<AtomicU64>);

impl Budget {
    fn new(max: Option<u64>) -> Self {
        Self(max.map(AtomicU64::new))
    }

    fn take(&self, want: u64) -> u64 {
        match &self.0 {
            None => want,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| {
                    Some(l.saturating_sub(want))
                })
                .map(|prev| prev.min(want))
                .unwrap_or(0),
        }
    }

    fn give_back(&self, n: u64) {
        if let Some(left) = &self.0 {
            left.fetch_add(n, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Default)]
pub struct RunCounters {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub job: &'static str,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub interrupted: bool,
    /// Set when the run stopped on an unrecoverable error.
    pub fatal: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run complete: job={} processed={} failed={} skipped={}",
            self.job, self.processed, self.failed, self.skipped
        )?;
        if self.interrupted {
            f.write_str(" interrupted=true")?;
        }
        if let Some(reason) = &self.fatal {
            write!(f, " fatal={reason:?}")?;
        }
        Ok(())
    }
}

struct RunState {
    counters: RunCounters,
    budget: Budget,
    fatal: Mutex<Option<String>>,
    shutdown: Shutdown,
    metrics: Option<RunMetrics>,
}

impl RunState {
    fn record_fatal(&self, reason: String) {
        error!(error = %reason, "unrecoverable error, stopping run");
        if let Ok(mut slot) = self.fatal.lock() {
            slot.get_or_insert(reason);
        }
        self.shutdown.request();
    }
}

pub struct WorkerPool {
    db: Db,
    opts: PoolOptions,
    owner: Uuid,
    shutdown: Shutdown,
    metrics: Option<RunMetrics>,
}

impl WorkerPool {
    pub fn new(db: Db, opts: PoolOptions, shutdown: Shutdown) -> Self {
        Self {
            db,
            opts,
            owner: Uuid::new_v4(),
            shutdown,
            metrics: None,
        }
    }

    /// Record per-item outcomes, timings and batch sizes into `metrics`.
    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Claim owner id of this run.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub async fn run(&self, job: Arc<dyn ClaimJob>) -> Result<RunSummary> {
        let workers = self.opts.workers.max(1);
        info!(
            job = job.name(),
            run = %self.owner,
            workers,
            batch_size = self.opts.batch_size,
            max_items = ?self.opts.max_items,
            "run starting"
        );
        let state = Arc::new(RunState {
            counters: RunCounters::default(),
            budget: Budget::new(self.opts.max_items),
            fatal: Mutex::new(None),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        });

        let span = run_span(job.name(), self.owner);
        let mut tasks = Vec::with_capacity(workers);
        for worker in 0..workers {
            let db = self.db.clone();
            let job = job.clone();
            let state = state.clone();
            let opts = self.opts.clone();
            let owner = self.owner;
            tasks.push(tokio::spawn(
                async move { worker_loop(worker, &db, job.as_ref(), &state, &opts, owner).await }
                    .instrument(span.clone()),
            ));
        }
        for res in join_all(tasks).await {
            if let Err(join_err) = res {
                state.record_fatal(format!("worker task failed: {join_err}"));
            }
        }

        match claim::release_owned(&self.db, job.spec(), self.owner).await {
            Ok(0) => {}
            Ok(n) => info!(job = job.name(), released = n, "released unfinished claims"),
            Err(e) => warn!(job = job.name(), error = %e, "could not release claims; they expire with the lease"),
        }

        let c = &state.counters;
        let fatal = state.fatal.lock().ok().and_then(|f| f.clone());
        let summary = RunSummary {
            job: job.name(),
            processed: c.processed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            skipped: c.skipped.load(Ordering::SeqCst),
            interrupted: fatal.is_none() && self.shutdown.is_requested(),
            fatal,
        };
        if let Some(m) = &self.metrics {
            m.run_finished(&summary);
        }
        info!(%summary, "run finished");
        Ok(summary)
    }
}

async fn worker_loop(
    worker: usize,
    db: &Db,
    job: &dyn ClaimJob,
    state: &RunState,
    opts: &PoolOptions,
    owner: Uuid,
) {
    let spec = job.spec();
    let batch = u64::try_from(opts.batch_size.max(1)).unwrap_or(1);
    while !state.shutdown.is_requested() {
        let want = state.budget.take(batch);
        if want == 0 {
            debug!(worker, "item budget spent");
            break;
        }
        let ids = match claim::claim_batch(db, spec, owner, want as i64, opts.lease).await {
            Ok(ids) => ids,
            Err(e) => {
                state.record_fatal(format!("claim on {} failed: {e:#}", spec.table));
                break;
            }
        };
        state.budget.give_back(want - ids.len() as u64);
        if ids.is_empty() {
            debug!(worker, "nothing left to claim");
            break;
        }
        debug!(worker, claimed = ids.len(), "processing batch");
        if let Some(m) = &state.metrics {
            m.batch_claimed(job.name(), ids.len());
        }
        for id in ids {
            if state.shutdown.is_requested() {
                break;
            }
            handle_one(db, job, state, owner, id).await;
        }
    }
}

async fn handle_one(db: &Db, job: &dyn ClaimJob, state: &RunState, owner: Uuid, id: i64) {
    let spec = job.spec();
    let c = &state.counters;
    let started = Instant::now();
    let result = job.process(db, owner, id).await;
    let elapsed = started.elapsed();
    let outcome = match &result {
        Ok(Outcome::Processed) => {
            c.processed.fetch_add(1, Ordering::Relaxed);
            "processed"
        }
        Ok(Outcome::Skipped) => {
            c.skipped.fetch_add(1, Ordering::Relaxed);
            "skipped"
        }
        Err(e) if e.is_fatal() => {
            state.record_fatal(e.to_string());
            "fatal"
        }
        Err(e) if e.is_benign_conflict() => {
            debug!(job = job.name(), id, "concurrent writer won, releasing");
            c.skipped.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = claim::release(&db.pool, spec, owner, id).await {
                fatal_if_gone(state, err);
            }
            "skipped"
        }
        Err(e) => {
            warn!(job = job.name(), id, kind = e.kind(), error = %e, "row failed");
            c.failed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = claim::fail(&db.pool, spec, owner, id, &e.to_string()).await {
                fatal_if_gone(state, err);
            }
            "failed"
        }
    };
    if let Some(m) = &state.metrics {
        m.item_finished(job.name(), outcome, elapsed);
        if let Err(e) = &result {
            if !e.is_benign_conflict() {
                m.item_error(job.name(), e.kind());
            }
        }
    }
}

fn fatal_if_gone(state: &RunState, err: sqlx::Error) {
    if is_connectivity_error(&err) {
        state.record_fatal(err.to_string());
    } else {
        warn!(error = %err, "could not record row outcome");
    }
}
