//! Flags and plumbing shared by the batch binaries.
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::database_ops::claim::{self, ClaimSpec};
use crate::database_ops::db::Db;
use crate::pipeline::{ClaimJob, PoolOptions, RunMetrics, RunSummary, Shutdown, WorkerPool};
use crate::util::env as env_util;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Concurrent workers; keep below the AI provider's rate limit
    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,
    /// Rows claimed per round trip
    #[arg(long, default_value_t = 50)]
    pub batch_size: i64,
    /// Seconds before an unfinished claim may be taken over by another run
    #[arg(long, default_value_t = 900)]
    pub lease_secs: u64,
    /// Stop after this many units (default: until nothing is pending)
    #[arg(long)]
    pub max_items: Option<u64>,
    /// Put previously failed rows back into the queue before starting
    #[arg(long, default_value_t = false)]
    pub requeue_failed: bool,
    /// Optional override for the database URL
    #[arg(long)]
    pub database_url: Option<String>,
    /// Push run metrics here when the run ends (default: PROMETHEUS_PUSHGATEWAY_URL)
    #[arg(long)]
    pub pushgateway_url: Option<String>,
}

impl RunArgs {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            workers: self.num_workers.max(1),
            batch_size: self.batch_size.max(1),
            lease: Duration::from_secs(self.lease_secs.max(1)),
            max_items: self.max_items,
        }
    }

    /// Pushgateway target, if metrics should be pushed at all.
    pub fn pushgateway(&self) -> Option<String> {
        self.pushgateway_url
            .clone()
            .or_else(|| env_util::env_opt("PROMETHEUS_PUSHGATEWAY_URL"))
    }

    /// Connect with enough pool slots for every worker plus bookkeeping.
    pub async fn connect(&self) -> Result<Db> {
        let url = match &self.database_url {
            Some(url) => url.clone(),
            None => env_util::db_url().context("resolving database URL")?,
        };
        let floor = u32::try_from(self.num_workers + 2).unwrap_or(u32::MAX);
        let max_connections = env_util::env_parse("DB_MAX_CONNECTIONS", floor).max(floor);
        Db::connect(&url, max_connections).await
    }
}

/// Shared body of every batch binary: optional requeue, run the pool with
/// Ctrl-C handling, push metrics, print the summary line.
pub async fn run_job(db: Db, args: &RunArgs, job: Arc<dyn ClaimJob>) -> Result<RunSummary> {
    if args.requeue_failed {
        requeue(&db, job.spec()).await?;
    }
    let shutdown = Shutdown::new();
    shutdown.listen_ctrl_c();
    let mut pool = WorkerPool::new(db, args.pool_options(), shutdown);
    let gateway = args.pushgateway();
    let metrics = if gateway.is_some() {
        Some(RunMetrics::new().context("registering run metrics")?)
    } else {
        None
    };
    if let Some(m) = &metrics {
        pool = pool.with_metrics(m.clone());
    }
    let summary = pool.run(job.clone()).await?;
    if let (Some(m), Some(url)) = (&metrics, &gateway) {
        // Push failures are logged only.
        match m.push(url, job.name(), pool.owner()).await {
            Ok(()) => info!(gateway = %url, "metrics pushed"),
            Err(e) => warn!(gateway = %url, error = %format!("{e:#}"), "could not push metrics"),
        }
    }
    println!("{summary}");
    Ok(summary)
}

async fn requeue(db: &Db, spec: &ClaimSpec) -> Result<()> {
    let n = claim::requeue_failed(db, spec).await?;
    info!(table = spec.table, requeued = n, "failed rows re-enqueued");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn defaults_and_overrides() {
        let cli = TestCli::parse_from(["bin"]);
        let opts = cli.run.pool_options();
        assert_eq!(opts.workers, 4);
        assert_eq!(opts.batch_size, 50);
        assert_eq!(opts.lease, Duration::from_secs(900));
        assert_eq!(opts.max_items, None);
        assert_eq!(cli.run.pushgateway_url, None);

        let cli = TestCli::parse_from([
            "bin",
            "--num-workers",
            "0",
            "--batch-size",
            "10",
            "--max-items",
            "25",
            "--requeue-failed",
            "--pushgateway-url",
            "http://pushgateway:9091",
        ]);
        let opts = cli.run.pool_options();
        assert_eq!(opts.workers, 1);
        assert_eq!(opts.batch_size, 10);
        assert_eq!(opts.max_items, Some(25));
        assert!(cli.run.requeue_failed);
        assert_eq!(cli.run.pushgateway().as_deref(), Some("http://pushgateway:9091"));
    }
}
