use anyhow::Result;
use basket_normalizer::cli::{run_job, RunArgs};
use basket_normalizer::database_ops::golden_prices::prune_stale_prices;
use basket_normalizer::pipeline::UnitPriceJob;
use basket_normalizer::telemetry::init_tracing;
use basket_normalizer::util::env::bootstrap_cli;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "unit_prices",
    version,
    about = "Convert shelf prices into per-kg, per-l and per-piece prices"
)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
    /// Delete normalized prices older than this many days before running
    #[arg(long)]
    prune_older_than_days: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    bootstrap_cli("unit_prices");
    let cli = Cli::parse();

    let db = cli.run.connect().await?;
    if let Some(days) = cli.prune_older_than_days {
        let removed = prune_stale_prices(&db, days).await?;
        info!(days, removed, "pruned stale normalized prices");
    }
    let summary = run_job(db, &cli.run, Arc::new(UnitPriceJob::new())).await?;
    std::process::exit(summary.exit_code());
}
