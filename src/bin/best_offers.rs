use anyhow::Result;
use basket_normalizer::cli::{run_job, RunArgs};
use basket_normalizer::pipeline::BestOfferJob;
use basket_normalizer::telemetry::init_tracing;
use basket_normalizer::util::env::bootstrap_cli;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "best_offers",
    version,
    about = "Fold new unit prices into each product's best and in-season offer"
)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    bootstrap_cli("best_offers");
    let cli = Cli::parse();

    let db = cli.run.connect().await?;
    let summary = run_job(db, &cli.run, Arc::new(BestOfferJob::new())).await?;
    std::process::exit(summary.exit_code());
}
