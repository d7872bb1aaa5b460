use anyhow::Result;
use basket_normalizer::capability::{
    build_embedder, build_normalizer, AiConfig, EmbedderKind, NormalizerKind,
};
use basket_normalizer::cli::{run_job, RunArgs};
use basket_normalizer::normalization::barcode::BarcodeFilter;
use basket_normalizer::pipeline::GoldenRecordJob;
use basket_normalizer::telemetry::init_tracing;
use basket_normalizer::util::env::{bootstrap_cli, env_list, preflight_check};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "golden_records",
    version,
    about = "Build canonical product records from retailer SKUs sharing a barcode"
)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
    /// Text model used to merge the retailer variants
    #[arg(long, value_enum, default_value_t = NormalizerKind::Gemini)]
    normalizer_type: NormalizerKind,
    /// Model used for the search embedding
    #[arg(long, value_enum, default_value_t = EmbedderKind::Gemini)]
    embedder_type: EmbedderKind,
    /// Barcodes never sent to the providers (comma separated, added to NORMALIZER_SKIP_BARCODES)
    #[arg(long, value_delimiter = ',')]
    skip_barcodes: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,sqlx=warn")?;
    bootstrap_cli("golden_records");
    let cli = Cli::parse();

    preflight_check(
        "golden-records",
        &[],
        &[
            "GOOGLE_API_KEY",
            "XAI_API_KEY",
            "GEMINI_TEXT_MODEL",
            "GEMINI_EMBEDDING_MODEL",
            "GROK_TEXT_MODEL",
            "EMBEDDING_DIMS",
        ],
    )?;
    let ai = AiConfig::from_env();
    let normalizer = build_normalizer(cli.normalizer_type, &ai)?;
    let embedder = build_embedder(cli.embedder_type, &ai)?;
    let filter = BarcodeFilter::new(
        env_list("NORMALIZER_SKIP_BARCODES")
            .into_iter()
            .chain(cli.skip_barcodes.iter().cloned()),
    );
    info!(
        normalizer = normalizer.name(),
        embedder = embedder.name(),
        dims = embedder.dims(),
        skipped_barcodes = filter.len(),
        "providers ready"
    );

    let db = cli.run.connect().await?;
    let job = Arc::new(GoldenRecordJob::new(normalizer, embedder, filter));
    let summary = run_job(db, &cli.run, job).await?;
    std::process::exit(summary.exit_code());
}
