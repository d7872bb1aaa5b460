use anyhow::{Context, Result};
use basket_normalizer::database_ops::db::Db;
use basket_normalizer::telemetry::init_tracing;
use basket_normalizer::util::env::{bootstrap_cli, db_url, preflight_check};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

// Plain-file runner: every *.sql under the directory is applied once, in
// lexical order, and recorded in _sqlx_migrations.

#[derive(Parser, Debug)]
#[command(name = "db_migrate", version, about = "Apply pipeline schema migrations")]
struct Cli {
    /// Directory holding NNNN_name.sql files
    #[arg(long, default_value = "./migrations")]
    dir: PathBuf,
    /// Optional override for the database URL
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    bootstrap_cli("db_migrate");
    let cli = Cli::parse();

    if !cli.dir.is_dir() {
        error!(dir = ?cli.dir, "migrations directory not found");
        anyhow::bail!("migrations directory not found: {:?}", cli.dir);
    }

    let url = match cli.database_url {
        Some(url) => url,
        None => {
            preflight_check("db-migrate", &["DATABASE_URL"], &["DATABASE_URL"]).ok();
            db_url().context("no database URL (set DATABASE_URL or pass --database-url)")?
        }
    };
    let db = Db::connect(&url, 1).await?;

    info!(dir = ?cli.dir, "running migrations");
    let applied = Db::run_migrations(&db.pool, &cli.dir).await?;
    if applied.is_empty() {
        info!("schema already up to date");
    } else {
        info!(?applied, "migrations applied");
    }
    Ok(())
}
