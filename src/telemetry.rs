//! Log setup shared by the batch binaries.
use tracing::Span;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::util::env::env_flag;

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`;
/// `LOG_ANSI=0` drops colour codes when output goes to cron mail or a file.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_env_filter(filter)
        .with_ansi(env_flag("LOG_ANSI", true))
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

/// Span around one pool run, so every worker event carries job and run id.
pub fn run_span(job: &str, run: Uuid) -> Span {
    tracing::info_span!("run", job, run = %run)
}
