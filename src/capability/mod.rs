//! AI capabilities used by the golden record normalizer: a text normalizer that
//! turns raw retailer names into a structured record, and an embedder.
//!
//! Providers are chosen explicitly at startup ([`build_normalizer`],
//! [`build_embedder`]) and handed to the pipeline as trait objects.
pub mod gemini;
pub mod grok;
pub mod prompt;
pub mod retry;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::normalization::record::{NormalizedRecord, RawVariant};
use crate::util::env::{env_opt, env_parse};
pub use retry::{with_retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl CapabilityError {
    /// Timeouts, 5xx and 429 are worth another attempt; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapabilityError::Unavailable(_) | CapabilityError::RateLimited { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CapabilityError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CapabilityError::Malformed(e.to_string())
        } else {
            CapabilityError::Unavailable(e.to_string())
        }
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: String) -> CapabilityError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return CapabilityError::RateLimited { retry_after };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return CapabilityError::Unavailable(format!("status {status}: {body}"));
    }
    CapabilityError::Rejected {
        status: status.as_u16(),
        body: truncate(body, 512),
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[async_trait]
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &str;

    async fn normalize(
        &self,
        barcode: &str,
        variants: &[RawVariant],
    ) -> Result<NormalizedRecord, CapabilityError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector returned by [`Embedder::embed`].
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NormalizerKind {
    Gemini,
    Grok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    Gemini,
}

/// Provider credentials, models and call limits, read from the environment.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub google_api_key: Option<String>,
    pub gemini_text_model: String,
    pub gemini_embedding_model: String,
    pub embedding_dims: usize,
    pub xai_api_key: Option<String>,
    pub grok_text_model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            google_api_key: env_opt("GOOGLE_API_KEY"),
            gemini_text_model: env_opt("GEMINI_TEXT_MODEL")
                .unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            gemini_embedding_model: env_opt("GEMINI_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-004".to_string()),
            embedding_dims: env_parse("EMBEDDING_DIMS", 768usize),
            xai_api_key: env_opt("XAI_API_KEY"),
            grok_text_model: env_opt("GROK_TEXT_MODEL")
                .unwrap_or_else(|| "grok-3-mini".to_string()),
            timeout: Duration::from_secs(env_parse("AI_TIMEOUT_SECS", 30u64)),
            retry: RetryPolicy {
                max_retries: env_parse("AI_MAX_RETRIES", 4u32),
                base_delay: Duration::from_millis(env_parse("AI_BACKOFF_MS", 500u64)),
                ..RetryPolicy::default()
            },
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("basket-normalizer/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }
}

pub fn build_normalizer(kind: NormalizerKind, cfg: &AiConfig) -> Result<Arc<dyn Normalizer>> {
    let client = cfg.http_client()?;
    let normalizer: Arc<dyn Normalizer> = match kind {
        NormalizerKind::Gemini => {
            let key = cfg
                .google_api_key
                .clone()
                .ok_or_else(|| anyhow!("GOOGLE_API_KEY is required for the gemini normalizer"))?;
            Arc::new(gemini::GeminiNormalizer::new(
                client,
                key,
                cfg.gemini_text_model.clone(),
                cfg.retry,
            ))
        }
        NormalizerKind::Grok => {
            let key = cfg
                .xai_api_key
                .clone()
                .ok_or_else(|| anyhow!("XAI_API_KEY is required for the grok normalizer"))?;
            Arc::new(grok::GrokNormalizer::new(
                client,
                key,
                cfg.grok_text_model.clone(),
                cfg.retry,
            ))
        }
    };
    Ok(normalizer)
}

pub fn build_embedder(kind: EmbedderKind, cfg: &AiConfig) -> Result<Arc<dyn Embedder>> {
    let client = cfg.http_client()?;
    let embedder: Arc<dyn Embedder> = match kind {
        EmbedderKind::Gemini => {
            let key = cfg
                .google_api_key
                .clone()
                .ok_or_else(|| anyhow!("GOOGLE_API_KEY is required for the gemini embedder"))?;
            Arc::new(gemini::GeminiEmbedder::new(
                client,
                key,
                cfg.gemini_embedding_model.clone(),
                cfg.embedding_dims,
                cfg.retry,
            ))
        }
    };
    Ok(embedder)
}
