//! Google Gemini: `generateContent` for normalization, `embedContent` for vectors.
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::prompt::{extract_json, product_input, system_prompt, token_usage};
use super::{classify_status, with_retry, CapabilityError, Embedder, Normalizer, RetryPolicy};
use crate::normalization::record::{NormalizedRecord, RawVariant};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

async fn post_json(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &Value,
) -> Result<Value, CapabilityError> {
    let resp = client
        .post(url)
        .header("x-goog-api-key", api_key)
        .json(body)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let headers = resp.headers().clone();
        let text = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, &headers, text));
    }
    Ok(resp.json::<Value>().await?)
}

pub struct GeminiNormalizer {
    client: Client,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl GeminiNormalizer {
    pub fn new(client: Client, api_key: String, model: String, retry: RetryPolicy) -> Self {
        Self {
            client,
            api_key,
            model,
            retry,
        }
    }
}

/// Concatenated text parts of the first candidate.
fn candidate_text(resp: &Value) -> Result<String, CapabilityError> {
    if let Some(reason) = resp
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(CapabilityError::Malformed(format!("prompt blocked: {reason}")));
    }
    let parts = resp
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| CapabilityError::Malformed("no candidate content".to_string()))?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        return Err(CapabilityError::Malformed("empty candidate text".to_string()));
    }
    Ok(text)
}

#[async_trait]
impl Normalizer for GeminiNormalizer {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(skip(self, variants), fields(model = %self.model, variants = variants.len()))]
    async fn normalize(
        &self,
        barcode: &str,
        variants: &[RawVariant],
    ) -> Result<NormalizedRecord, CapabilityError> {
        let url = format!("{API_BASE}/models/{}:generateContent", self.model);
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system_prompt() }] },
            "contents": [{
                "role": "user",
                "parts": [{ "text": product_input(barcode, variants).to_string() }]
            }],
            "generationConfig": { "responseMimeType": "application/json" }
        });
        let resp = with_retry(&self.retry, "gemini.generateContent", || {
            post_json(&self.client, &url, &self.api_key, &body)
        })
        .await?;
        if let Some(usage) = resp.get("usageMetadata") {
            let (input_tokens, output_tokens) =
                token_usage(usage, "promptTokenCount", "candidatesTokenCount");
            debug!(input_tokens, output_tokens, "gemini usage");
        }
        let parsed = extract_json(&candidate_text(&resp)?)?;
        NormalizedRecord::from_value(&parsed).map_err(CapabilityError::Malformed)
    }
}

pub struct GeminiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    dims: usize,
    retry: RetryPolicy,
}

impl GeminiEmbedder {
    pub fn new(
        client: Client,
        api_key: String,
        model: String,
        dims: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            api_key,
            model,
            dims,
            retry,
        }
    }
}

fn embedding_values(resp: &Value, dims: usize) -> Result<Vec<f32>, CapabilityError> {
    let values = resp
        .pointer("/embedding/values")
        .and_then(Value::as_array)
        .ok_or_else(|| CapabilityError::Malformed("missing embedding.values".to_string()))?;
    let vec = values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| CapabilityError::Malformed("non-numeric embedding value".to_string()))?;
    if vec.len() != dims {
        return Err(CapabilityError::Malformed(format!(
            "embedding has {} dimensions, expected {dims}",
            vec.len()
        )));
    }
    Ok(vec)
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn name(&self) -> &str {
        "gemini"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    #[instrument(skip(self, text), fields(model = %self.model))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let url = format!("{API_BASE}/models/{}:embedContent", self.model);
        let body = json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
            "taskType": "RETRIEVAL_DOCUMENT",
            "outputDimensionality": self.dims,
        });
        let resp = with_retry(&self.retry, "gemini.embedContent", || {
            post_json(&self.client, &url, &self.api_key, &body)
        })
        .await?;
        embedding_values(&resp, self.dims)
    }
}
