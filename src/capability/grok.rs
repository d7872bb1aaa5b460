//! xAI Grok over its OpenAI-compatible chat completions endpoint. The model
//! has no JSON response mode, so the object is extracted from the reply text.
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::prompt::{extract_json, product_input, system_prompt, token_usage};
use super::{classify_status, with_retry, CapabilityError, Normalizer, RetryPolicy};
use crate::normalization::record::{NormalizedRecord, RawVariant};

const CHAT_URL: &str = "https://api.x.ai/v1/chat/completions";

pub struct GrokNormalizer {
    client: Client,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl GrokNormalizer {
    pub fn new(client: Client, api_key: String, model: String, retry: RetryPolicy) -> Self {
        Self {
            client,
            api_key,
            model,
            retry,
        }
    }

    async fn chat(&self, body: &Value) -> Result<Value, CapabilityError> {
        let resp = self
            .client
            .post(CHAT_URL)
            .bearer_auth(&self.api_key)
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
}

fn message_content(resp: &Value) -> Result<&str, CapabilityError> {
    let choice = resp
        .pointer("/choices/0")
        .ok_or_else(|| CapabilityError::Malformed("no choices in reply".to_string()))?;
    if choice.get("finish_reason").and_then(Value::as_str) == Some("length") {
        return Err(CapabilityError::Malformed("reply truncated at token limit".to_string()));
    }
    choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| CapabilityError::Malformed("empty message content".to_string()))
}

#[async_trait]
impl Normalizer for GrokNormalizer {
    fn name(&self) -> &str {
        "grok"
    }

    #[instrument(skip(self, variants), fields(model = %self.model, variants = variants.len()))]
    async fn normalize(
        &self,
        barcode: &str,
        variants: &[RawVariant],
    ) -> Result<NormalizedRecord, CapabilityError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt() },
                { "role": "user", "content": product_input(barcode, variants).to_string() }
            ],
            "stream": false
        });
        let resp = with_retry(&self.retry, "grok.chat", || self.chat(&body)).await?;
        if let Some(usage) = resp.get("usage") {
            let (input_tokens, output_tokens) =
                token_usage(usage, "prompt_tokens", "completion_tokens");
            debug!(input_tokens, output_tokens, "grok usage");
        }
        let parsed = extract_json(message_content(&resp)?)?;
        NormalizedRecord::from_value(&parsed).map_err(CapabilityError::Malformed)
    }
}
