// crates/engram-server/src/embeddings/openai.rs
// OpenAI embeddings API client

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Max characters to embed (truncate longer text)
const MAX_TEXT_CHARS: usize = 8000;

/// Max texts per batch request (OpenAI supports up to 2048)
pub const MAX_BATCH_SIZE: usize = 256;

/// HTTP timeout
const TIMEOUT_SECS: u64 = 30;

/// API endpoint
const API_URL: &str = "https://api.openai.com/v1/embeddings";

/// Supported embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenAiEmbeddingModel {
    /// text-embedding-3-small: 1536 dimensions (recommended)
    #[default]
    TextEmbedding3Small,
    /// text-embedding-3-large: 3072 dimensions
    TextEmbedding3Large,
}

impl OpenAiEmbeddingModel {
    pub fn model_name(&self) -> &'static str {
        match self {
            Self::TextEmbedding3Small => "text-embedding-3-small",
            Self::TextEmbedding3Large => "text-embedding-3-large",
        }
    }

    pub fn default_dimensions(&self) -> usize {
        match self {
            Self::TextEmbedding3Small => 1536,
            Self::TextEmbedding3Large => 3072,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "text-embedding-3-small" => Some(Self::TextEmbedding3Small),
            "text-embedding-3-large" => Some(Self::TextEmbedding3Large),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI embeddings client
pub struct OpenAiEmbeddings {
    api_key: String,
    model: OpenAiEmbeddingModel,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, model: OpenAiEmbeddingModel, dimensions: Option<usize>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            model,
            dimensions: dimensions.unwrap_or_else(|| model.default_dimensions()),
            http_client,
        }
    }

    pub fn model(&self) -> OpenAiEmbeddingModel {
        self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        result
            .pop()
            .context("embeddings response contained no vectors")
    }

    /// Embed multiple texts in one request
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > MAX_BATCH_SIZE {
            anyhow::bail!("batch of {} exceeds max {}", texts.len(), MAX_BATCH_SIZE);
        }

        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| truncate_chars(t, MAX_TEXT_CHARS))
            .collect();

        let body = serde_json::json!({
            "model": self.model.model_name(),
            "input": inputs,
            "dimensions": self.dimensions,
        });

        let response = self
            .http_client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("embeddings request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("embeddings API returned {status}: {detail}");
        }

        let parsed: EmbeddingResponse =
            response.json().await.context("malformed embeddings response")?;
        debug!(count = parsed.data.len(), "embedded batch via OpenAI");
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Truncate at a char boundary without splitting a codepoint.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_multibyte() {
        let s = "héllo wörld";
        assert_eq!(truncate_chars(s, 5), "héllo");
        assert_eq!(truncate_chars(s, 100), s);
    }

    #[test]
    fn test_model_names() {
        assert_eq!(
            OpenAiEmbeddingModel::from_name("text-embedding-3-small"),
            Some(OpenAiEmbeddingModel::TextEmbedding3Small)
        );
        assert_eq!(OpenAiEmbeddingModel::from_name("gpt-4"), None);
        assert_eq!(OpenAiEmbeddingModel::TextEmbedding3Small.default_dimensions(), 1536);
    }
}
