// crates/engram-server/src/embeddings/ollama.rs
// Ollama embeddings via the OpenAI-compatible /v1/embeddings endpoint

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default Ollama embedding model
const DEFAULT_MODEL: &str = "nomic-embed-text";

/// Default dimensions for nomic-embed-text
const DEFAULT_DIMENSIONS: usize = 768;

/// Max characters to embed (conservative limit for local models)
const MAX_TEXT_CHARS: usize = 8192 * 4;

/// Max texts per batch request
pub const MAX_BATCH_SIZE: usize = 64;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Ollama embeddings client (no auth required)
pub struct OllamaEmbeddings {
    base_url: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: Option<String>, dimensions: Option<usize>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: dimensions.unwrap_or(DEFAULT_DIMENSIONS),
            http_client,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        result
            .pop()
            .context("embeddings response contained no vectors")
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > MAX_BATCH_SIZE {
            anyhow::bail!("batch of {} exceeds max {}", texts.len(), MAX_BATCH_SIZE);
        }

        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| {
                if t.len() > MAX_TEXT_CHARS {
                    &t[..t.char_indices().nth(MAX_TEXT_CHARS).map(|(i, _)| i).unwrap_or(t.len())]
                } else {
                    t.as_str()
                }
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .http_client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .context("ollama embeddings request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("ollama embeddings returned {status}: {detail}");
        }

        let parsed: EmbeddingResponse =
            response.json().await.context("malformed ollama response")?;
        debug!(count = parsed.data.len(), "embedded batch via Ollama");
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
