// crates/engram-server/src/embeddings/mod.rs
// Embedding provider module

mod ollama;
mod openai;

pub use self::ollama::OllamaEmbeddings;
pub use self::openai::{OpenAiEmbeddingModel, OpenAiEmbeddings};

use crate::config::Config;
use anyhow::Result;
use tracing::info;

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Ollama(OllamaEmbeddings),
}

/// Embedding client with automatic provider selection
///
/// Priority: OpenAI (highest quality) > Ollama (local, no key needed)
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// Provider identifier for logging and health output
    pub fn provider_id(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => "openai",
            EmbeddingBackend::Ollama(_) => "ollama",
        }
    }

    /// Create a client from the loaded configuration.
    ///
    /// `auto` picks OpenAI when a key is configured, else Ollama when a
    /// host is, else none; naming a provider explicitly requires its
    /// credentials.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        match config.providers.embed.as_str() {
            "openai" => match config.openai_api_key.as_ref() {
                Some(key) => Ok(Some(Self::openai(key.clone(), config))),
                None => anyhow::bail!("embed provider 'openai' requires ENGRAM_OPENAI_API_KEY"),
            },
            "ollama" => match config.ollama_host.as_ref() {
                Some(host) => Ok(Some(Self::ollama(host.clone(), config))),
                None => anyhow::bail!("embed provider 'ollama' requires ENGRAM_OLLAMA_HOST"),
            },
            "none" => Ok(None),
            "auto" => {
                if let Some(key) = config.openai_api_key.as_ref() {
                    Ok(Some(Self::openai(key.clone(), config)))
                } else if let Some(host) = config.ollama_host.as_ref() {
                    Ok(Some(Self::ollama(host.clone(), config)))
                } else {
                    Ok(None)
                }
            }
            other => anyhow::bail!("unknown embed provider {other:?}"),
        }
    }

    fn openai(api_key: String, config: &Config) -> Self {
        info!("Using OpenAI embeddings (text-embedding-3-small)");
        Self {
            backend: EmbeddingBackend::OpenAi(OpenAiEmbeddings::new(
                api_key,
                OpenAiEmbeddingModel::default(),
                Some(config.embed_dimensions),
            )),
        }
    }

    fn ollama(host: String, config: &Config) -> Self {
        let client = OllamaEmbeddings::new(host, None, Some(config.embed_dimensions));
        info!(
            model = client.model_name(),
            dimensions = client.dimensions(),
            "Using Ollama embeddings"
        );
        Self { backend: EmbeddingBackend::Ollama(client) }
    }

    /// Get embedding dimensions. The vector index pins its tables to this
    /// and rejects mixed-dimension writes.
    pub fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Ollama(c) => c.dimensions(),
        }
    }

    /// Get model name for display/logging
    pub fn model_name(&self) -> String {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.model().model_name().to_string(),
            EmbeddingBackend::Ollama(c) => c.model_name().to_string(),
        }
    }

    /// Provider-appropriate sub-batch size for the background indexer.
    pub fn batch_size(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => openai::MAX_BATCH_SIZE,
            EmbeddingBackend::Ollama(_) => ollama::MAX_BATCH_SIZE,
        }
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed(text).await,
            EmbeddingBackend::Ollama(c) => c.embed(text).await,
        }
    }

    /// Embed a search query (same encoder; separate entry point so a
    /// query-specific model can slot in later)
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query).await
    }

    /// Embed multiple texts in batch
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed_batch(texts).await,
            EmbeddingBackend::Ollama(c) => c.embed_batch(texts).await,
        }
    }
}
