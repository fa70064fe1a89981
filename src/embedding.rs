//! Query and passage embedding providers.
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `disabled` | No dense retrieval; queries carry an empty vector |
//! | `hashing` | Offline feature hashing, see [`HashingEmbedder`] |
//! | `openai` | `POST https://api.openai.com/v1/embeddings` |
//! | `ollama` | `POST {url}/api/embed` |
//!
//! Use [`create_embedder`] to build the provider named in the config.

use anyhow::{bail, Result};
use async_trait::async_trait;
use harness_core::embedding::{HashingEmbedder, QueryEmbedder};
use harness_core::error::BackendError;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::http::{openai_api_key, JsonClient};

/// Embedder used when dense retrieval is switched off.
pub struct DisabledEmbedder;

#[async_trait]
impl QueryEmbedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(vec![Vec::new(); texts.len()])
    }
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: JsonClient,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = openai_api_key()?;
        let client = JsonClient::new("openai embeddings", config.timeout_secs, config.max_retries)?;
        Ok(Self {
            model,
            dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl QueryEmbedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let resp: OpenAiEmbeddingResponse = self
            .client
            .post("https://api.openai.com/v1/embeddings", &body, Some(&self.api_key))
            .await?;
        let mut data = resp.data;
        // Sort by index to ensure order matches input
        data.sort_by_key(|d| d.index);
        check_batch(texts.len(), self.dims, data.into_iter().map(|d| d.embedding).collect())
    }
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: JsonClient,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = JsonClient::new("ollama embeddings", config.timeout_secs, config.max_retries)?;
        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl QueryEmbedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let resp: OllamaEmbedResponse = self
            .client
            .post(&format!("{}/api/embed", self.url.trim_end_matches('/')), &body, None)
            .await?;
        check_batch(texts.len(), self.dims, resp.embeddings)
    }
}

fn check_batch(expected: usize, dims: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, BackendError> {
    if vectors.len() != expected {
        return Err(BackendError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(BackendError::InvalidResponse(format!(
            "expected {dims}-dimensional embeddings, got {}",
            bad.len()
        )));
    }
    Ok(vectors)
}

/// Build the embedding provider named by `embedding.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn QueryEmbedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hashing" => {
            let dims = config
                .dims
                .ok_or_else(|| anyhow::anyhow!("embedding.dims required for hashing provider"))?;
            Ok(Arc::new(HashingEmbedder::new(dims)))
        }
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_embedder_returns_empty_vectors() {
        let e = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(e.model_name(), "disabled");
        let out = e.embed(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(out, vec![Vec::<f32>::new(), Vec::new()]);
    }

    #[tokio::test]
    async fn test_hashing_provider_uses_configured_dims() {
        let config = EmbeddingConfig {
            provider: "hashing".into(),
            dims: Some(32),
            ..Default::default()
        };
        let e = create_embedder(&config).unwrap();
        let out = e.embed(&["kennel cough".into()]).await.unwrap();
        assert_eq!(out[0].len(), 32);
    }

    #[test]
    fn test_batch_size_mismatch_is_invalid() {
        let err = check_batch(2, 3, vec![vec![0.0; 3]]).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
