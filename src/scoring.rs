//! Re-ranking and claim verification model clients.
//!
//! Both stages default to the offline lexical scorers from the core; the
//! `http` providers delegate to hosted models:
//!
//! - cross-encoder: `POST {url}/rerank {query, passages}` → `{scores}`
//! - verifier: `POST {url}/score {claim, evidence}` → `{score}`

use anyhow::{bail, Result};
use async_trait::async_trait;
use harness_core::error::BackendError;
use harness_core::factuality::{LexicalVerifier, Verifier};
use harness_core::rerank::{CrossEncoder, LexicalCrossEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{RerankConfig, VerifierConfig};
use crate::http::JsonClient;

pub struct HttpCrossEncoder {
    url: String,
    client: JsonClient,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    passages: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

impl HttpCrossEncoder {
    /// No client-side retries: the orchestrator's time slice bounds this call.
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let timeout_secs = timeout_ms.div_ceil(1000).max(1);
        Ok(Self {
            url: url.into(),
            client: JsonClient::new("cross-encoder", timeout_secs, 0)?,
        })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    fn name(&self) -> &str {
        "http"
    }
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, BackendError> {
        let resp: RerankResponse = self
            .client
            .post(
                &format!("{}/rerank", self.url.trim_end_matches('/')),
                &RerankRequest { query, passages },
                None,
            )
            .await?;
        if resp.scores.len() != passages.len() {
            return Err(BackendError::InvalidResponse(format!(
                "expected {} rerank scores, got {}",
                passages.len(),
                resp.scores.len()
            )));
        }
        Ok(resp.scores)
    }
}

pub struct HttpVerifier {
    url: String,
    client: JsonClient,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    claim: &'a str,
    evidence: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f32,
}

impl HttpVerifier {
    pub fn new(config: &VerifierConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("verifier.url required for http provider"))?;
        Ok(Self {
            url,
            client: JsonClient::new("verifier", config.timeout_secs, config.max_retries)?,
        })
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    fn name(&self) -> &str {
        "http"
    }
    async fn score(&self, claim: &str, evidence: &str) -> Result<f32, BackendError> {
        let resp: ScoreResponse = self
            .client
            .post(
                &format!("{}/score", self.url.trim_end_matches('/')),
                &ScoreRequest { claim, evidence },
                None,
            )
            .await?;
        if !resp.score.is_finite() {
            return Err(BackendError::InvalidResponse("non-finite verifier score".into()));
        }
        Ok(resp.score.clamp(0.0, 1.0))
    }
}

pub fn create_cross_encoder(config: &RerankConfig) -> Result<Arc<dyn CrossEncoder>> {
    match config.provider.as_str() {
        "lexical" => Ok(Arc::new(LexicalCrossEncoder)),
        "http" => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("rerank.url required for http provider"))?;
            Ok(Arc::new(HttpCrossEncoder::new(url, config.timeout_ms)?))
        }
        other => bail!("Unknown rerank provider: {}", other),
    }
}

pub fn create_verifier(config: &VerifierConfig) -> Result<Arc<dyn Verifier>> {
    match config.provider.as_str() {
        "lexical" => Ok(Arc::new(LexicalVerifier)),
        "http" => Ok(Arc::new(HttpVerifier::new(config)?)),
        other => bail!("Unknown verifier provider: {}", other),
    }
}
