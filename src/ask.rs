//! Ask orchestrator.
//!
//! Drives one query through `Received → Retrieving → Reranking →
//! Synthesizing → Verifying` and ends in exactly one of `Completed`,
//! `Rejected`, or `Failed`:
//!
//! - **Completed**: the factuality gate accepted a fully cited answer.
//! - **Rejected**: retrieval found nothing, or the gate declined the
//!   answer. Carries confidence and reasons, never answer text.
//! - **Failed**: a collaborator failed or the deadline expired. Carries a
//!   stable error code, never answer text.
//!
//! The whole pipeline runs under one `tokio::time::timeout`. On expiry the
//! pipeline future is dropped, which drops any in-flight `reqwest` call.
//!
//! Requests are idempotent per `trace_id`: concurrent and repeated calls
//! with the same trace id share a single pipeline execution for
//! `ask.idempotency_ttl_secs`. Failed results are forgotten so a caller
//! may retry under the same id.

use anyhow::Result;
use harness_core::corpus::CorpusIndex;
use harness_core::embedding::{embed_one, QueryEmbedder};
use harness_core::error::{AskError, BackendError};
use harness_core::factuality::{FactualityGate, Verifier};
use harness_core::models::{Answer, AskDiagnostics, AskResponse, Query, RetrievedCandidate};
use harness_core::rerank::{self, CrossEncoder};
use harness_core::retrieve::{FusionConfig, Retriever};
use harness_core::synthesize::{
    GenerationParams, Generator, NumberedEvidencePromptBuilder, PromptBuilder, Synthesizer,
};
use harness_core::text;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::config::Config;
use crate::corpus::SqliteCorpus;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::scoring::{create_cross_encoder, create_verifier};

/// Injected collaborators. Every external dependency of the pipeline
/// arrives here; nothing is looked up globally.
#[derive(Clone)]
pub struct AskCollaborators {
    pub corpus: Arc<dyn CorpusIndex>,
    pub embedder: Arc<dyn QueryEmbedder>,
    pub cross_encoder: Arc<dyn CrossEncoder>,
    pub prompt_builder: Arc<dyn PromptBuilder>,
    pub generator: Arc<dyn Generator>,
    pub verifier: Arc<dyn Verifier>,
}

impl AskCollaborators {
    /// Build every model client named in `config` around `corpus`.
    pub fn from_config(config: &Config, corpus: Arc<dyn CorpusIndex>) -> Result<Self> {
        Ok(Self {
            corpus,
            embedder: create_embedder(&config.embedding)?,
            cross_encoder: create_cross_encoder(&config.rerank)?,
            prompt_builder: Arc::new(NumberedEvidencePromptBuilder::default()),
            generator: create_generator(&config.generation)?,
            verifier: create_verifier(&config.verifier)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AskSettings {
    pub k: usize,
    pub top_k: usize,
    pub fusion: FusionConfig,
    pub timeout: Duration,
    pub rerank_timeout: Duration,
    pub rerank_fallback: bool,
    pub retrieval_attempts: u32,
    pub retrieval_backoff: Duration,
    pub threshold: f64,
    pub generation: GenerationParams,
    pub idempotency_ttl: Duration,
    pub idempotency_capacity: u64,
    pub cache: Option<ResponseCacheSettings>,
}

#[derive(Debug, Clone)]
pub struct ResponseCacheSettings {
    pub ttl: Duration,
    pub max_entries: u64,
    pub safety_terms: Vec<String>,
}

impl AskSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            k: config.retrieval.k,
            top_k: config.rerank.top_k,
            fusion: config.retrieval.fusion_config(),
            timeout: Duration::from_secs(config.ask.timeout_secs),
            rerank_timeout: Duration::from_millis(config.rerank.timeout_ms),
            rerank_fallback: config.rerank.fallback,
            retrieval_attempts: config.retrieval.max_attempts.max(1),
            retrieval_backoff: Duration::from_millis(config.retrieval.backoff_base_ms),
            threshold: config.verifier.threshold,
            generation: GenerationParams {
                max_tokens: config.generation.max_tokens,
                temperature: config.generation.temperature,
            },
            idempotency_ttl: Duration::from_secs(config.ask.idempotency_ttl_secs),
            idempotency_capacity: config.ask.idempotency_capacity,
            cache: config.cache.enabled.then(|| ResponseCacheSettings {
                ttl: Duration::from_secs(config.cache.ttl_secs),
                max_entries: config.cache.max_entries,
                safety_terms: config.cache.safety_terms.clone(),
            }),
        }
    }
}

/// Terminal outcome of a pipeline run that did not fail.
enum Outcome {
    Completed(Answer),
    Rejected { confidence: f64, reasons: Vec<String> },
    Cached(AskResponse),
}

struct ResponseCache {
    entries: Cache<String, AskResponse>,
    /// Analysed forms of the safety terms.
    safety_terms: HashSet<String>,
}

impl ResponseCache {
    fn new(settings: &ResponseCacheSettings) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(settings.max_entries)
                .time_to_live(settings.ttl)
                .build(),
            safety_terms: settings
                .safety_terms
                .iter()
                .flat_map(|t| text::analyze(t))
                .collect(),
        }
    }

    /// Cache key for a query, or `None` when it must not be served stale.
    fn key(&self, query: &Query) -> Option<String> {
        if query.terms.iter().any(|t| self.safety_terms.contains(t)) {
            return None;
        }
        Some(hex::encode(Sha256::digest(query.normalized_text.as_bytes())))
    }
}

pub struct AskService {
    collaborators: AskCollaborators,
    settings: AskSettings,
    retriever: Retriever,
    synthesizer: Synthesizer,
    gate: FactualityGate,
    inflight: Cache<String, AskResponse>,
    responses: Option<ResponseCache>,
}

impl AskService {
    pub fn new(settings: AskSettings, collaborators: AskCollaborators) -> Self {
        let retriever = Retriever::new(settings.fusion.clone());
        let synthesizer = Synthesizer::new(collaborators.prompt_builder.clone(), settings.generation);
        let gate = FactualityGate::new(settings.threshold);
        let inflight = Cache::builder()
            .max_capacity(settings.idempotency_capacity)
            .time_to_live(settings.idempotency_ttl)
            .build();
        let responses = settings.cache.as_ref().map(ResponseCache::new);
        Self {
            collaborators,
            settings,
            retriever,
            synthesizer,
            gate,
            inflight,
            responses,
        }
    }

    /// Service over the SQLite corpus with every client built from `config`.
    pub async fn from_config(config: &Config) -> Result<(Self, Arc<SqliteCorpus>)> {
        let pool = db::open(config, db::Access::Read).await?;
        let corpus = Arc::new(SqliteCorpus::new(pool));
        let collaborators = AskCollaborators::from_config(config, corpus.clone())?;
        Ok((Self::new(AskSettings::from_config(config), collaborators), corpus))
    }

    pub fn settings(&self) -> &AskSettings {
        &self.settings
    }

    /// Answer `raw_query`. Never returns an error: failures are reported as
    /// a `Failed` response carrying a stable error code.
    pub async fn ask(&self, raw_query: &str, trace_id: Option<String>) -> AskResponse {
        let trace_id = trace_id
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let response = self
            .inflight
            .get_with(trace_id.clone(), self.run(raw_query, trace_id.clone()))
            .await;
        if response.status == harness_core::models::AskStatus::Failed {
            self.inflight.invalidate(&trace_id).await;
        }
        response
    }

    async fn run(&self, raw_query: &str, trace_id: String) -> AskResponse {
        let started = Instant::now();
        let span = tracing::info_span!("ask", trace_id = %trace_id);
        let mut diag = AskDiagnostics::default();

        let result = tokio::time::timeout(
            self.settings.timeout,
            self.pipeline(raw_query, &trace_id, &mut diag)
                .instrument(span.clone()),
        )
        .await;
        diag.elapsed_ms = started.elapsed().as_millis() as u64;

        let _enter = span.enter();
        let result = result.unwrap_or_else(|_| {
            Err(AskError::AskTimeout(self.settings.timeout.as_millis() as u64))
        });

        match result {
            Ok(Outcome::Completed(answer)) => {
                tracing::info!(
                    status = "completed",
                    confidence = answer.confidence,
                    citations = answer.citations.len(),
                    elapsed_ms = diag.elapsed_ms,
                    "ask finished"
                );
                AskResponse::completed(answer, diag)
            }
            Ok(Outcome::Rejected { confidence, reasons }) => {
                tracing::warn!(
                    status = "rejected",
                    confidence,
                    reasons = ?reasons,
                    elapsed_ms = diag.elapsed_ms,
                    "ask finished"
                );
                AskResponse::rejected(trace_id, confidence, reasons, diag)
            }
            Ok(Outcome::Cached(mut response)) => {
                tracing::info!(status = "completed", cached = true, "ask served from cache");
                diag.cached = true;
                response.trace_id = trace_id;
                response.diagnostics = diag;
                response
            }
            Err(err) => {
                tracing::error!(
                    status = "failed",
                    code = err.code(),
                    error = %err,
                    elapsed_ms = diag.elapsed_ms,
                    "ask finished"
                );
                AskResponse::failed(trace_id, &err, diag)
            }
        }
    }

    async fn pipeline(
        &self,
        raw_query: &str,
        trace_id: &str,
        diag: &mut AskDiagnostics,
    ) -> Result<Outcome, AskError> {
        let query = Query::new(raw_query, trace_id)?;
        tracing::debug!(stage = "received", terms = query.terms.len(), "query analysed");

        let cache_key = self.responses.as_ref().and_then(|c| c.key(&query));
        if let (Some(cache), Some(key)) = (&self.responses, &cache_key) {
            if let Some(hit) = cache.entries.get(key).await {
                return Ok(Outcome::Cached(hit));
            }
        }

        tracing::debug!(stage = "retrieving", k = self.settings.k);
        let candidates = self.retrieve_with_retry(query.clone(), diag).await?;
        diag.candidates_retrieved = candidates.len();
        if candidates.is_empty() {
            return Ok(Outcome::Rejected {
                confidence: 0.0,
                reasons: vec!["insufficient evidence".to_string()],
            });
        }

        tracing::debug!(stage = "reranking", candidates = candidates.len());
        let evidence = self.rerank(&query, candidates, diag).await?;
        diag.evidence_used = evidence.len();

        tracing::debug!(stage = "synthesizing", evidence = evidence.len());
        let mut answer = self
            .synthesizer
            .synthesize(self.collaborators.generator.as_ref(), &query, &evidence)
            .await?;

        tracing::debug!(stage = "verifying", claims = answer.claims.len());
        let verdict = self
            .gate
            .verify(self.collaborators.verifier.as_ref(), &answer, &evidence)
            .await?;

        if !verdict.accepted {
            return Ok(Outcome::Rejected {
                confidence: verdict.confidence,
                reasons: verdict.reasons,
            });
        }

        answer.confidence = verdict.confidence;
        if let (Some(cache), Some(key)) = (&self.responses, cache_key) {
            let stored = AskResponse::completed(answer.clone(), AskDiagnostics::default());
            cache.entries.insert(key, stored).await;
        }
        Ok(Outcome::Completed(answer))
    }

    async fn retrieve_with_retry(
        &self,
        mut query: Query,
        diag: &mut AskDiagnostics,
    ) -> Result<Vec<RetrievedCandidate>, AskError> {
        let max_attempts = self.settings.retrieval_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            diag.retrieval_attempts = attempt;

            let result = match self.embed_query(&query).await {
                Ok(embedding) => {
                    query.embedding = embedding;
                    self.retriever
                        .retrieve(self.collaborators.corpus.as_ref(), &query, self.settings.k)
                        .await
                }
                Err(e) => Err(AskError::RetrievalUnavailable(format!("query embedding: {e}"))),
            };

            match result {
                Ok(candidates) => return Ok(candidates),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.settings.retrieval_backoff * (1u32 << (attempt - 1).min(5));
                    tracing::warn!(attempt, ?delay, error = %err, "retrieval failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn embed_query(&self, query: &Query) -> Result<Vec<f32>, BackendError> {
        let embedder = self.collaborators.embedder.as_ref();
        if embedder.dims() == 0 {
            return Ok(Vec::new());
        }
        embed_one(embedder, &query.normalized_text).await
    }

    async fn rerank(
        &self,
        query: &Query,
        candidates: Vec<RetrievedCandidate>,
        diag: &mut AskDiagnostics,
    ) -> Result<Vec<harness_core::models::RankedEvidence>, AskError> {
        let top_k = self.settings.top_k;
        let passages: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
        let scored = tokio::time::timeout(
            self.settings.rerank_timeout,
            self.collaborators.cross_encoder.score(&query.raw_text, &passages),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout))
        .and_then(|scores| rerank::rank(candidates.clone(), &scores, top_k));

        match scored {
            Ok(evidence) => Ok(evidence),
            Err(BackendError::Timeout) if !self.settings.rerank_fallback => Err(AskError::RerankTimeout),
            Err(e) => {
                tracing::warn!(
                    cross_encoder = self.collaborators.cross_encoder.name(),
                    error = %e,
                    "re-ranking degraded to fused order"
                );
                diag.rerank_fallback = true;
                Ok(rerank::fallback_by_fused(candidates, top_k))
            }
        }
    }
}

/// `harness ask`: answer one query against the configured corpus.
pub async fn run_ask(config: &Config, query: &str, trace_id: Option<String>, json: bool) -> Result<()> {
    let (service, _corpus) = AskService::from_config(config).await?;
    let response = service.ask(query, trace_id).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("status: {}", response.status.as_str());
    println!("trace_id: {}", response.trace_id);
    println!("confidence: {:.2}", response.confidence);
    if let Some(answer) = &response.answer {
        println!();
        println!("{answer}");
    }
    if !response.citations.is_empty() {
        println!();
        let mut seen = HashSet::new();
        for c in response.citations.iter().filter(|c| seen.insert(c.rank_position)) {
            let year = c.year.map(|y| format!(" ({y})")).unwrap_or_default();
            let doi = c.doi.as_deref().map(|d| format!(" doi:{d}")).unwrap_or_default();
            println!("[{}] {}{}{}", c.rank_position, c.title, year, doi);
        }
    }
    for reason in &response.reasons {
        println!("reason: {reason}");
    }
    if let Some(err) = &response.error {
        println!("error: {} ({})", err.message, err.code);
    }
    Ok(())
}
