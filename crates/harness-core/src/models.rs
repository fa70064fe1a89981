//! Core data model for the Ask pipeline.
//!
//! These types describe the evidence that flows from the corpus index
//! through retrieval, re-ranking, synthesis, and verification, and the
//! structured response handed back to callers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AskError, ErrorKind};
use crate::text;

/// Bibliographic metadata of the document a chunk was cut from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub doi: Option<String>,
}

/// An indexed, embedded passage. Immutable once indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Analysed token stream of `text` (with repeats).
    #[serde(default)]
    pub sparse_terms: Vec<String>,
    #[serde(default)]
    pub source_metadata: SourceMetadata,
    #[serde(default)]
    pub species_tags: Vec<String>,
}

impl Chunk {
    /// Build a chunk whose sparse terms are derived from its text.
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        text: impl Into<String>,
        source_metadata: SourceMetadata,
    ) -> Self {
        let text = text.into();
        let sparse_terms = text::analyze(&text);
        Self {
            id: id.into(),
            document_id: document_id.into(),
            text,
            embedding: Vec::new(),
            sparse_terms,
            source_metadata,
            species_tags: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_species(mut self, tags: &[&str]) -> Self {
        self.species_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// One Ask invocation's query. Ephemeral.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw_text: String,
    pub normalized_text: String,
    pub terms: Vec<String>,
    pub embedding: Vec<f32>,
    pub trace_id: String,
}

impl Query {
    pub fn new(raw_text: &str, trace_id: impl Into<String>) -> Result<Self, AskError> {
        let normalized_text = text::normalize(raw_text);
        if normalized_text.is_empty() {
            return Err(AskError::InvalidQuery("query must not be empty".into()));
        }
        let terms = text::analyze(&normalized_text);
        Ok(Self {
            raw_text: raw_text.to_string(),
            normalized_text,
            terms,
            embedding: Vec::new(),
            trace_id: trace_id.into(),
        })
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Unique query terms in first-seen order.
    pub fn unique_terms(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.terms
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect()
    }
}

/// Retriever output, consumed by the re-ranker.
#[derive(Debug, Clone)]
pub struct RetrievedCandidate {
    pub chunk: Arc<Chunk>,
    pub dense_score: f64,
    pub sparse_score: f64,
    pub fused_score: f64,
}

/// Re-ranked evidence. `rank_position` is 1-based and is the citation
/// token (`[n]`) used in prompts and answers.
#[derive(Debug, Clone)]
pub struct RankedEvidence {
    pub chunk: Arc<Chunk>,
    pub rerank_score: f64,
    pub fused_score: f64,
    pub rank_position: usize,
}

/// Byte range of a claim inside [`Answer::text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A declarative sentence of an answer with its resolved citation tokens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claim {
    /// Claim text without citation tokens.
    pub text: String,
    pub span: Span,
    /// Rank positions of the cited evidence.
    pub citations: Vec<usize>,
}

/// Citation of one evidence chunk by one claim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub rank_position: usize,
    pub claim_span: Span,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
}

/// A synthesized answer. Every citation references a chunk of the
/// evidence it was synthesized from.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub claims: Vec<Claim>,
    pub citations: Vec<Citation>,
    pub confidence: f64,
    pub trace_id: String,
    /// Claims removed because none of their tokens resolved.
    pub stripped_claims: usize,
}

/// Terminal outcome of an Ask request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskStatus {
    Completed,
    Rejected,
    Failed,
}

impl AskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskStatus::Completed => "completed",
            AskStatus::Rejected => "rejected",
            AskStatus::Failed => "failed",
        }
    }
}

/// Machine-readable failure attached to `Failed` responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&AskError> for ErrorInfo {
    fn from(err: &AskError) -> Self {
        let kind: ErrorKind = err.kind();
        Self {
            code: kind.code().to_string(),
            message: kind.public_message().to_string(),
        }
    }
}

/// Execution details useful for debugging and fixtures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AskDiagnostics {
    pub candidates_retrieved: usize,
    pub evidence_used: usize,
    pub rerank_fallback: bool,
    pub retrieval_attempts: u32,
    pub cached: bool,
    pub elapsed_ms: u64,
}

/// Caller-facing result of an Ask request.
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub status: AskStatus,
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub confidence: f64,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub diagnostics: AskDiagnostics,
}

impl AskResponse {
    pub fn completed(answer: Answer, diagnostics: AskDiagnostics) -> Self {
        Self {
            status: AskStatus::Completed,
            answer: Some(answer.text),
            citations: answer.citations,
            confidence: answer.confidence,
            trace_id: answer.trace_id,
            reasons: Vec::new(),
            error: None,
            diagnostics,
        }
    }

    pub fn rejected(
        trace_id: impl Into<String>,
        confidence: f64,
        reasons: Vec<String>,
        diagnostics: AskDiagnostics,
    ) -> Self {
        Self {
            status: AskStatus::Rejected,
            answer: None,
            citations: Vec::new(),
            confidence,
            trace_id: trace_id.into(),
            reasons,
            error: None,
            diagnostics,
        }
    }

    pub fn failed(trace_id: impl Into<String>, err: &AskError, diagnostics: AskDiagnostics) -> Self {
        Self {
            status: AskStatus::Failed,
            answer: None,
            citations: Vec::new(),
            confidence: 0.0,
            trace_id: trace_id.into(),
            reasons: Vec::new(),
            error: Some(ErrorInfo::from(err)),
            diagnostics,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AskStatus::Completed
    }
}
