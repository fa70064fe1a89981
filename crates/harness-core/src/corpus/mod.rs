//! Corpus index abstraction.
//!
//! The [`CorpusIndex`] trait is the only way the core reads indexed
//! evidence. The index is owned by ingestion; the core never writes to it
//! and does not manage its lifecycle or storage format.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::BackendError;
use crate::models::Chunk;

pub use memory::InMemoryCorpus;

/// Corpus-wide statistics needed for BM25 scoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermStats {
    /// Number of indexed chunks.
    pub chunk_count: u64,
    /// Mean number of analysed terms per chunk.
    pub avg_terms: f64,
    /// Number of chunks containing each requested term.
    pub doc_freq: HashMap<String, u64>,
}

impl TermStats {
    pub fn doc_freq(&self, term: &str) -> u64 {
        self.doc_freq.get(term).copied().unwrap_or(0)
    }
}

/// Abstract, read-only corpus index (vector + keyword store).
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search`](CorpusIndex::search) | Candidate chunks for a query |
/// | [`term_stats`](CorpusIndex::term_stats) | Document frequencies for BM25 |
#[async_trait]
pub trait CorpusIndex: Send + Sync {
    /// Return candidate chunks for a query: up to `k` nearest chunks by
    /// embedding and up to `k` chunks matching any of `query_terms`,
    /// de-duplicated by id. Scoring is left to the retriever.
    async fn search(
        &self,
        query_embedding: &[f32],
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<Chunk>, BackendError>;

    /// Corpus statistics for the given terms.
    async fn term_stats(&self, terms: &[String]) -> Result<TermStats, BackendError>;
}
