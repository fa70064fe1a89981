//! Hybrid retriever: dense + sparse scoring with configurable fusion.
//!
//! The retriever asks the [`CorpusIndex`] for candidate chunks and scores
//! them itself, so fusion behaves the same on every backend.
//!
//! # Scoring
//!
//! 1. Dense: cosine similarity between the query and chunk embeddings.
//! 2. Sparse: Okapi BM25 over the chunk's analysed terms, using corpus
//!    document frequencies from [`CorpusIndex::term_stats`].
//! 3. Drop candidates with no sparse match and a dense score under
//!    `min_dense_score`.
//! 4. Fuse, either `weighted` (min-max normalise each channel, weighted
//!    sum) or `rrf` (weighted reciprocal rank fusion).
//! 5. Multiply by `1 + species_boost` when the chunk is tagged with a
//!    species named in the query.
//! 6. Sort by fused score (desc), publication year (desc, unknown last),
//!    chunk id (asc), and truncate to `k`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::corpus::{CorpusIndex, TermStats};
use crate::embedding::cosine_similarity;
use crate::error::AskError;
use crate::models::{Chunk, Query, RetrievedCandidate};
use crate::text;

/// How dense and sparse scores are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionStrategy {
    Weighted,
    Rrf,
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub strategy: FusionStrategy,
    pub dense_weight: f64,
    pub sparse_weight: f64,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    pub bm25_k1: f64,
    pub bm25_b: f64,
    pub min_dense_score: f64,
    pub species_boost: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Weighted,
            dense_weight: 0.6,
            sparse_weight: 0.4,
            rrf_k: 60.0,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            min_dense_score: 0.2,
            species_boost: 0.05,
        }
    }
}

pub struct Retriever {
    config: FusionConfig,
}

impl Retriever {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Retrieve at most `k` fused candidates for `query`.
    pub async fn retrieve(
        &self,
        corpus: &dyn CorpusIndex,
        query: &Query,
        k: usize,
    ) -> Result<Vec<RetrievedCandidate>, AskError> {
        let terms = query.unique_terms();
        if k == 0 || (terms.is_empty() && query.embedding.is_empty()) {
            return Ok(Vec::new());
        }

        let chunks = corpus
            .search(&query.embedding, &terms, k)
            .await
            .map_err(|e| AskError::RetrievalUnavailable(e.to_string()))?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let stats = corpus
            .term_stats(&terms)
            .await
            .map_err(|e| AskError::RetrievalUnavailable(e.to_string()))?;

        let candidates = self.score(query, chunks, &stats, k);
        tracing::debug!(
            trace_id = %query.trace_id,
            candidates = candidates.len(),
            "retrieval scored candidates"
        );
        Ok(candidates)
    }

    /// Score, fuse, order, and truncate a candidate set.
    pub fn score(
        &self,
        query: &Query,
        chunks: Vec<Chunk>,
        stats: &TermStats,
        k: usize,
    ) -> Vec<RetrievedCandidate> {
        let terms = query.unique_terms();
        let mut seen = HashSet::new();

        let mut scored: Vec<RetrievedCandidate> = chunks
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .map(|chunk| {
                let dense = if query.embedding.is_empty() {
                    0.0
                } else {
                    cosine_similarity(&query.embedding, &chunk.embedding) as f64
                };
                let sparse = bm25(
                    &terms,
                    &chunk.sparse_terms,
                    stats,
                    self.config.bm25_k1,
                    self.config.bm25_b,
                );
                RetrievedCandidate {
                    chunk: Arc::new(chunk),
                    dense_score: dense,
                    sparse_score: sparse,
                    fused_score: 0.0,
                }
            })
            .filter(|c| c.sparse_score > 0.0 || c.dense_score >= self.config.min_dense_score)
            .collect();

        if scored.is_empty() {
            return scored;
        }

        match self.config.strategy {
            FusionStrategy::Weighted => self.fuse_weighted(&mut scored),
            FusionStrategy::Rrf => self.fuse_rrf(&mut scored),
        }

        let species = text::detect_species(&query.normalized_text);
        if !species.is_empty() && self.config.species_boost > 0.0 {
            for c in &mut scored {
                if c.chunk
                    .species_tags
                    .iter()
                    .any(|tag| species.contains(&tag.as_str()))
                {
                    c.fused_score *= 1.0 + self.config.species_boost;
                }
            }
        }

        sort_candidates(&mut scored);
        scored.truncate(k);
        scored
    }

    fn fuse_weighted(&self, scored: &mut [RetrievedCandidate]) {
        let dense: Vec<f64> = scored.iter().map(|c| c.dense_score).collect();
        let sparse: Vec<f64> = scored.iter().map(|c| c.sparse_score).collect();
        let norm_dense = normalize_scores(&dense);
        let norm_sparse = normalize_scores(&sparse);

        for (i, c) in scored.iter_mut().enumerate() {
            c.fused_score = self.config.dense_weight * norm_dense[i]
                + self.config.sparse_weight * norm_sparse[i];
        }
    }

    fn fuse_rrf(&self, scored: &mut [RetrievedCandidate]) {
        let dense_ranks = channel_ranks(scored, |c| c.dense_score);
        let sparse_ranks = channel_ranks(scored, |c| c.sparse_score);

        for c in scored.iter_mut() {
            let mut fused = 0.0;
            if let Some(rank) = dense_ranks.get(c.chunk.id.as_str()) {
                fused += self.config.dense_weight / (self.config.rrf_k + *rank as f64);
            }
            if let Some(rank) = sparse_ranks.get(c.chunk.id.as_str()) {
                fused += self.config.sparse_weight / (self.config.rrf_k + *rank as f64);
            }
            c.fused_score = fused;
        }
    }
}

/// 1-based ranks of candidates with a positive score in one channel.
fn channel_ranks<F>(scored: &[RetrievedCandidate], score: F) -> HashMap<String, usize>
where
    F: Fn(&RetrievedCandidate) -> f64,
{
    let mut ranked: Vec<(&str, f64)> = scored
        .iter()
        .map(|c| (c.chunk.id.as_str(), score(c)))
        .filter(|(_, s)| *s > 0.0)
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(b.0))
    });
    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (id, _))| (id.to_string(), i + 1))
        .collect()
}

/// Fused score (desc), year (desc, unknown last), chunk id (asc).
pub fn sort_candidates(candidates: &mut [RetrievedCandidate]) {
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.chunk.source_metadata.year.cmp(&a.chunk.source_metadata.year))
            .then(a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Okapi BM25 of `chunk_terms` for the given query terms.
pub fn bm25(
    query_terms: &[String],
    chunk_terms: &[String],
    stats: &TermStats,
    k1: f64,
    b: f64,
) -> f64 {
    if query_terms.is_empty() || chunk_terms.is_empty() || stats.chunk_count == 0 {
        return 0.0;
    }

    let mut tf: HashMap<&str, f64> = HashMap::new();
    for t in chunk_terms {
        *tf.entry(t.as_str()).or_default() += 1.0;
    }

    let n = stats.chunk_count as f64;
    let len = chunk_terms.len() as f64;
    let avg = if stats.avg_terms > 0.0 { stats.avg_terms } else { len };

    query_terms
        .iter()
        .map(|term| {
            let f = tf.get(term.as_str()).copied().unwrap_or(0.0);
            if f == 0.0 {
                return 0.0;
            }
            let df = stats.doc_freq(term).max(1) as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            idf * (f * (k1 + 1.0)) / (f + k1 * (1.0 - b + b * len / avg))
        })
        .sum()
}

/// Min-max normalise raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal and positive they normalise to `1.0`; a channel
/// with no positive score normalises to all zeros.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if s_max <= 0.0 {
        return vec![0.0; scores.len()];
    }

    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;
    use crate::models::SourceMetadata;

    fn chunk(id: &str, text: &str, year: Option<i32>) -> Chunk {
        Chunk::new(
            id,
            format!("doc-{id}"),
            text,
            SourceMetadata {
                title: format!("Paper {id}"),
                year,
                ..Default::default()
            },
        )
    }

    fn stats_for(chunks: &[Chunk], terms: &[String]) -> TermStats {
        let mut doc_freq = HashMap::new();
        for t in terms {
            let n = chunks.iter().filter(|c| c.sparse_terms.contains(t)).count() as u64;
            doc_freq.insert(t.clone(), n);
        }
        let total: usize = chunks.iter().map(|c| c.sparse_terms.len()).sum();
        TermStats {
            chunk_count: chunks.len() as u64,
            avg_terms: total as f64 / chunks.len() as f64,
            doc_freq,
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_scores(&[10.0, 5.0, 0.0]);
        assert!((result[0] - 1.0).abs() < 1e-9);
        assert!((result[1] - 0.5).abs() < 1e-9);
        assert!(result[2].abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        assert_eq!(normalize_scores(&[3.0, 3.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_normalize_silent_channel_stays_zero() {
        assert_eq!(normalize_scores(&[0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bm25_prefers_rarer_terms() {
        let chunks = vec![
            chunk("a", "dog cough bordetella", None),
            chunk("b", "dog cough", None),
            chunk("c", "dog vomiting", None),
        ];
        let terms = vec!["dog".to_string(), "bordetella".to_string()];
        let stats = stats_for(&chunks, &terms);
        let a = bm25(&terms, &chunks[0].sparse_terms, &stats, 1.2, 0.75);
        let b = bm25(&terms, &chunks[1].sparse_terms, &stats, 1.2, 0.75);
        assert!(a > b, "rare-term match should outscore common-term match");
        assert!(b > 0.0);
    }

    #[test]
    fn test_bm25_no_overlap_is_zero() {
        let chunks = vec![chunk("a", "feline asthma", None)];
        let terms = vec!["kennel".to_string()];
        let stats = stats_for(&chunks, &terms);
        assert_eq!(bm25(&terms, &chunks[0].sparse_terms, &stats, 1.2, 0.75), 0.0);
    }

    #[test]
    fn test_tie_break_prefers_recent_year_then_id() {
        let query = Query::new("kennel cough", "t").unwrap();
        let chunks = vec![
            chunk("b", "kennel cough", Some(2019)),
            chunk("c", "kennel cough", Some(2023)),
            chunk("a", "kennel cough", Some(2019)),
            chunk("d", "kennel cough", None),
        ];
        let stats = stats_for(&chunks, &query.unique_terms());
        let retriever = Retriever::new(FusionConfig::default());
        let ids: Vec<String> = retriever
            .score(&query, chunks, &stats, 10)
            .iter()
            .map(|c| c.chunk.id.clone())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_irrelevant_chunks_are_dropped() {
        let query = Query::new("kennel cough", "t").unwrap();
        let chunks = vec![chunk("x", "feline hyperthyroidism", None)];
        let stats = stats_for(&chunks, &query.unique_terms());
        let retriever = Retriever::new(FusionConfig::default());
        assert!(retriever.score(&query, chunks, &stats, 10).is_empty());
    }

    #[test]
    fn test_weights_select_channel() {
        // "a" wins on dense, "b" wins on sparse.
        let query = Query::new("bordetella cough", "t")
            .unwrap()
            .with_embedding(vec![1.0, 0.0]);
        let chunks = vec![
            chunk("a", "cough", None).with_embedding(vec![1.0, 0.0]),
            chunk("b", "bordetella cough bordetella", None).with_embedding(vec![0.5, 0.5]),
        ];
        let stats = stats_for(&chunks, &query.unique_terms());

        let dense_only = Retriever::new(FusionConfig {
            dense_weight: 1.0,
            sparse_weight: 0.0,
            ..Default::default()
        });
        let top = dense_only.score(&query, chunks.clone(), &stats, 1);
        assert_eq!(top[0].chunk.id, "a");

        let sparse_only = Retriever::new(FusionConfig {
            dense_weight: 0.0,
            sparse_weight: 1.0,
            ..Default::default()
        });
        let top = sparse_only.score(&query, chunks, &stats, 1);
        assert_eq!(top[0].chunk.id, "b");
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        let query = Query::new("bordetella cough", "t")
            .unwrap()
            .with_embedding(vec![1.0, 0.0]);
        let chunks = vec![
            chunk("both", "bordetella cough", None).with_embedding(vec![1.0, 0.0]),
            chunk("dense", "unrelated words", None).with_embedding(vec![0.95, 0.05]),
            chunk("sparse", "cough", None).with_embedding(vec![0.0, 1.0]),
        ];
        let stats = stats_for(&chunks, &query.unique_terms());
        let retriever = Retriever::new(FusionConfig {
            strategy: FusionStrategy::Rrf,
            dense_weight: 1.0,
            sparse_weight: 1.0,
            ..Default::default()
        });
        let ranked = retriever.score(&query, chunks, &stats, 3);
        assert_eq!(ranked[0].chunk.id, "both");
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_species_boost_breaks_even_scores() {
        let query = Query::new("cough in cats", "t").unwrap();
        let chunks = vec![
            chunk("a", "cough", Some(2020)).with_species(&["dog"]),
            chunk("b", "cough", Some(2020)).with_species(&["cat"]),
        ];
        let stats = stats_for(&chunks, &query.unique_terms());
        let retriever = Retriever::new(FusionConfig::default());
        let ranked = retriever.score(&query, chunks, &stats, 2);
        assert_eq!(ranked[0].chunk.id, "b");
    }

    #[tokio::test]
    async fn test_retrieve_respects_k() {
        let corpus = InMemoryCorpus::from_chunks(
            (0..20)
                .map(|i| chunk(&format!("c{i:02}"), "canine kennel cough", Some(2000 + i)))
                .collect(),
        );
        let query = Query::new("kennel cough", "t").unwrap();
        let retriever = Retriever::new(FusionConfig::default());
        let result = retriever.retrieve(&corpus, &query, 5).await.unwrap();
        assert_eq!(result.len(), 5);
        // The in-memory sparse channel keeps the first k equal matches;
        // among those the most recent paper leads.
        assert_eq!(result[0].chunk.id, "c04");
    }

    #[tokio::test]
    async fn test_retrieve_empty_corpus() {
        let corpus = InMemoryCorpus::new();
        let query = Query::new("kennel cough", "t").unwrap();
        let retriever = Retriever::new(FusionConfig::default());
        assert!(retriever.retrieve(&corpus, &query, 40).await.unwrap().is_empty());
    }
}
