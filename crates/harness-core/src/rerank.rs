//! Cross-encoder re-ranking of retrieved candidates.
//!
//! The re-ranker is the one stage allowed to be slow. The application
//! wraps [`CrossEncoder::score`] in a time slice and falls back to
//! [`fallback_by_fused`] when the slice runs out.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::error::BackendError;
use crate::models::{RankedEvidence, RetrievedCandidate};
use crate::text;

/// Relevance model scoring `(query, passage)` pairs.
///
/// Implementations must be deterministic for identical inputs.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    fn name(&self) -> &str;
    /// One score per passage, in passage order. Higher is more relevant.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, BackendError>;
}

/// Offline lexical cross-encoder.
///
/// Scores query-term coverage weighted by how rare each term is across the
/// passages being ranked, plus a bonus for query terms that appear
/// adjacently in the passage. Output lies in `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct LexicalCrossEncoder;

impl LexicalCrossEncoder {
    pub fn score_sync(&self, query: &str, passages: &[String]) -> Vec<f32> {
        let query_terms = dedup(text::analyze(query));
        if query_terms.is_empty() {
            return vec![0.0; passages.len()];
        }

        let passage_terms: Vec<Vec<String>> = passages.iter().map(|p| text::analyze(p)).collect();
        let passage_sets: Vec<HashSet<&str>> = passage_terms
            .iter()
            .map(|terms| terms.iter().map(String::as_str).collect())
            .collect();

        let n = passages.len() as f64;
        let weights: HashMap<&str, f64> = query_terms
            .iter()
            .map(|t| {
                let df = passage_sets.iter().filter(|s| s.contains(t.as_str())).count() as f64;
                (t.as_str(), (1.0 + n / (1.0 + df)).ln())
            })
            .collect();
        let total_weight: f64 = weights.values().sum();

        let query_pairs: Vec<(&str, &str)> = query_terms
            .windows(2)
            .map(|w| (w[0].as_str(), w[1].as_str()))
            .collect();

        passage_terms
            .iter()
            .zip(passage_sets.iter())
            .map(|(terms, set)| {
                let covered: f64 = query_terms
                    .iter()
                    .filter(|t| set.contains(t.as_str()))
                    .map(|t| weights[t.as_str()])
                    .sum();
                let coverage = if total_weight > 0.0 {
                    covered / total_weight
                } else {
                    0.0
                };

                if query_pairs.is_empty() {
                    return coverage as f32;
                }

                let adjacent: HashSet<(&str, &str)> = terms
                    .windows(2)
                    .map(|w| (w[0].as_str(), w[1].as_str()))
                    .collect();
                let hits = query_pairs.iter().filter(|p| adjacent.contains(p)).count();
                let proximity = hits as f64 / query_pairs.len() as f64;

                (0.8 * coverage + 0.2 * proximity).min(1.0) as f32
            })
            .collect()
    }
}

#[async_trait]
impl CrossEncoder for LexicalCrossEncoder {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, BackendError> {
        Ok(self.score_sync(query, passages))
    }
}

fn dedup(terms: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    terms
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Order candidates by cross-encoder score and keep the best `top_k`.
///
/// Ties fall back to fused retrieval score, then chunk id, so the output
/// is fully determined by the inputs.
pub fn rank(
    candidates: Vec<RetrievedCandidate>,
    scores: &[f32],
    top_k: usize,
) -> Result<Vec<RankedEvidence>, BackendError> {
    if scores.len() != candidates.len() {
        return Err(BackendError::InvalidResponse(format!(
            "cross-encoder returned {} scores for {} passages",
            scores.len(),
            candidates.len()
        )));
    }

    let mut paired: Vec<(RetrievedCandidate, f64)> = candidates
        .into_iter()
        .zip(scores.iter())
        .map(|(c, s)| {
            let s = if s.is_finite() { *s as f64 } else { 0.0 };
            (c, s)
        })
        .collect();

    paired.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.fused_score
                    .partial_cmp(&a.fused_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.chunk.id.cmp(&b.chunk.id))
    });
    paired.truncate(top_k);

    Ok(paired
        .into_iter()
        .enumerate()
        .map(|(i, (c, s))| RankedEvidence {
            chunk: c.chunk,
            rerank_score: s,
            fused_score: c.fused_score,
            rank_position: i + 1,
        })
        .collect())
}

/// Degraded ranking used when the cross-encoder misses its time slice:
/// retrieval order is kept and the fused score stands in for the
/// re-rank score.
pub fn fallback_by_fused(candidates: Vec<RetrievedCandidate>, top_k: usize) -> Vec<RankedEvidence> {
    let mut candidates = candidates;
    crate::retrieve::sort_candidates(&mut candidates);
    candidates
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(i, c)| RankedEvidence {
            rerank_score: c.fused_score,
            fused_score: c.fused_score,
            chunk: c.chunk,
            rank_position: i + 1,
        })
        .collect()
}
