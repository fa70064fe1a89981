//! In-memory [`CorpusIndex`] implementation for tests and demos.
//!
//! Chunks live in a `Vec` behind `std::sync::RwLock`. The dense channel is
//! brute-force cosine similarity; the sparse channel returns chunks sharing
//! at least one term with the query, most shared terms first.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::BackendError;
use crate::models::Chunk;

use super::{CorpusIndex, TermStats};

pub struct InMemoryCorpus {
    chunks: RwLock<Vec<Chunk>>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: RwLock::new(chunks),
        }
    }

    /// Insert or replace a chunk by id.
    pub fn insert(&self, chunk: Chunk) -> Result<(), BackendError> {
        let mut chunks = self.chunks.write().map_err(|_| poisoned())?;
        chunks.retain(|c| c.id != chunk.id);
        chunks.push(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks
            .read()
            .map(|c| c.iter().any(|chunk| chunk.id == chunk_id))
            .unwrap_or(false)
    }
}

impl Default for InMemoryCorpus {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> BackendError {
    BackendError::unavailable("in-memory corpus lock poisoned")
}

#[async_trait]
impl CorpusIndex for InMemoryCorpus {
    async fn search(
        &self,
        query_embedding: &[f32],
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<Chunk>, BackendError> {
        let chunks = self.chunks.read().map_err(|_| poisoned())?;

        let mut dense: Vec<(usize, f32)> = if query_embedding.is_empty() {
            Vec::new()
        } else {
            chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.embedding.is_empty())
                .map(|(i, c)| (i, cosine_similarity(query_embedding, &c.embedding)))
                .filter(|(_, s)| *s > 0.0)
                .collect()
        };
        dense.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        dense.truncate(k);

        let wanted: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
        let mut sparse: Vec<(usize, usize)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let shared: HashSet<&str> = c
                    .sparse_terms
                    .iter()
                    .map(String::as_str)
                    .filter(|t| wanted.contains(t))
                    .collect();
                (i, shared.len())
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        sparse.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sparse.truncate(k);

        let mut seen = HashSet::new();
        let result = dense
            .iter()
            .map(|(i, _)| *i)
            .chain(sparse.iter().map(|(i, _)| *i))
            .filter(|i| seen.insert(*i))
            .map(|i| chunks[i].clone())
            .collect();
        Ok(result)
    }

    async fn term_stats(&self, terms: &[String]) -> Result<TermStats, BackendError> {
        let chunks = self.chunks.read().map_err(|_| poisoned())?;
        let chunk_count = chunks.len() as u64;
        let total_terms: usize = chunks.iter().map(|c| c.sparse_terms.len()).sum();
        let avg_terms = if chunk_count == 0 {
            0.0
        } else {
            total_terms as f64 / chunk_count as f64
        };

        let mut doc_freq = HashMap::new();
        for term in terms {
            let n = chunks
                .iter()
                .filter(|c| c.sparse_terms.iter().any(|t| t == term))
                .count() as u64;
            doc_freq.insert(term.clone(), n);
        }

        Ok(TermStats {
            chunk_count,
            avg_terms,
            doc_freq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceMetadata;

    fn chunk(id: &str, text: &str, embedding: Vec<f32>) -> Chunk {
        Chunk::new(id, "doc", text, SourceMetadata::default()).with_embedding(embedding)
    }

    #[tokio::test]
    async fn test_search_unions_dense_and_sparse() {
        let corpus = InMemoryCorpus::from_chunks(vec![
            chunk("c1", "kennel cough in dogs", vec![1.0, 0.0]),
            chunk("c2", "feline asthma", vec![0.0, 1.0]),
            chunk("c3", "canine parvovirus", vec![0.9, 0.1]),
        ]);
        let hits = corpus
            .search(&[1.0, 0.0], &["asthma".to_string()], 1)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_term_stats() {
        let corpus = InMemoryCorpus::from_chunks(vec![
            chunk("c1", "cough cough dog", vec![]),
            chunk("c2", "dog vomiting", vec![]),
        ]);
        let stats = corpus
            .term_stats(&["dog".to_string(), "cough".to_string(), "cat".to_string()])
            .await
            .unwrap();
        assert_eq!(stats.chunk_count, 2);
        assert!((stats.avg_terms - 2.5).abs() < 1e-9);
        assert_eq!(stats.doc_freq("dog"), 2);
        assert_eq!(stats.doc_freq("cough"), 1);
        assert_eq!(stats.doc_freq("cat"), 0);
    }

    #[test]
    fn test_insert_replaces_by_id() {
        let corpus = InMemoryCorpus::new();
        corpus.insert(chunk("c1", "first", vec![])).unwrap();
        corpus.insert(chunk("c1", "second", vec![])).unwrap();
        assert_eq!(corpus.len(), 1);
        assert!(corpus.contains("c1"));
    }
}
