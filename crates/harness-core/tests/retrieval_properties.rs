use std::collections::HashSet;

use harness_core::corpus::{CorpusIndex, InMemoryCorpus};
use harness_core::embedding::HashingEmbedder;
use harness_core::models::{Chunk, Query, SourceMetadata};
use harness_core::rerank::{self, CrossEncoder, LexicalCrossEncoder};
use harness_core::retrieve::{FusionConfig, FusionStrategy, Retriever};
use proptest::prelude::*;

const VOCAB: &[&str] = &[
    "kennel", "cough", "bordetella", "canine", "feline", "asthma", "parvovirus", "vaccine",
    "renal", "failure", "diabetes", "insulin", "laminitis", "equine", "mastitis", "bovine",
];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn text_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(VOCAB), 1..12).prop_map(|w| w.join(" "))
}

fn corpus_strategy() -> impl Strategy<Value = Vec<(String, Option<i32>)>> {
    prop::collection::vec((text_strategy(), prop::option::of(1990i32..2025)), 0..30)
}

fn build_corpus(docs: &[(String, Option<i32>)]) -> InMemoryCorpus {
    let embedder = HashingEmbedder::new(64);
    InMemoryCorpus::from_chunks(
        docs.iter()
            .enumerate()
            .map(|(i, (text, year))| {
                Chunk::new(
                    format!("c{i:02}"),
                    format!("d{}", i / 3),
                    text.clone(),
                    SourceMetadata {
                        title: format!("Doc {i}"),
                        year: *year,
                        ..Default::default()
                    },
                )
                .with_embedding(embedder.embed_text(text))
            })
            .collect(),
    )
}

proptest! {
    #[test]
    fn retrieval_returns_at_most_k_chunks_from_the_corpus(
        docs in corpus_strategy(),
        query in text_strategy(),
        k in 0usize..12,
        rrf in any::<bool>(),
    ) {
        let rt = runtime();
        let corpus = build_corpus(&docs);
        let retriever = Retriever::new(FusionConfig {
            strategy: if rrf { FusionStrategy::Rrf } else { FusionStrategy::Weighted },
            ..FusionConfig::default()
        });
        let q = Query::new(&query, "prop")
            .unwrap()
            .with_embedding(HashingEmbedder::new(64).embed_text(&query));

        let candidates = rt.block_on(retriever.retrieve(&corpus, &q, k)).unwrap();

        prop_assert!(candidates.len() <= k);
        let mut ids = HashSet::new();
        for c in &candidates {
            prop_assert!(corpus.contains(&c.chunk.id));
            prop_assert!(ids.insert(c.chunk.id.clone()), "duplicate candidate {}", c.chunk.id);
        }
        prop_assert!(candidates.windows(2).all(|w| w[0].fused_score >= w[1].fused_score));
    }

    #[test]
    fn rerank_is_ordered_and_bounded(
        docs in corpus_strategy(),
        query in text_strategy(),
        top_k in 0usize..8,
    ) {
        let rt = runtime();
        let corpus = build_corpus(&docs);
        let retriever = Retriever::new(FusionConfig::default());
        let q = Query::new(&query, "prop").unwrap();
        let candidates = rt.block_on(retriever.retrieve(&corpus, &q, 20)).unwrap();

        let passages: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
        let scores = rt.block_on(LexicalCrossEncoder.score(&q.raw_text, &passages)).unwrap();
        let ranked = rerank::rank(candidates, &scores, top_k).unwrap();

        prop_assert!(ranked.len() <= top_k);
        prop_assert!(ranked.windows(2).all(|w| w[0].rerank_score >= w[1].rerank_score));
        for (i, ev) in ranked.iter().enumerate() {
            prop_assert_eq!(ev.rank_position, i + 1);
        }
    }

    #[test]
    fn term_stats_never_exceed_chunk_count(docs in corpus_strategy(), query in text_strategy()) {
        let rt = runtime();
        let corpus = build_corpus(&docs);
        let terms = Query::new(&query, "prop").unwrap().unique_terms();
        let stats = rt.block_on(corpus.term_stats(&terms)).unwrap();
        prop_assert_eq!(stats.chunk_count as usize, docs.len());
        for t in &terms {
            prop_assert!(stats.doc_freq(t) <= stats.chunk_count);
        }
    }
}
