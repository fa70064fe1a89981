//! # Harness Core
//!
//! Runtime-free logic for the Harness clinical evidence services: the
//! evidence data model, collaborator traits, hybrid retrieval, re-ranking,
//! citation-grounded answer synthesis, the factuality gate, and the
//! sequential diagnose stage machine.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. Every external
//! system (corpus index, embedding model, cross-encoder, generation model,
//! verifier, evidence source) is reached through an `async_trait` seam so
//! that the application crate decides how calls are scheduled, timed out,
//! and retried.
//!
//! ## Pipeline
//!
//! ```text
//! Query ──▶ Retriever ──▶ Re-ranker ──▶ Synthesizer ──▶ Factuality Gate
//!            (dense+BM25)  (cross-enc)   (cite-while-     (weakest-link)
//!                                         generate)
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunks, queries, candidates, evidence, answers |
//! | [`text`] | Query normalisation and term analysis |
//! | [`embedding`] | Embedder trait and vector helpers |
//! | [`corpus`] | Corpus index trait and in-memory backend |
//! | [`retrieve`] | Dense + sparse retrieval with score fusion |
//! | [`rerank`] | Cross-encoder re-ranking |
//! | [`synthesize`] | Prompt building and citation parsing |
//! | [`factuality`] | Claim verification gate |
//! | [`diagnose`] | Six-stage diagnostic orchestrator |
//! | [`error`] | Error taxonomy |

pub mod corpus;
pub mod diagnose;
pub mod embedding;
pub mod error;
pub mod factuality;
pub mod models;
pub mod rerank;
pub mod retrieve;
pub mod synthesize;
pub mod text;
