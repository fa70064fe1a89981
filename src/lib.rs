//! # Vet Harness
//!
//! Citation-grounded clinical evidence service for veterinary teams.
//!
//! Two orchestrators sit on top of [`harness_core`]:
//!
//! - **Ask**: hybrid retrieval over an indexed literature corpus,
//!   cross-encoder re-ranking, cite-while-generate synthesis and a
//!   weakest-link factuality gate. Every answer is either fully cited and
//!   verified, rejected with reasons, or failed with a stable error code.
//! - **Diagnose**: a six-stage sequential session (Intake, Hypothesis,
//!   Planner, Evidence, Critic, Decision) that ranks differentials, orders
//!   the most informative test per unit cost, and consults Ask for
//!   literature support, under a loop cap and a cost budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────────────┐
//! │   JSONL    │──▶│   import    │──▶│ SQLite FTS5 + vectors │
//! └────────────┘   └─────────────┘   └──────────┬───────────┘
//!                                               │ CorpusIndex
//!                   ┌───────────────────────────┤
//!                   ▼                           │
//!            ┌─────────────┐  EvidenceSource ┌──┴──────────┐
//!            │  Diagnose   │────────────────▶│     Ask     │──▶ embedder / cross-encoder /
//!            └──────┬──────┘                 └──────┬──────┘    generator / verifier
//!                   └──────────────┬────────────────┘
//!                         ┌────────┴────────┐
//!                         ▼                 ▼
//!                    ┌─────────┐      ┌──────────┐
//!                    │   CLI   │      │   HTTP   │
//!                    └─────────┘      └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] / [`migrate`] | SQLite pool and corpus schema |
//! | [`corpus`] | SQLite-backed [`CorpusIndex`](harness_core::corpus::CorpusIndex) |
//! | [`import`] | JSONL chunk import |
//! | [`http`] | JSON client with retry and backoff |
//! | [`embedding`] | Query/passage embedding providers |
//! | [`generation`] | Answer generation endpoints |
//! | [`scoring`] | Cross-encoder and verifier endpoints |
//! | [`ask`] | Ask orchestrator |
//! | [`knowledge`] | Diagnostic knowledge base loading |
//! | [`diagnose`] | Diagnose session service |
//! | [`server`] | axum HTTP API |

pub mod ask;
pub mod config;
pub mod corpus;
pub mod db;
pub mod diagnose;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod import;
pub mod knowledge;
pub mod logging;
pub mod migrate;
pub mod scoring;
pub mod server;
