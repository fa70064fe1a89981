//! TOML configuration.
//!
//! Every section except `[db]` is optional and every field has a default,
//! so a minimal config is just a database path. Secrets are never read
//! from the file; API keys come from the environment.

use anyhow::{Context, Result};
use harness_core::diagnose::DiagnoseSettings;
use harness_core::retrieve::{FusionConfig, FusionStrategy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub ask: AskConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub diagnose: DiagnoseConfig,
}

impl Config {
    /// Defaults everywhere, with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            verifier: VerifierConfig::default(),
            ask: AskConfig::default(),
            cache: CacheConfig::default(),
            diagnose: DiagnoseConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Requests per client per minute. `0` disables rate limiting.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_rate_limit() -> u32 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `HARNESS_LOG` overrides it.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidate fan-out.
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_fusion")]
    pub fusion: FusionStrategy,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    #[serde(default = "default_min_dense_score")]
    pub min_dense_score: f64,
    #[serde(default = "default_species_boost")]
    pub species_boost: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            fusion: default_fusion(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
            rrf_k: default_rrf_k(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            min_dense_score: default_min_dense_score(),
            species_boost: default_species_boost(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            strategy: self.fusion,
            dense_weight: self.dense_weight,
            sparse_weight: self.sparse_weight,
            rrf_k: self.rrf_k,
            bm25_k1: self.bm25_k1,
            bm25_b: self.bm25_b,
            min_dense_score: self.min_dense_score,
            species_boost: self.species_boost,
        }
    }
}

fn default_k() -> usize {
    40
}
fn default_fusion() -> FusionStrategy {
    FusionStrategy::Weighted
}
fn default_dense_weight() -> f64 {
    0.6
}
fn default_sparse_weight() -> f64 {
    0.4
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_bm25_k1() -> f64 {
    1.2
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_min_dense_score() -> f64 {
    0.2
}
fn default_species_boost() -> f64 {
    0.05
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `lexical` or `http`.
    #[serde(default = "default_lexical")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Time slice for the cross-encoder before falling back to fused order.
    #[serde(default = "default_rerank_timeout_ms")]
    pub timeout_ms: u64,
    /// Keep fused retrieval order when the slice runs out. When false a
    /// timeout fails the request with `rerank_timeout`.
    #[serde(default = "default_true")]
    pub fallback: bool,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_lexical(),
            url: None,
            top_k: default_top_k(),
            timeout_ms: default_rerank_timeout_ms(),
            fallback: true,
        }
    }
}

fn default_lexical() -> String {
    "lexical".to_string()
}
fn default_top_k() -> usize {
    10
}
fn default_rerank_timeout_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hashing`, `openai`, or `ollama`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `inference` (local inference server), or `openai`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_max_tokens() -> u32 {
    500
}
fn default_temperature() -> f32 {
    0.2
}
fn default_generation_retries() -> u32 {
    1
}
fn default_generation_timeout() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    /// `lexical` or `http`.
    #[serde(default = "default_lexical")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_verifier_retries")]
    pub max_retries: u32,
    #[serde(default = "default_verifier_timeout")]
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            provider: default_lexical(),
            url: None,
            threshold: default_threshold(),
            max_retries: default_verifier_retries(),
            timeout_secs: default_verifier_timeout(),
        }
    }
}

fn default_threshold() -> f64 {
    0.7
}
fn default_verifier_retries() -> u32 {
    2
}
fn default_verifier_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AskConfig {
    /// Wall-clock deadline for one Ask request, all stages included.
    #[serde(default = "default_ask_timeout")]
    pub timeout_secs: u64,
    /// How long a trace_id's result is remembered for idempotent replays.
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: u64,
}

impl Default for AskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_ask_timeout(),
            idempotency_ttl_secs: default_idempotency_ttl(),
            idempotency_capacity: default_idempotency_capacity(),
        }
    }
}

fn default_ask_timeout() -> u64 {
    30
}
fn default_idempotency_ttl() -> u64 {
    600
}
fn default_idempotency_capacity() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
    /// Queries mentioning any of these terms are never served from cache.
    #[serde(default = "default_safety_terms")]
    pub safety_terms: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
            safety_terms: default_safety_terms(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}
fn default_cache_entries() -> u64 {
    1000
}
fn default_safety_terms() -> Vec<String> {
    [
        "dose",
        "dosage",
        "overdose",
        "toxic",
        "toxicity",
        "poison",
        "poisoning",
        "emergency",
        "antidote",
        "euthanasia",
        "contraindication",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiagnoseConfig {
    #[serde(default = "default_loop_cap")]
    pub loop_cap: u32,
    #[serde(default = "default_budget")]
    pub budget: f64,
    #[serde(default = "default_ask_call_cost")]
    pub ask_call_cost: f64,
    #[serde(default = "default_max_hypotheses")]
    pub max_hypotheses: usize,
    #[serde(default = "default_decision_confidence")]
    pub decision_confidence: f64,
    #[serde(default = "default_evidence_weight")]
    pub evidence_weight: f64,
    /// Knowledge base TOML; the bundled one is used when unset.
    #[serde(default)]
    pub knowledge_base: Option<PathBuf>,
    /// Idle sessions are dropped after this long.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for DiagnoseConfig {
    fn default() -> Self {
        Self {
            loop_cap: default_loop_cap(),
            budget: default_budget(),
            ask_call_cost: default_ask_call_cost(),
            max_hypotheses: default_max_hypotheses(),
            decision_confidence: default_decision_confidence(),
            evidence_weight: default_evidence_weight(),
            knowledge_base: None,
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl DiagnoseConfig {
    pub fn settings(&self) -> DiagnoseSettings {
        DiagnoseSettings {
            loop_cap: self.loop_cap,
            budget: self.budget,
            ask_call_cost: self.ask_call_cost,
            max_hypotheses: self.max_hypotheses,
            decision_confidence: self.decision_confidence,
            evidence_weight: self.evidence_weight,
        }
    }
}

fn default_loop_cap() -> u32 {
    4
}
fn default_budget() -> f64 {
    10.0
}
fn default_ask_call_cost() -> f64 {
    1.0
}
fn default_max_hypotheses() -> usize {
    5
}
fn default_decision_confidence() -> f64 {
    0.6
}
fn default_evidence_weight() -> f64 {
    0.5
}
fn default_session_ttl() -> u64 {
    86_400
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Retrieval
    let r = &config.retrieval;
    if r.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if r.max_attempts == 0 {
        anyhow::bail!("retrieval.max_attempts must be >= 1");
    }
    if r.dense_weight < 0.0 || r.sparse_weight < 0.0 || r.dense_weight + r.sparse_weight <= 0.0 {
        anyhow::bail!("retrieval.dense_weight and sparse_weight must be >= 0 and not both 0");
    }
    if !(0.0..=1.0).contains(&r.min_dense_score) {
        anyhow::bail!("retrieval.min_dense_score must be in [0.0, 1.0]");
    }
    if r.species_boost < 0.0 {
        anyhow::bail!("retrieval.species_boost must be >= 0");
    }

    // Re-ranking
    if config.rerank.top_k == 0 {
        anyhow::bail!("rerank.top_k must be >= 1");
    }
    check_provider("rerank", &config.rerank.provider, &["lexical", "http"])?;
    if config.rerank.provider == "http" && config.rerank.url.is_none() {
        anyhow::bail!("rerank.url must be set when provider is 'http'");
    }

    // Embedding
    let e = &config.embedding;
    check_provider("embedding", &e.provider, &["disabled", "hashing", "openai", "ollama"])?;
    if e.is_enabled() && (e.dims.is_none() || e.dims == Some(0)) {
        anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
    }
    if matches!(e.provider.as_str(), "openai" | "ollama") && e.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is '{}'", e.provider);
    }

    // Generation
    let g = &config.generation;
    check_provider("generation", &g.provider, &["disabled", "inference", "openai"])?;
    if g.provider == "inference" && g.url.is_none() {
        anyhow::bail!("generation.url must be set when provider is 'inference'");
    }
    if g.provider == "openai" && g.model.is_none() {
        anyhow::bail!("generation.model must be specified when provider is 'openai'");
    }
    if !(0.0..=2.0).contains(&g.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }

    // Verification
    check_provider("verifier", &config.verifier.provider, &["lexical", "http"])?;
    if config.verifier.provider == "http" && config.verifier.url.is_none() {
        anyhow::bail!("verifier.url must be set when provider is 'http'");
    }
    // At zero a rejection could never carry confidence below the threshold.
    let threshold = config.verifier.threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("verifier.threshold must be in (0.0, 1.0], got {threshold}");
    }

    // Ask
    if config.ask.timeout_secs == 0 {
        anyhow::bail!("ask.timeout_secs must be >= 1");
    }

    // Logging
    if !matches!(config.logging.format.as_str(), "text" | "json") {
        anyhow::bail!("logging.format must be 'text' or 'json'");
    }

    // Diagnose
    let d = &config.diagnose;
    if d.budget < 0.0 || d.ask_call_cost < 0.0 {
        anyhow::bail!("diagnose.budget and diagnose.ask_call_cost must be >= 0");
    }
    if !(0.0..=1.0).contains(&d.decision_confidence) {
        anyhow::bail!("diagnose.decision_confidence must be in [0.0, 1.0]");
    }
    if d.max_hypotheses == 0 {
        anyhow::bail!("diagnose.max_hypotheses must be >= 1");
    }

    Ok(())
}

fn check_provider(section: &str, provider: &str, allowed: &[&str]) -> Result<()> {
    if !allowed.contains(&provider) {
        anyhow::bail!(
            "Unknown {} provider: '{}'. Must be one of: {}.",
            section,
            provider,
            allowed.join(", ")
        );
    }
    Ok(())
}
