//! JSONL corpus import.
//!
//! One chunk per line:
//!
//! ```json
//! {"id": "c1", "document_id": "d1", "text": "...", "title": "...",
//!  "authors": ["..."], "year": 2023, "doi": "10.1000/x",
//!  "species_tags": ["dog"], "embedding": [0.1, ...]}
//! ```
//!
//! Only `id`, `document_id` and `text` are required. Missing species tags
//! are detected from the text. Records without an embedding are embedded
//! with the configured provider when one is enabled. Each batch is written
//! in a single transaction.

use anyhow::{bail, Context, Result};
use harness_core::embedding::QueryEmbedder;
use harness_core::models::{Chunk, SourceMetadata};
use harness_core::text;
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;

use crate::config::Config;
use crate::corpus::SqliteCorpus;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;

#[derive(Debug, Deserialize)]
struct ChunkRecord {
    id: String,
    document_id: String,
    text: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    doi: Option<String>,
    #[serde(default)]
    species_tags: Vec<String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl ChunkRecord {
    fn into_chunk(self) -> Chunk {
        let species: Vec<String> = if self.species_tags.is_empty() {
            text::detect_species(&format!("{} {}", self.title, self.text))
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            self.species_tags
                .iter()
                .map(|s| {
                    text::canonical_species(s)
                        .map(str::to_string)
                        .unwrap_or_else(|| s.trim().to_lowercase())
                })
                .collect()
        };

        let mut chunk = Chunk::new(
            self.id,
            self.document_id,
            self.text,
            SourceMetadata {
                title: self.title,
                authors: self.authors,
                year: self.year,
                doi: self.doi,
            },
        );
        chunk.species_tags = species;
        chunk.embedding = self.embedding.unwrap_or_default();
        chunk
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    /// Chunks embedded during import (as opposed to arriving with a vector).
    pub embedded: usize,
    pub skipped_blank: usize,
}

/// Import chunk records from `reader` into `corpus`.
pub async fn import_records<R: BufRead>(
    corpus: &SqliteCorpus,
    embedder: &dyn QueryEmbedder,
    reader: R,
    batch_size: usize,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    let mut batch: Vec<Chunk> = Vec::with_capacity(batch_size.max(1));

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line.with_context(|| format!("Failed to read line {line_no}"))?;
        if line.trim().is_empty() {
            stats.skipped_blank += 1;
            continue;
        }
        let record: ChunkRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid chunk record on line {line_no}"))?;
        if record.id.trim().is_empty() || record.text.trim().is_empty() {
            bail!("Chunk record on line {line_no} has an empty id or text");
        }
        let chunk = record.into_chunk();
        if !chunk.embedding.is_empty() && embedder.dims() > 0 && chunk.embedding.len() != embedder.dims() {
            bail!(
                "Chunk '{}' on line {line_no} has a {}-dimensional embedding, expected {}",
                chunk.id,
                chunk.embedding.len(),
                embedder.dims()
            );
        }
        batch.push(chunk);

        if batch.len() >= batch_size.max(1) {
            flush(corpus, embedder, &mut batch, &mut stats).await?;
        }
    }
    flush(corpus, embedder, &mut batch, &mut stats).await?;
    Ok(stats)
}

async fn flush(
    corpus: &SqliteCorpus,
    embedder: &dyn QueryEmbedder,
    batch: &mut Vec<Chunk>,
    stats: &mut ImportStats,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    if embedder.dims() > 0 {
        let missing: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.is_empty())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| batch[i].text.clone()).collect();
            let vectors = embedder
                .embed(&texts)
                .await
                .with_context(|| format!("Embedding {} chunks failed", texts.len()))?;
            for (i, vector) in missing.iter().zip(vectors) {
                batch[*i].embedding = vector;
            }
            stats.embedded += missing.len();
        }
    }

    corpus
        .upsert_batch(batch, embedder.model_name())
        .await
        .context("Failed to write chunk batch")?;
    stats.imported += batch.len();
    tracing::debug!(imported = stats.imported, "chunk batch written");
    batch.clear();
    Ok(())
}

/// `harness import`: load a JSONL file into the configured corpus.
pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let pool = db::open(config, db::Access::Write).await?;
    migrate::apply(&pool).await?;
    let corpus = SqliteCorpus::new(pool);
    let embedder = create_embedder(&config.embedding)?;

    let stats = import_records(
        &corpus,
        embedder.as_ref(),
        std::io::BufReader::new(file),
        config.embedding.batch_size,
    )
    .await?;

    tracing::info!(
        imported = stats.imported,
        embedded = stats.embedded,
        path = %path.display(),
        "import complete"
    );
    println!(
        "Imported {} chunks ({} embedded) from {}",
        stats.imported,
        stats.embedded,
        path.display()
    );
    Ok(())
}
