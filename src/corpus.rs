//! SQLite-backed corpus index.
//!
//! Keyword candidates come from the FTS5 table over analysed terms; dense
//! candidates are found by brute-force cosine similarity over
//! `chunk_vectors`. BM25 scoring itself happens in the retriever, this
//! module only supplies candidates and corpus statistics.

use async_trait::async_trait;
use chrono::Utc;
use harness_core::corpus::{CorpusIndex, TermStats};
use harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use harness_core::error::BackendError;
use harness_core::models::{Chunk, SourceMetadata};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

pub struct SqliteCorpus {
    pool: SqlitePool,
}

fn backend(e: sqlx::Error) -> BackendError {
    BackendError::unavailable(format!("corpus database: {e}"))
}

/// FTS5 expression matching any of `terms`. Terms are analysed tokens
/// (alphanumeric only), so quoting each as a phrase is sufficient.
fn fts_any(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

impl SqliteCorpus {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check that the keyword index answers. Ask cannot retrieve without it,
    /// even when `chunks` itself is readable.
    pub async fn ping(&self) -> Result<(), BackendError> {
        sqlx::query_scalar::<_, i64>("SELECT rowid FROM chunks_fts LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map(|_| ())
            .map_err(backend)
    }

    pub async fn chunk_count(&self) -> Result<u64, BackendError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(n.max(0) as u64)
    }

    /// Insert or replace a chunk, its FTS row and (if present) its vector.
    pub async fn upsert(&self, chunk: &Chunk, model: &str) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        upsert_in(&mut tx, chunk, model).await.map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    /// Insert a batch of chunks in a single transaction.
    pub async fn upsert_batch(&self, chunks: &[Chunk], model: &str) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for chunk in chunks {
            upsert_in(&mut tx, chunk, model).await.map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn dense_ids(&self, query_embedding: &[f32], k: usize) -> Result<Vec<String>, BackendError> {
        if query_embedding.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors WHERE dims = ?")
            .bind(query_embedding.len() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut scored: Vec<(String, f32)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let sim = cosine_similarity(query_embedding, &blob_to_vec(&blob));
                (row.get::<String, _>("chunk_id"), sim)
            })
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    async fn keyword_ids(&self, terms: &[String], k: usize) -> Result<Vec<String>, BackendError> {
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        sqlx::query_scalar(
            r#"
            SELECT chunk_id FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(fts_any(terms))
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    async fn load(&self, id: &str) -> Result<Option<Chunk>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.text, c.title, c.authors_json, c.year, c.doi,
                   c.species_json, c.sparse_terms, v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| chunk_from_row(&r)).transpose()
    }
}

async fn upsert_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &Chunk,
    model: &str,
) -> Result<(), sqlx::Error> {
    let authors = serde_json::to_string(&chunk.source_metadata.authors).unwrap_or_else(|_| "[]".into());
    let species = serde_json::to_string(&chunk.species_tags).unwrap_or_else(|_| "[]".into());
    let terms = chunk.sparse_terms.join(" ");

    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, text, title, authors_json, year, doi,
                            species_json, sparse_terms, term_count, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            document_id = excluded.document_id,
            text = excluded.text,
            title = excluded.title,
            authors_json = excluded.authors_json,
            year = excluded.year,
            doi = excluded.doi,
            species_json = excluded.species_json,
            sparse_terms = excluded.sparse_terms,
            term_count = excluded.term_count,
            indexed_at = excluded.indexed_at
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(&chunk.text)
    .bind(&chunk.source_metadata.title)
    .bind(&authors)
    .bind(chunk.source_metadata.year)
    .bind(&chunk.source_metadata.doi)
    .bind(&species)
    .bind(&terms)
    .bind(chunk.sparse_terms.len() as i64)
    .bind(Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(&chunk.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO chunks_fts (chunk_id, terms) VALUES (?, ?)")
        .bind(&chunk.id)
        .bind(&terms)
        .execute(&mut **tx)
        .await?;

    if chunk.embedding.is_empty() {
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut **tx)
            .await?;
    } else {
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, model, dims, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.id)
        .bind(model)
        .bind(chunk.embedding.len() as i64)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk, BackendError> {
    let authors_json: String = row.get("authors_json");
    let species_json: String = row.get("species_json");
    let terms: String = row.get("sparse_terms");
    let embedding: Option<Vec<u8>> = row.get("embedding");

    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        text: row.get("text"),
        embedding: embedding.map(|b| blob_to_vec(&b)).unwrap_or_default(),
        sparse_terms: terms.split_whitespace().map(str::to_string).collect(),
        source_metadata: SourceMetadata {
            title: row.get("title"),
            authors: serde_json::from_str(&authors_json)
                .map_err(|e| BackendError::InvalidResponse(format!("authors_json: {e}")))?,
            year: row.get("year"),
            doi: row.get("doi"),
        },
        species_tags: serde_json::from_str(&species_json)
            .map_err(|e| BackendError::InvalidResponse(format!("species_json: {e}")))?,
    })
}

#[async_trait]
impl CorpusIndex for SqliteCorpus {
    async fn search(
        &self,
        query_embedding: &[f32],
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<Chunk>, BackendError> {
        let dense = self.dense_ids(query_embedding, k).await?;
        let keyword = self.keyword_ids(query_terms, k).await?;

        let mut seen = HashSet::new();
        let mut chunks = Vec::new();
        for id in dense.into_iter().chain(keyword) {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(chunk) = self.load(&id).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    async fn term_stats(&self, terms: &[String]) -> Result<TermStats, BackendError> {
        let row = sqlx::query("SELECT COUNT(*) AS n, COALESCE(AVG(term_count), 0.0) AS avg FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let chunk_count: i64 = row.get("n");
        let avg_terms: f64 = row.get("avg");

        let mut doc_freq = HashMap::new();
        for term in terms {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH ?")
                .bind(format!("\"{term}\""))
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
            doc_freq.insert(term.clone(), n.max(0) as u64);
        }

        Ok(TermStats {
            chunk_count: chunk_count.max(0) as u64,
            avg_terms,
            doc_freq,
        })
    }
}
