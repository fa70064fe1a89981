//! Corpus database handles.
//!
//! `init` and `import` open the corpus for writing and may create it.
//! `ask` and `serve` only read, and refuse to start against a missing or
//! uninitialised corpus rather than rejecting every query for lack of
//! evidence.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Create the file and its directory if needed. A single connection
    /// serialises import batches.
    Write,
    /// Existing, initialised corpus only. Sized for concurrent requests.
    Read,
}

impl Access {
    fn max_connections(self) -> u32 {
        match self {
            Access::Write => 1,
            Access::Read => 8,
        }
    }
}

pub async fn open(config: &Config, access: Access) -> Result<SqlitePool> {
    let path = &config.db.path;
    match access {
        Access::Write => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }
        Access::Read if !path.exists() => {
            bail!(
                "no corpus at {}; run `harness init` and `harness import` first",
                path.display()
            );
        }
        Access::Read => {}
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(access == Access::Write)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(access.max_connections())
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open corpus at {}", path.display()))?;

    if access == Access::Read && !has_schema(&pool).await? {
        pool.close().await;
        bail!(
            "corpus at {} is not initialised; run `harness init`",
            path.display()
        );
    }

    tracing::debug!(path = %path.display(), ?access, "opened corpus database");
    Ok(pool)
}

async fn has_schema(pool: &SqlitePool) -> Result<bool> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'chunks'",
    )
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}
