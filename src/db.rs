use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let path = &config.db.path;

    // The configured directory may not exist on first run.
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    Ok(SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?)
}

/// How chunk embeddings are stored and searched.
///
/// Resolved once at startup and carried in the app context; nothing re-probes
/// at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Native vector column populated; nearest-neighbor search available.
    Vector,
    /// Embeddings kept only as JSON arrays; retrieval is lexical-only.
    Json,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Vector => "vector",
            StorageMode::Json => "json",
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, StorageMode::Vector)
    }
}

/// One-time capability probe: can this store hold and return the native
/// vector column? Requires an embedding model to be configured at all, then
/// round-trips a sentinel BLOB through `chunk_vectors`. Any failure resolves
/// to [`StorageMode::Json`] rather than an error.
pub async fn resolve_storage_mode(pool: &SqlitePool, config: &Config) -> StorageMode {
    if !config.llm.embeddings_enabled() {
        return StorageMode::Json;
    }

    let sentinel: &[u8] = &[0u8; 8];
    let wrote = sqlx::query(
        "INSERT OR REPLACE INTO chunk_vectors (chunk_id, case_id, document_id, embedding)
         VALUES ('__probe__', '__probe__', '__probe__', ?)",
    )
    .bind(sentinel)
    .execute(pool)
    .await;

    if wrote.is_err() {
        return StorageMode::Json;
    }

    let read: std::result::Result<Option<(Vec<u8>,)>, sqlx::Error> =
        sqlx::query_as("SELECT embedding FROM chunk_vectors WHERE chunk_id = '__probe__'")
            .fetch_optional(pool)
            .await;

    let _ = sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = '__probe__'")
        .execute(pool)
        .await;

    match read {
        Ok(Some((bytes,))) if bytes == sentinel => StorageMode::Vector,
        _ => StorageMode::Json,
    }
}
