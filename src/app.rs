//! Process-wide application context.
//!
//! Everything the pipeline shares is built once here: the SQLite pool, the
//! byte store, the provider clients, and the storage-mode probe result. The
//! probe runs a single time per process; after [`App::connect`] returns the
//! context is treated as immutable.

use anyhow::Result;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::db::{self, StorageMode};
use crate::embedding::EmbeddingClient;
use crate::llm::GenAiClient;
use crate::migrate;

pub struct App {
    pub config: Config,
    pub pool: sqlx::SqlitePool,
    pub blobs: BlobStore,
    pub llm: GenAiClient,
    pub embedder: Option<EmbeddingClient>,
    pub storage_mode: StorageMode,
}

impl App {
    /// Open the database, run migrations, build the provider clients, and
    /// resolve the storage mode.
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let blobs = BlobStore::from_config(&config)?;
        let llm = GenAiClient::from_config(&config.llm)?;
        let embedder = EmbeddingClient::from_config(&config.llm)?;
        let storage_mode = db::resolve_storage_mode(&pool, &config).await;
        tracing::debug!(mode = storage_mode.as_str(), "storage mode resolved");
        Ok(Self {
            config,
            pool,
            blobs,
            llm,
            embedder,
            storage_mode,
        })
    }
}
