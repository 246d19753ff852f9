use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub blobs: BlobConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_blob_backend() -> String {
    "local".to_string()
}
fn default_fetch_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_lexical_limit")]
    pub lexical_limit: i64,
    #[serde(default = "default_vector_limit")]
    pub vector_limit: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_limit: default_lexical_limit(),
            vector_limit: default_vector_limit(),
            final_limit: default_final_limit(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_lexical_limit() -> i64 {
    6
}
fn default_vector_limit() -> i64 {
    6
}
fn default_final_limit() -> usize {
    8
}
fn default_search_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vision_model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_dims: Option<usize>,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_vision_timeout_secs")]
    pub vision_timeout_secs: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_request_budget_secs")]
    pub request_budget_secs: u64,
    /// Answer retrieval through the provider's file-search tool instead of
    /// the chunk table. The two paths are alternatives, never combined.
    #[serde(default)]
    pub use_retrieval_tool: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: None,
            vision_model: None,
            embedding_model: None,
            embedding_dims: None,
            embed_batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            max_output_tokens: default_max_output_tokens(),
            generation_timeout_secs: default_generation_timeout_secs(),
            vision_timeout_secs: default_vision_timeout_secs(),
            embed_timeout_secs: default_embed_timeout_secs(),
            request_budget_secs: default_request_budget_secs(),
            use_retrieval_tool: false,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_output_tokens() -> u32 {
    2000
}
fn default_generation_timeout_secs() -> u64 {
    45
}
fn default_vision_timeout_secs() -> u64 {
    30
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_request_budget_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_memory_batch_size(),
            extraction_timeout_secs: default_extraction_timeout_secs(),
        }
    }
}

fn default_memory_batch_size() -> usize {
    20
}
fn default_extraction_timeout_secs() -> u64 {
    45
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_max_concurrent() -> usize {
    12
}
fn default_batch_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Config {
    /// Smallest configuration that passes validation. Paths are relative to
    /// the working directory; callers override them before connecting.
    pub fn minimal() -> Self {
        Config {
            db: DbConfig {
                path: PathBuf::from("docket.sqlite"),
            },
            blobs: BlobConfig {
                backend: default_blob_backend(),
                root: Some(PathBuf::from("blobs")),
                base_url: None,
                fetch_timeout_secs: default_fetch_timeout_secs(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:8744".to_string(),
            },
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.is_enabled() && self.embedding_model.is_some()
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = toml::from_str(&content).context("parsing config file")?;

    // Validate chunking
    if config.chunking.size == 0 {
        anyhow::bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        anyhow::bail!("chunking.overlap must be < chunking.size");
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.lexical_limit < 1 || config.retrieval.vector_limit < 1 {
        anyhow::bail!("retrieval limits must be >= 1");
    }

    // Validate blobs
    match config.blobs.backend.as_str() {
        "local" => {
            if config.blobs.root.is_none() {
                anyhow::bail!("blobs.root must be set when blobs.backend is 'local'");
            }
        }
        "http" => {
            if config.blobs.base_url.is_none() {
                anyhow::bail!("blobs.base_url must be set when blobs.backend is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown blob backend: '{}'. Must be local or http.",
            other
        ),
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    if config.llm.embeddings_enabled() {
        match config.llm.embedding_dims {
            Some(d) if d > 0 => {}
            _ => anyhow::bail!("llm.embedding_dims must be > 0 when an embedding model is set"),
        }
    }

    // Validate ingest
    if config.ingest.max_concurrent == 0 {
        anyhow::bail!("ingest.max_concurrent must be > 0");
    }
    if config.ingest.batch_limit < 1 {
        anyhow::bail!("ingest.batch_limit must be >= 1");
    }
    if config.memory.batch_size == 0 {
        anyhow::bail!("memory.batch_size must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("docket.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/docket.sqlite"

[blobs]
root = "data/blobs"

[server]
bind = "127.0.0.1:8744"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.size, 1000);
        assert_eq!(config.chunking.overlap, 150);
        assert_eq!(config.retrieval.lexical_limit, 6);
        assert_eq!(config.ingest.max_concurrent, 12);
        assert_eq!(config.ingest.batch_limit, 50);
        assert_eq!(config.memory.batch_size, 20);
        assert!(!config.llm.is_enabled());
    }

    #[test]
    fn overlap_must_stay_below_size() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/docket.sqlite"

[blobs]
root = "data/blobs"

[chunking]
size = 100
overlap = 100

[server]
bind = "127.0.0.1:8744"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn http_backend_requires_base_url() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/docket.sqlite"

[blobs]
backend = "http"

[server]
bind = "127.0.0.1:8744"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("blobs.base_url"));
    }

    #[test]
    fn enabled_provider_requires_model() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/docket.sqlite"

[blobs]
root = "data/blobs"

[llm]
provider = "openai"

[server]
bind = "127.0.0.1:8744"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("llm.model"));
    }
}
