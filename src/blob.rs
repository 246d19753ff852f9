//! Byte store client.
//!
//! The pipeline treats blob storage as an opaque store with two operations:
//! `put(name, bytes, content_type) -> url` and `fetch(url) -> bytes`. Two
//! backends implement that contract:
//!
//! - **local**: objects under a root directory, addressed as `local://<key>`
//!   URLs. Keeps the whole pipeline runnable offline and in tests.
//! - **http**: plain `PUT`/`GET` against a base URL, for a real remote
//!   object store.
//!
//! Object keys carry a content-hash prefix plus a random suffix; re-uploading
//! the same content under a new suffix is acceptable (no dedup guarantee).
//! Fetches are bounded by the configured timeout and a timeout surfaces as a
//! distinct error so callers can degrade instead of failing hard.

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PipelineError, Result};

const LOCAL_SCHEME: &str = "local://";

#[derive(Debug, Clone)]
pub enum BlobStore {
    Local(LocalBlobStore),
    Http(HttpBlobStore),
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    base_url: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl BlobStore {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        match config.blobs.backend.as_str() {
            "local" => {
                let root = config
                    .blobs
                    .root
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("blobs.root not configured"))?;
                std::fs::create_dir_all(&root)?;
                Ok(BlobStore::Local(LocalBlobStore { root }))
            }
            "http" => {
                let base_url = config
                    .blobs
                    .base_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("blobs.base_url not configured"))?;
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(config.blobs.fetch_timeout_secs))
                    .build()?;
                Ok(BlobStore::Http(HttpBlobStore {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    client,
                    timeout_secs: config.blobs.fetch_timeout_secs,
                }))
            }
            other => anyhow::bail!("unknown blob backend '{other}'"),
        }
    }

    /// Store bytes under a fresh object key derived from `name`; returns the
    /// URL to fetch them back.
    pub async fn put(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let key = object_key(name, bytes);
        match self {
            BlobStore::Local(store) => store.put(&key, bytes).await,
            BlobStore::Http(store) => store.put(&key, bytes, content_type).await,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        match self {
            BlobStore::Local(store) => store.fetch(url).await,
            BlobStore::Http(store) => store.fetch(url).await,
        }
    }

    /// True when `url` resolves against the local backend rather than
    /// something an external provider could fetch itself.
    pub fn is_local_url(url: &str) -> bool {
        url.starts_with(LOCAL_SCHEME)
    }
}

impl LocalBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("{LOCAL_SCHEME}{key}"))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let key = url
            .strip_prefix(LOCAL_SCHEME)
            .ok_or_else(|| PipelineError::Blob(format!("not a local blob url: {url}")))?;
        if key.split('/').any(|part| part == "..") {
            return Err(PipelineError::Blob(format!("invalid blob key: {key}")));
        }
        let path = self.root.join(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::Blob(format!("fetch {url}: {e}")))
    }
}

impl HttpBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, key);
        let resp = self
            .client
            .put(&url)
            .header("content-type", content_type.to_string())
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| self.classify(e, "blob put"))?;
        if !resp.status().is_success() {
            return Err(PipelineError::Blob(format!(
                "blob put failed (HTTP {}) for {url}",
                resp.status()
            )));
        }
        Ok(url)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e, "blob fetch"))?;
        if !resp.status().is_success() {
            return Err(PipelineError::Blob(format!(
                "blob fetch failed (HTTP {}) for {url}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| self.classify(e, "blob fetch"))?;
        Ok(bytes.to_vec())
    }

    fn classify(&self, err: reqwest::Error, operation: &'static str) -> PipelineError {
        if err.is_timeout() {
            PipelineError::timed_out(operation, self.timeout_secs)
        } else {
            PipelineError::Blob(format!("{operation}: {err}"))
        }
    }
}

/// `<sha prefix>-<random suffix>/<sanitized name>`: collision-proof without
/// promising dedup.
fn object_key(name: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let hash_prefix: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!("{hash_prefix}-{suffix}/{}", sanitize_name(name))
}

pub(crate) fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
