//! Embedding client and vector utilities.
//!
//! [`EmbeddingClient`] calls the provider's embeddings endpoint with
//! batching, retry, and backoff. It exists only when the config enables
//! embeddings; callers hold an `Option<EmbeddingClient>` and fall back to
//! lexical-only retrieval when it is `None`.
//!
//! Retries cover rate limits (429), server errors (5xx), and network
//! failures, with exponential backoff doubling from 1s and capped at 32s.
//! Any other client error fails the call on first sight.
//!
//! The `chunk_vectors` BLOB column stores vectors through [`vec_to_blob`]
//! and [`blob_to_vec`]; [`cosine_similarity`] ranks them at query time.

use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};

/// Batched embeddings client for the configured provider.
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl EmbeddingClient {
    /// Build the client from config. Returns `None` when embeddings are not
    /// configured, which drops the pipeline into lexical-only mode.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        if !config.embeddings_enabled() {
            return Ok(None);
        }
        let model = config
            .embedding_model
            .clone()
            .ok_or_else(|| PipelineError::Validation("llm.embedding_model required".to_string()))?;
        let dims = config
            .embedding_dims
            .ok_or_else(|| PipelineError::Validation("llm.embedding_dims required".to_string()))?;
        let api_key = config.api_key().ok_or_else(|| {
            PipelineError::Provider(format!("{} environment variable not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embed_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Provider(format!("HTTP client build failed: {e}")))?;
        Ok(Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dims,
            batch_size: config.embed_batch_size.max(1),
            max_retries: config.max_retries,
        }))
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed a slice of texts, splitting into provider-sized batches.
    /// Output order matches input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_call(batch).await?);
        }
        Ok(out)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_call(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Provider("empty embedding response".to_string()))
    }

    async fn embed_call(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            PipelineError::Provider(format!("embedding response read failed: {e}"))
                        })?;
                        return parse_embedding_response(&json);
                    }

                    // Retryable: rate limit or server error.
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(PipelineError::Provider(format!(
                            "embeddings API error {status}: {body_text}"
                        )));
                        continue;
                    }

                    // Other client errors are not retryable.
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::Provider(format!(
                        "embeddings API error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::Provider(format!("embeddings request: {e}")));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| PipelineError::Provider("embedding failed after retries".to_string())))
    }
}

/// Parse the embeddings API response, returning `data[].embedding` in order.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PipelineError::Provider("invalid embedding response: missing data".to_string()))?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let values = item.get("embedding").and_then(|e| e.as_array()).ok_or_else(|| {
            PipelineError::Provider("invalid embedding response: missing embedding".to_string())
        })?;
        vectors.push(values.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect());
    }
    Ok(vectors)
}

/// Little-endian `f32` bytes for the `chunk_vectors` BLOB column, 4 bytes
/// per component.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not fill a whole
/// `f32` are dropped.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`. Length mismatches, empty input, and
/// zero-norm vectors all score `0.0` so degenerate rows sink in the
/// ranking instead of erroring out of it.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let norm = na.sqrt() * nb.sqrt();
    if norm < f32::EPSILON {
        return 0.0;
    }
    dot / norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_codec_round_trips_and_drops_partial_tail() {
        let v = vec![0.5f32, -1.25, 2.0, -0.0625];
        let mut blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 16);
        blob.push(0xFF);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn cosine_scores_direction() {
        let v = vec![3.0, 4.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[2.0, 0.0], &[0.0, 5.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.5, 2.5]), 0.0);
    }

    #[test]
    fn parse_response_preserves_order() {
        let json = serde_json::json!({
            "data": [
                {"index": 0, "embedding": [1.0, 0.0]},
                {"index": 1, "embedding": [0.0, 1.0]},
            ]
        });
        let vecs = parse_embedding_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn parse_response_rejects_missing_data() {
        let json = serde_json::json!({"error": "nope"});
        assert!(parse_embedding_response(&json).is_err());
    }
}
