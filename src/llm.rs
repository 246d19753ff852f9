//! Generative-provider client: text generation, vision transcription, file
//! upload, and vector-store management over the provider's HTTP API.
//!
//! One [`GenAiClient`] is built at startup and shared process-wide. When the
//! provider is disabled in config every call fails with a provider error, so
//! ingestion of plain-text formats still works end to end without a key.
//!
//! Calls follow the same retry discipline as the embeddings client (429/5xx
//! and network errors retried with exponential backoff, other 4xx fail fast)
//! with one addition: some model variants reject sampling parameters with a
//! structured "unsupported parameter" error, in which case the offending
//! fields are stripped and the request is reissued once.

use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};

/// Fixed instruction for the vision text-recognition call on image uploads.
pub const VISION_INSTRUCTION: &str = "Read every piece of text visible in this image and transcribe it faithfully. \
     Preserve reading order. Render tables as plain text rows. \
     Return only the transcribed text, with no commentary.";

/// Timeout for file upload, vector-store, and listing calls.
const FILE_OP_TIMEOUT_SECS: u64 = 20;

const DEFAULT_TEMPERATURE: f64 = 0.2;

/// One passage returned by the provider's retrieval tool, tagged with the
/// source file it came from.
#[derive(Debug, Clone)]
pub struct ToolPassage {
    pub file_id: String,
    pub filename: String,
    pub text: String,
}

pub struct GenAiClient {
    enabled: bool,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    vision_model: String,
    max_retries: u32,
    max_output_tokens: u32,
    generation_timeout_secs: u64,
    vision_timeout_secs: u64,
}

impl GenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let enabled = config.is_enabled();
        let (api_key, model) = if enabled {
            let key = config.api_key().ok_or_else(|| {
                PipelineError::Provider(format!(
                    "{} environment variable not set",
                    config.api_key_env
                ))
            })?;
            let model = config
                .model
                .clone()
                .ok_or_else(|| PipelineError::Validation("llm.model required".to_string()))?;
            (key, model)
        } else {
            (String::new(), String::new())
        };
        let vision_model = config.vision_model.clone().unwrap_or_else(|| model.clone());
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Provider(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            enabled,
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            vision_model,
            max_retries: config.max_retries,
            max_output_tokens: config.max_output_tokens,
            generation_timeout_secs: config.generation_timeout_secs,
            vision_timeout_secs: config.vision_timeout_secs,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(PipelineError::Provider(
                "llm provider is disabled; set [llm] provider in the config".to_string(),
            ))
        }
    }

    /// Plain generation call: instructions + input, no tools.
    pub async fn generate(&self, instructions: &str, input: &str) -> Result<String> {
        self.ensure_enabled()?;
        let body = serde_json::json!({
            "model": self.model,
            "instructions": instructions,
            "input": input,
            "max_output_tokens": self.max_output_tokens,
            "temperature": DEFAULT_TEMPERATURE,
        });
        let json = self
            .post_json("/responses", body, self.generation_timeout_secs, "generation")
            .await?;
        Ok(collect_output_text(&json))
    }

    /// Generation with the provider's retrieval tool bound to a vector
    /// store; returns the passages the tool surfaced. `force` pins tool
    /// choice to the retrieval tool instead of leaving it to the model.
    pub async fn generate_with_file_search(
        &self,
        instructions: &str,
        input: &str,
        vector_store_id: &str,
        force: bool,
    ) -> Result<Vec<ToolPassage>> {
        self.ensure_enabled()?;
        let tool_choice = if force {
            serde_json::json!({"type": "file_search"})
        } else {
            serde_json::json!("auto")
        };
        let body = serde_json::json!({
            "model": self.model,
            "instructions": instructions,
            "input": input,
            "max_output_tokens": self.max_output_tokens,
            "temperature": DEFAULT_TEMPERATURE,
            "tools": [{"type": "file_search", "vector_store_ids": [vector_store_id]}],
            "tool_choice": tool_choice,
            "include": ["file_search_call.results"],
        });
        let json = self
            .post_json("/responses", body, self.generation_timeout_secs, "generation")
            .await?;
        Ok(collect_tool_passages(&json))
    }

    /// Vision transcription for image uploads. `image_url` is either a
    /// provider-fetchable URL or a `data:` URL with the bytes inlined.
    pub async fn vision_extract(&self, image_url: &str) -> Result<String> {
        self.ensure_enabled()?;
        let body = serde_json::json!({
            "model": self.vision_model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": VISION_INSTRUCTION},
                    {"type": "input_image", "image_url": image_url},
                ],
            }],
            "max_output_tokens": self.max_output_tokens,
        });
        let json = self
            .post_json("/responses", body, self.vision_timeout_secs, "vision extraction")
            .await?;
        let text = collect_output_text(&json);
        if text.trim().is_empty() {
            return Err(PipelineError::Provider(
                "vision call returned no text".to_string(),
            ));
        }
        Ok(text)
    }

    /// Upload extracted text as a provider file; returns the file handle.
    pub async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> Result<String> {
        self.ensure_enabled()?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("text/plain")
            .map_err(|e| PipelineError::Provider(format!("file part build failed: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(FILE_OP_TIMEOUT_SECS))
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_request_error(e, "file upload", FILE_OP_TIMEOUT_SECS))?;
        let json = read_json_response(response, "file upload").await?;
        json.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Provider("file upload response missing id".to_string()))
    }

    /// Create a vector store with the given name; returns its handle.
    /// Callers persist the handle and reuse it rather than calling this
    /// again for the same case.
    pub async fn create_vector_store(&self, name: &str) -> Result<String> {
        self.ensure_enabled()?;
        let body = serde_json::json!({"name": name});
        let json = self
            .post_json("/vector_stores", body, FILE_OP_TIMEOUT_SECS, "vector store create")
            .await?;
        json.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                PipelineError::Provider("vector store response missing id".to_string())
            })
    }

    /// Attach an uploaded file to a vector store for tool-based retrieval.
    pub async fn attach_file_to_vector_store(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let body = serde_json::json!({"file_id": file_id});
        self.post_json(
            &format!("/vector_stores/{vector_store_id}/files"),
            body,
            FILE_OP_TIMEOUT_SECS,
            "vector store attach",
        )
        .await?;
        Ok(())
    }

    /// POST with retry/backoff. Timeouts surface as a distinguishable
    /// timed-out error and are not retried; 429/5xx and network errors are
    /// retried; an "unsupported parameter" 400 strips sampling parameters
    /// and reissues once.
    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout_secs: u64,
        operation: &'static str,
    ) -> Result<serde_json::Value> {
        let mut body = body;
        let mut stripped_sampling = false;
        let mut attempt: u32 = 0;
        loop {
            let resp = self
                .client
                .post(format!("{}{path}", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .timeout(Duration::from_secs(timeout_secs))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().await.map_err(|e| {
                            PipelineError::Provider(format!("{operation} response read failed: {e}"))
                        });
                    }

                    let text = response.text().await.unwrap_or_default();

                    if status.as_u16() == 400
                        && !stripped_sampling
                        && is_unsupported_parameter(&text)
                    {
                        strip_sampling_parameters(&mut body);
                        stripped_sampling = true;
                        continue;
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        attempt += 1;
                        if attempt > self.max_retries {
                            return Err(PipelineError::Provider(format!(
                                "{operation} API error {status}: {text}"
                            )));
                        }
                        tracing::warn!(%status, attempt, "provider error, retrying {operation}");
                        tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
                        continue;
                    }

                    return Err(PipelineError::Provider(format!(
                        "{operation} API error {status}: {text}"
                    )));
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(PipelineError::timed_out(operation, timeout_secs));
                    }
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(PipelineError::Provider(format!(
                            "{operation} request failed: {e}"
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
                }
            }
        }
    }
}

fn classify_request_error(e: reqwest::Error, operation: &'static str, timeout_secs: u64) -> PipelineError {
    if e.is_timeout() {
        PipelineError::timed_out(operation, timeout_secs)
    } else {
        PipelineError::Provider(format!("{operation} request failed: {e}"))
    }
}

async fn read_json_response(
    response: reqwest::Response,
    operation: &str,
) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(PipelineError::Provider(format!(
            "{operation} API error {status}: {text}"
        )));
    }
    response
        .json()
        .await
        .map_err(|e| PipelineError::Provider(format!("{operation} response read failed: {e}")))
}

/// Pull all output text segments out of a generation response, in order.
fn collect_output_text(json: &serde_json::Value) -> String {
    // Convenience field, present on simple responses
    if let Some(text) = json.get("output_text").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            return text.to_string();
        }
    }
    let mut out = String::new();
    let items = json.get("output").and_then(|v| v.as_array());
    for item in items.into_iter().flatten() {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let content = item.get("content").and_then(|v| v.as_array());
        for piece in content.into_iter().flatten() {
            if piece.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                if let Some(text) = piece.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
        }
    }
    out
}

fn collect_tool_passages(json: &serde_json::Value) -> Vec<ToolPassage> {
    let mut passages = Vec::new();
    let items = json.get("output").and_then(|v| v.as_array());
    for item in items.into_iter().flatten() {
        if item.get("type").and_then(|v| v.as_str()) != Some("file_search_call") {
            continue;
        }
        let results = item.get("results").and_then(|v| v.as_array());
        for result in results.into_iter().flatten() {
            let text = result
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            passages.push(ToolPassage {
                file_id: result
                    .get("file_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                filename: result
                    .get("filename")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                text: text.to_string(),
            });
        }
    }
    passages
}

/// Find the first balanced top-level JSON object in a text blob. Models
/// sometimes wrap their JSON in prose or code fences; callers parse the
/// returned slice instead of the raw response.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_unsupported_parameter(error_body: &str) -> bool {
    let lower = error_body.to_ascii_lowercase();
    lower.contains("unsupported_parameter")
        || lower.contains("unsupported parameter")
        || lower.contains("unsupported value")
}

fn strip_sampling_parameters(body: &mut serde_json::Value) {
    if let Some(map) = body.as_object_mut() {
        for key in ["temperature", "top_p", "presence_penalty", "frequency_penalty"] {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_text_collected_across_messages() {
        let json = serde_json::json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "first "},
                    {"type": "output_text", "text": "second"},
                ]},
            ]
        });
        assert_eq!(collect_output_text(&json), "first second");
    }

    #[test]
    fn output_text_prefers_convenience_field() {
        let json = serde_json::json!({"output_text": "short answer", "output": []});
        assert_eq!(collect_output_text(&json), "short answer");
    }

    #[test]
    fn tool_passages_skip_empty_results() {
        let json = serde_json::json!({
            "output": [
                {"type": "file_search_call", "results": [
                    {"file_id": "file-1", "filename": "agreement.pdf", "text": "custody clause", "score": 0.9},
                    {"file_id": "file-2", "filename": "other.pdf", "text": ""},
                ]},
                {"type": "message", "content": []},
            ]
        });
        let passages = collect_tool_passages(&json);
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].file_id, "file-1");
        assert_eq!(passages[0].filename, "agreement.pdf");
    }

    #[test]
    fn unsupported_parameter_detection() {
        assert!(is_unsupported_parameter(
            r#"{"error":{"code":"unsupported_parameter","param":"temperature"}}"#
        ));
        assert!(is_unsupported_parameter(
            "Unsupported parameter: 'temperature' is not supported with this model."
        ));
        assert!(!is_unsupported_parameter(
            r#"{"error":{"code":"rate_limit_exceeded"}}"#
        ));
    }

    #[test]
    fn first_json_object_tolerates_surrounding_prose() {
        let text = "Here is the answer:\n```json\n{\"a\": {\"b\": \"close } brace in string\"}}\n```\nDone.";
        let found = first_json_object(text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(found).unwrap();
        assert_eq!(
            parsed["a"]["b"].as_str(),
            Some("close } brace in string")
        );
    }

    #[test]
    fn first_json_object_handles_escapes_and_absence() {
        let text = r#"{"quote": "she said \"hi\" {","n": 1}"#;
        let found = first_json_object(text).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(found).is_ok());
        assert!(first_json_object("no json here").is_none());
        assert!(first_json_object("{unterminated").is_none());
    }

    #[test]
    fn sampling_parameters_are_stripped() {
        let mut body = serde_json::json!({
            "model": "m",
            "input": "q",
            "temperature": 0.2,
            "top_p": 0.9,
        });
        strip_sampling_parameters(&mut body);
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert_eq!(body.get("model").and_then(|v| v.as_str()), Some("m"));
    }
}
