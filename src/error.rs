//! Pipeline error taxonomy.
//!
//! Ingest jobs persist the `Display` text of these errors verbatim into the
//! job's `error` column, so the messages here are user-facing. The split that
//! matters operationally is [`PipelineError::is_terminal`]: terminal errors
//! reproduce deterministically on retry (bad input), everything else is
//! transient (network, provider, timeout) and worth re-running.

use thiserror::Error;

/// Errors raised by the ingestion and synthesis pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// File extension has no extractor. Terminal.
    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    /// Source document is password-protected. Terminal; retrying without
    /// credentials reproduces the same failure.
    #[error("This document is password-protected or encrypted")]
    EncryptedDocument,

    /// A supported format failed to parse.
    #[error("extraction failed: {0}")]
    Extract(String),

    /// Byte-store put/fetch failure.
    #[error("byte store error: {0}")]
    Blob(String),

    /// Generative/embedding provider returned an error.
    #[error("provider error: {0}")]
    Provider(String),

    /// An external call exceeded its budget. Distinguishable so callers can
    /// degrade instead of failing hard.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    /// Provider output failed strict schema validation.
    #[error("schema validation failed: {0}")]
    Validation(String),

    /// The per-case memory rebuild lock is held by another caller.
    #[error("memory rebuild already in progress")]
    RebuildInProgress,

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl PipelineError {
    /// True when retrying the same input deterministically reproduces the
    /// failure. The batch driver still re-selects `error` jobs; this flag
    /// drives logging and the human-readable retry hint, not selection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedFormat(_)
                | PipelineError::EncryptedDocument
                | PipelineError::Extract(_)
                | PipelineError::Validation(_)
        )
    }

    /// Timeout constructor used at every bounded await point.
    pub fn timed_out(operation: &'static str, seconds: u64) -> Self {
        PipelineError::Timeout { operation, seconds }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_message_includes_extension() {
        let err = PipelineError::UnsupportedFormat(".rar".to_string());
        assert_eq!(err.to_string(), "Unsupported file type: .rar");
        assert!(err.is_terminal());
    }

    #[test]
    fn encrypted_message_names_both_conditions() {
        let err = PipelineError::EncryptedDocument;
        assert!(err.to_string().contains("password-protected or encrypted"));
        assert!(err.is_terminal());
    }

    #[test]
    fn timeouts_are_transient() {
        let err = PipelineError::timed_out("blob fetch", 20);
        assert_eq!(err.to_string(), "blob fetch timed out after 20s");
        assert!(!err.is_terminal());
    }
}
