//! Error types for Hark.

use thiserror::Error;

/// Library-level error type for Hark operations.
///
/// Variants map onto the failure taxonomy the pipeline and the query path
/// report to users: invalid input, missing records, transient network or
/// resource trouble, model-endpoint failures, queue saturation, corrupt
/// upstream artifacts, and user cancellation.
#[derive(Error, Debug)]
pub enum HarkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("Model failure: {0}")]
    Model(String),

    #[error("Queue saturated, resubmit later")]
    Backpressure,

    #[error("Duplicate submission: {0}")]
    DuplicateSource(String),

    #[error("Corrupt artifact from stage {stage}: {message}")]
    CorruptArtifact { stage: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Audio download failed: {0}")]
    AudioDownload(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Job store error: {0}")]
    JobStore(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("LLM API error: {0}")]
    OpenAI(String),

    #[error("External tool not found: {0}. Please install it and ensure it's in your PATH.")]
    ToolNotFound(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),
}

impl HarkError {
    /// Whether a failed stage may be retried after backoff.
    ///
    /// Transient network and resource errors retry; model failures retry
    /// until the attempt counter runs out. Everything user-shaped is final.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HarkError::Network(_)
                | HarkError::Resource(_)
                | HarkError::Model(_)
                | HarkError::Http(_)
                | HarkError::OpenAI(_)
                | HarkError::Io(_)
        )
    }

    /// Short taxonomy tag surfaced to users alongside the message.
    pub fn tag(&self) -> &'static str {
        match self {
            HarkError::Config(_) => "config",
            HarkError::InvalidInput(_) => "input-invalid",
            HarkError::NotFound(_) => "not-found",
            HarkError::Network(_) | HarkError::Http(_) => "transient-network",
            HarkError::Resource(_) | HarkError::Io(_) => "transient-resource",
            HarkError::Model(_) | HarkError::OpenAI(_) => "model-failure",
            HarkError::Backpressure => "backpressure",
            HarkError::DuplicateSource(_) => "duplicate-source",
            HarkError::CorruptArtifact { .. } => "corrupt-artifact",
            HarkError::Cancelled => "cancelled",
            HarkError::AudioDownload(_) => "download-failed",
            HarkError::Transcription(_) => "transcription-failed",
            HarkError::Embedding(_) => "embedding-failed",
            HarkError::VectorStore(_) => "vector-store",
            HarkError::JobStore(_) | HarkError::Database(_) => "job-store",
            HarkError::Retrieval(_) => "retrieval",
            HarkError::Json(_) | HarkError::TomlParse(_) => "serialization",
            HarkError::ToolNotFound(_) | HarkError::ToolFailed(_) => "external-tool",
        }
    }

    /// CLI exit code: 1 for user errors, 2 for system errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarkError::InvalidInput(_)
            | HarkError::NotFound(_)
            | HarkError::DuplicateSource(_)
            | HarkError::Backpressure
            | HarkError::Config(_)
            | HarkError::Cancelled => 1,
            _ => 2,
        }
    }
}

/// Result type alias for Hark operations.
pub type Result<T> = std::result::Result<T, HarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriability() {
        assert!(HarkError::Network("timeout".into()).is_retriable());
        assert!(HarkError::Model("5xx".into()).is_retriable());
        assert!(!HarkError::InvalidInput("bad url".into()).is_retriable());
        assert!(!HarkError::Cancelled.is_retriable());
        assert!(!HarkError::Backpressure.is_retriable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(HarkError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(HarkError::Backpressure.exit_code(), 1);
        assert_eq!(HarkError::VectorStore("x".into()).exit_code(), 2);
        assert_eq!(HarkError::Network("x".into()).exit_code(), 2);
    }
}
