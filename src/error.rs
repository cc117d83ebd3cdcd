//! Error handling for the RAG server

use thiserror::Error;

/// Result type alias for the RAG server
pub type Result<T> = std::result::Result<T, RagError>;

/// Main error type for the RAG server
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("File upload error: {0}")]
    FileUpload(#[from] FileUploadError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Document processing error: {0}")]
    DocumentProcessing(String),

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error("Embedding generation error: {0}")]
    EmbeddingGeneration(String),

    #[error("Ollama connection error: {0}")]
    OllamaConnection(#[from] OllamaError),

    #[error("Database connection error: {0}")]
    DatabaseConnection(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the document upload boundary
#[derive(Error, Debug)]
pub enum FileUploadError {
    #[error("Duplicate document: {0} already exists")]
    Duplicate(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Malformed upload: {0}")]
    Malformed(String),
}

/// Errors from the Ollama HTTP adapter
#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout: operation took too long")]
    Timeout,
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => {
                RagError::DatabaseConnection("connection pool exhausted".to_string())
            }
            sqlx::Error::PoolClosed => {
                RagError::DatabaseConnection("connection pool closed".to_string())
            }
            sqlx::Error::Io(e) => RagError::DatabaseConnection(e.to_string()),
            _ => RagError::DatabaseConnection(err.to_string()),
        }
    }
}

impl RagError {
    /// Check if the error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::OllamaConnection(OllamaError::Timeout)
                | RagError::OllamaConnection(OllamaError::ConnectionFailed(_))
                | RagError::DatabaseConnection(_)
        )
    }

    /// Error kind name used in the HTTP error envelope and stream events
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "ValidationError",
            RagError::FileUpload(_) => "FileUploadError",
            RagError::NotFound(_) => "NotFound",
            RagError::RateLimit(_) => "RateLimitExceeded",
            RagError::DocumentProcessing(_) => "DocumentProcessingError",
            RagError::Chunking(_) => "ChunkingError",
            RagError::EmbeddingGeneration(_) => "EmbeddingGenerationError",
            RagError::OllamaConnection(OllamaError::ModelNotFound(_)) => "NotFound",
            RagError::OllamaConnection(_) => "OllamaConnectionError",
            RagError::DatabaseConnection(_) => "DatabaseConnectionError",
            RagError::Search(_) => "SearchError",
            RagError::Config(_) => "ConfigurationError",
            RagError::Io(_) | RagError::Serialization(_) => "InternalError",
        }
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::FileUpload(_) => "file_upload",
            RagError::NotFound(_) => "not_found",
            RagError::RateLimit(_) => "rate_limit",
            RagError::DocumentProcessing(_) => "document_processing",
            RagError::Chunking(_) => "chunking",
            RagError::EmbeddingGeneration(_) => "embedding",
            RagError::OllamaConnection(_) => "ollama",
            RagError::DatabaseConnection(_) => "database",
            RagError::Search(_) => "search",
            RagError::Config(_) => "config",
            RagError::Io(_) => "io",
            RagError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let timeout_error = RagError::OllamaConnection(OllamaError::Timeout);
        assert!(timeout_error.is_retryable());

        let validation_error = RagError::Validation("empty query".to_string());
        assert!(!validation_error.is_retryable());
    }

    #[test]
    fn test_error_category() {
        let ollama_error = RagError::OllamaConnection(OllamaError::Timeout);
        assert_eq!(ollama_error.category(), "ollama");

        let dup = RagError::FileUpload(FileUploadError::Duplicate("a.pdf".to_string()));
        assert_eq!(dup.category(), "file_upload");
    }

    #[test]
    fn test_duplicate_message_names_file() {
        let err = FileUploadError::Duplicate("handbook.md".to_string());
        assert!(err.to_string().contains("handbook.md"));
    }

    #[test]
    fn test_pool_exhaustion_maps_to_database_connection() {
        let err = RagError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, RagError::DatabaseConnection(_)));
        assert_eq!(err.kind(), "DatabaseConnectionError");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(RagError::Validation("x".into()).kind(), "ValidationError");
        assert_eq!(
            RagError::OllamaConnection(OllamaError::ModelNotFound("m".into())).kind(),
            "NotFound"
        );
        assert_eq!(
            RagError::EmbeddingGeneration("x".into()).kind(),
            "EmbeddingGenerationError"
        );
    }
}
