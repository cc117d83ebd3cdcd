//! Local RAG Server Library
//!
//! A single-node retrieval-augmented generation server that integrates:
//! - Ollama for chat generation and embeddings
//! - PostgreSQL + pgvector for durable chunk storage and k-NN search
//! - Table-aware multi-format document ingestion (PDF, DOCX, Markdown, text)
//! - Hybrid retrieval with multi-signal re-ranking and diversity filtering
//! - SSE streaming of chat tokens under a strict context-only prompt
//!
//! # Example
//!
//! ```rust,no_run
//! use ragserve::{api, config::AppConfig, state::AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::resolve(None)?;
//!     let addr = format!("{}:{}", config.server.host, config.server.port);
//!     let state = AppState::new(config).await?;
//!     let router = api::create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind(&addr).await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod retrieval;
pub mod state;
pub mod store;

// Re-export main types
pub use cache::{CacheBackend, MemoryBackend, RagCache, RedisBackend};
pub use chat::{ChatOrchestrator, RAG_SYSTEM_PROMPT, REFUSAL_PHRASE};
pub use config::AppConfig;
pub use context::ContextFormatter;
pub use error::{FileUploadError, OllamaError, RagError, Result};
pub use ingest::{
    Chunker, DocumentChunk, DocumentFormat, DocumentLoader, IngestOutcome, IngestionPipeline,
};
pub use llm::{Message, ModelInfo, OllamaClient, Role, StreamEvent};
pub use retrieval::Retriever;
pub use state::AppState;
pub use store::{DocumentRecord, RetrievalResult, VectorStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
