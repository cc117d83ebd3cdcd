//! Shared application state
//!
//! One constructed container passed to every handler. The only mutable
//! piece is the active model pointer, guarded by a lock and mirrored to a
//! small JSON state file.

use crate::cache::RagCache;
use crate::chat::ChatOrchestrator;
use crate::config::AppConfig;
use crate::error::Result;
use crate::ingest::{Chunker, IngestionPipeline};
use crate::llm::OllamaClient;
use crate::retrieval::Retriever;
use crate::store::VectorStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Contents of the JSON state file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub active_model: String,
    pub document_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// Shared application state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<VectorStore>,
    pub llm: Arc<OllamaClient>,
    pub cache: Arc<RagCache>,
    pub retriever: Arc<Retriever>,
    pub pipeline: Arc<IngestionPipeline>,
    pub orchestrator: Arc<ChatOrchestrator>,
    active_model: Arc<RwLock<String>>,
    state_file: Arc<PathBuf>,
}

impl AppState {
    /// Construct every service from configuration
    pub async fn new(config: AppConfig) -> Result<Self> {
        let llm = Arc::new(OllamaClient::new(config.llm.clone()));

        let store = Arc::new(
            VectorStore::connect(&config.database, config.llm.embedding_dim).await?,
        );
        let message = store.initialize().await?;
        info!("Vector store: {}", message);

        let cache = Arc::new(RagCache::new(&config.cache).await);

        // Resolve the embedding model against what the Ollama server
        // actually has installed; fall back to the configured name when the
        // server is unreachable.
        let embedding_model = match llm.list_models().await {
            Ok(installed) => OllamaClient::pick_embedding_model(
                &config.llm.preferred_embedding_models,
                &installed,
            )
            .unwrap_or_else(|| config.llm.embedding_model.clone()),
            Err(e) => {
                warn!("Could not list models ({}), using configured embedding model", e);
                config.llm.embedding_model.clone()
            }
        };
        info!("Embedding model: {}", embedding_model);

        let retriever = Arc::new(Retriever::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            Arc::clone(&cache),
            config.retrieval.clone(),
            embedding_model.clone(),
        ));

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            Chunker::new(config.chunking.clone()),
            config.ingestion.clone(),
            embedding_model,
            config.llm.embedding_dim,
        ));

        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::clone(&llm),
            Arc::clone(&retriever),
            config.retrieval.max_context_chars,
            config.llm.default_temperature,
        ));

        let state_file = PathBuf::from(&config.server.state_file);
        let active_model = match load_state(&state_file) {
            Some(state) => {
                info!("Restored state: active model {}", state.active_model);
                state.active_model
            }
            None => config.llm.chat_model.clone(),
        };

        Ok(Self {
            config: Arc::new(config),
            store,
            llm,
            cache,
            retriever,
            pipeline,
            orchestrator,
            active_model: Arc::new(RwLock::new(active_model)),
            state_file: Arc::new(state_file),
        })
    }

    /// Currently selected chat model
    pub async fn active_model(&self) -> String {
        self.active_model.read().await.clone()
    }

    /// Switch the active chat model and persist the change
    pub async fn set_active_model(&self, model: String) {
        {
            let mut current = self.active_model.write().await;
            *current = model;
        }
        self.persist().await;
    }

    /// Write the state file; failures are logged, never fatal
    pub async fn persist(&self) {
        let document_count = self.store.get_document_count().await.unwrap_or(0);
        let state = PersistedState {
            active_model: self.active_model().await,
            document_count,
            last_updated: Utc::now(),
        };

        let path = self.state_file.as_ref().clone();
        let payload = match serde_json::to_vec_pretty(&state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not serialize state: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, payload).await {
            warn!("Could not write state file {}: {}", path.display(), e);
        }
    }
}

fn load_state(path: &PathBuf) -> Option<PersistedState> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("Ignoring unreadable state file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_state_roundtrip() {
        let state = PersistedState {
            active_model: "llama3.2".to_string(),
            document_count: 7,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.active_model, "llama3.2");
        assert_eq!(back.document_count, 7);
    }

    #[test]
    fn test_load_state_missing_file() {
        let path = PathBuf::from("/nonexistent/ragserve_state.json");
        assert!(load_state(&path).is_none());
    }

    #[test]
    fn test_load_state_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(load_state(&path).is_none());
    }
}
