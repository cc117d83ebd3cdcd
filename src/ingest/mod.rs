//! End-to-end document onboarding
//!
//! Load, chunk, embed in parallel, then insert atomically. The embedding
//! stage is the only parallel stage; its worker pool is joined before any
//! row is written.

pub mod chunker;
pub mod loader;
pub mod types;

pub use chunker::Chunker;
pub use loader::DocumentLoader;
pub use types::{ChunkMetadata, DocumentChunk, DocumentFormat, IngestOutcome, PageText};

use crate::config::IngestionConfig;
use crate::error::{FileUploadError, RagError, Result};
use crate::llm::OllamaClient;
use crate::store::VectorStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Orchestrates load, chunk, embed, and insert for one document
pub struct IngestionPipeline {
    store: Arc<VectorStore>,
    llm: Arc<OllamaClient>,
    chunker: Chunker,
    config: IngestionConfig,
    embedding_model: String,
    embedding_dim: usize,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<VectorStore>,
        llm: Arc<OllamaClient>,
        chunker: Chunker,
        config: IngestionConfig,
        embedding_model: String,
        embedding_dim: usize,
    ) -> Self {
        Self {
            store,
            llm,
            chunker,
            config,
            embedding_model,
            embedding_dim,
        }
    }

    /// Ingest one document from raw bytes
    ///
    /// Progress messages are sent on `progress` when provided; a closed
    /// receiver does not abort the ingest.
    pub async fn ingest_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
        progress: Option<mpsc::Sender<String>>,
    ) -> Result<IngestOutcome> {
        let format = DocumentFormat::from_filename(filename)
            .ok_or_else(|| FileUploadError::UnsupportedType(filename.to_string()))?;

        if self.store.document_exists(filename).await? {
            return Err(FileUploadError::Duplicate(filename.to_string()).into());
        }

        report(&progress, format!("Loading {filename}")).await;
        let pages = DocumentLoader::load(format, filename, bytes)?;
        debug!("{}: {} pages extracted", filename, pages.len());

        report(&progress, format!("Chunking {filename}")).await;
        let chunks = self.chunker.chunk_pages(&pages)?;
        let chunk_count = chunks.len();
        info!("{}: {} chunks", filename, chunk_count);

        report(
            &progress,
            format!("Embedding {chunk_count} chunks of {filename}"),
        )
        .await;
        let (embedded, failed_count) = self.embed_chunks(chunks, &progress).await?;

        let success_rate = embedded.len() as f32 / chunk_count.max(1) as f32;
        if success_rate < self.config.min_success_rate {
            return Err(RagError::EmbeddingGeneration(format!(
                "{filename}: only {}/{} chunks embedded successfully",
                embedded.len(),
                chunk_count
            )));
        }

        report(&progress, format!("Storing {filename}")).await;
        let document_id = self
            .store
            .insert_document_with_chunks(filename, bytes.len() as i64, &embedded)
            .await?;

        let outcome = IngestOutcome {
            document_id,
            filename: filename.to_string(),
            chunk_count,
            embedded_count: embedded.len(),
            failed_count,
        };
        info!(
            "Ingested {} (document {}): {}/{} chunks stored",
            filename, document_id, outcome.embedded_count, outcome.chunk_count
        );
        Ok(outcome)
    }

    /// Embed all chunks with bounded concurrency, in batches
    ///
    /// Per-chunk failures are collected rather than aborting siblings.
    /// Surviving chunks are re-indexed so stored indices stay contiguous.
    async fn embed_chunks(
        &self,
        chunks: Vec<DocumentChunk>,
        progress: &Option<mpsc::Sender<String>>,
    ) -> Result<(Vec<DocumentChunk>, usize)> {
        let total = chunks.len();
        let timeout = Duration::from_secs(self.config.embed_timeout);
        let mut embedded: Vec<DocumentChunk> = Vec::with_capacity(total);
        let mut failed = 0usize;
        let mut done = 0usize;

        for batch in chunks.chunks(self.config.batch_size.max(1)) {
            let results: Vec<(DocumentChunk, Result<Vec<f32>>)> = stream::iter(batch.to_vec())
                .map(|chunk| {
                    let llm = Arc::clone(&self.llm);
                    let model = self.embedding_model.clone();
                    async move {
                        let result =
                            match tokio::time::timeout(timeout, llm.generate_embedding(&model, &chunk.text))
                                .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(RagError::EmbeddingGeneration(format!(
                                    "chunk {} timed out",
                                    chunk.chunk_index
                                ))),
                            };
                        (chunk, result)
                    }
                })
                .buffered(self.config.max_workers.max(1))
                .collect()
                .await;

            for (mut chunk, result) in results {
                done += 1;
                match result {
                    Ok(embedding) if embedding.len() == self.embedding_dim => {
                        chunk.embedding = embedding;
                        chunk.chunk_index = embedded.len();
                        embedded.push(chunk);
                    }
                    Ok(embedding) => {
                        warn!(
                            "Chunk {} embedding dimension {} != configured {}",
                            chunk.chunk_index,
                            embedding.len(),
                            self.embedding_dim
                        );
                        failed += 1;
                    }
                    Err(e) => {
                        warn!("Chunk {} embedding failed: {}", chunk.chunk_index, e);
                        failed += 1;
                    }
                }
            }

            report(progress, format!("Embedded {done}/{total} chunks")).await;
        }

        Ok((embedded, failed))
    }
}

async fn report(progress: &Option<mpsc::Sender<String>>, message: String) {
    if let Some(tx) = progress {
        // Receiver may have disconnected; ingest continues regardless
        let _ = tx.send(message).await;
    }
}
