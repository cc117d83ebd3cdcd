//! REST API for the RAG server
//!
//! Provides HTTP endpoints for:
//! - Document ingestion, listing, retrieval tests
//! - Streaming chat with optional retrieval augmentation
//! - Model management against the Ollama server
//! - Health and status monitoring
//!
//! This is the only layer that converts error kinds to HTTP statuses.
//! Streaming endpoints that have already started emit a terminal error
//! event instead.

use crate::config::ServerConfig;
use crate::error::{FileUploadError, OllamaError, RagError};
use crate::llm::{assistant_message, user_message, Message, StreamEvent};
use crate::state::AppState;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::sse::{Event, Sse},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

/// Upper bound for a whole multipart upload body
const MAX_UPLOAD_BODY: usize = 128 * 1024 * 1024;

/// Characters of chunk text returned as a retrieval preview
const PREVIEW_CHARS: usize = 200;

const MAX_MESSAGE_CHARS: usize = 5000;
const MAX_HISTORY_ENTRIES: usize = 50;
const MAX_HISTORY_CONTENT_CHARS: usize = 10_000;

// ============= Request/response types =============

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Health status
    #[schema(example = "ok")]
    pub status: String,
    /// Server version
    #[schema(example = "0.3.0")]
    pub version: String,
    /// Time the check was answered
    pub timestamp: chrono::DateTime<Utc>,
}

/// Subsystem status response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    /// Whether the Ollama server answered
    pub ollama_ok: bool,
    /// Whether the database answered
    pub db_ok: bool,
    /// Currently selected chat model
    #[schema(example = "llama3.2")]
    pub active_model: String,
    /// Number of stored documents
    pub document_count: i64,
}

/// An installed model
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModelEntry {
    /// Model name as reported by Ollama
    #[schema(example = "llama3.2")]
    pub name: String,
    /// Model size in bytes, when reported
    pub size: Option<u64>,
}

/// Installed models response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModelsResponse {
    /// Models installed on the Ollama server
    pub models: Vec<ModelEntry>,
}

/// Request naming a model
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ModelRequest {
    /// Model name
    #[schema(example = "llama3.2")]
    pub model: String,
}

/// Active model response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ActiveModelResponse {
    /// The model now used for chat
    pub active_model: String,
}

/// Model test response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TestModelResponse {
    /// Whether the model produced output
    pub ok: bool,
    /// Sample text from the model
    pub sample: String,
}

/// Generic acknowledgement
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OkResponse {
    /// Whether the operation succeeded
    pub ok: bool,
}

/// A stored document
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentEntry {
    /// Store-assigned document id
    pub id: i64,
    /// Unique filename
    #[schema(example = "handbook.md")]
    pub filename: String,
    /// Original file size in bytes
    pub file_size: i64,
    /// Time of first ingest
    pub created_at: chrono::DateTime<Utc>,
    /// Number of chunks stored for this document
    pub chunk_count: i64,
}

/// Stored documents response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentsResponse {
    /// All stored documents, newest first
    pub documents: Vec<DocumentEntry>,
}

/// Retrieval test request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetrieveRequest {
    /// The query to retrieve for
    #[schema(example = "backup window")]
    pub query: String,
    /// Maximum results to return (1..100)
    #[serde(default)]
    #[schema(example = 5)]
    pub top_k: Option<usize>,
    /// Restrict results to one file type, e.g. "pdf"
    #[serde(default)]
    pub file_type: Option<String>,
}

/// One retrieval hit
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetrieveHit {
    /// Source document filename
    pub filename: String,
    /// 0-based chunk position within the document
    pub chunk_index: usize,
    /// Cosine similarity in [0, 1]
    pub similarity: f32,
    /// Leading characters of the chunk text
    pub preview: String,
    /// Full chunk length in bytes
    pub length: usize,
    /// 1-based page the chunk starts on, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    /// Section heading the chunk falls under, when detected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
}

/// Retrieval test response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RetrieveResponse {
    /// Hits in final ranking order
    pub results: Vec<RetrieveHit>,
}

/// One prior conversation turn
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryEntry {
    /// Either "user" or "assistant"
    #[schema(example = "user")]
    pub role: String,
    /// Message text
    pub content: String,
}

/// Chat request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatRequest {
    /// The user's message
    #[schema(example = "What is the backup window?")]
    pub message: String,
    /// Augment the prompt with retrieved context
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
    /// Prior turns, oldest first
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

fn default_use_rag() -> bool {
    true
}

/// Error envelope
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error kind, e.g. "ValidationError"
    pub error: String,
    /// Human-readable description
    pub message: String,
    /// Additional structured context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ============= Error conversion =============

/// Wrapper converting domain errors into the HTTP envelope
#[derive(Debug)]
pub struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        ApiError(err)
    }
}

impl From<FileUploadError> for ApiError {
    fn from(err: FileUploadError) -> Self {
        ApiError(err.into())
    }
}

/// Error kind name and HTTP status for an error
fn kind_and_status(err: &RagError) -> (&'static str, StatusCode) {
    let status = match err {
        RagError::Validation(_) => StatusCode::BAD_REQUEST,
        RagError::FileUpload(FileUploadError::Duplicate(_)) => StatusCode::CONFLICT,
        RagError::FileUpload(_) => StatusCode::BAD_REQUEST,
        RagError::NotFound(_) => StatusCode::NOT_FOUND,
        RagError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        RagError::DocumentProcessing(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RagError::Chunking(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RagError::EmbeddingGeneration(_) => StatusCode::BAD_GATEWAY,
        RagError::OllamaConnection(OllamaError::ModelNotFound(_)) => StatusCode::NOT_FOUND,
        RagError::OllamaConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
        RagError::DatabaseConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
        RagError::Search(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RagError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RagError::Io(_) | RagError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (err.kind(), status)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (kind, status) = kind_and_status(&self.0);
        if status.is_server_error() {
            error!("{}: {}", kind, self.0);
        }
        let body = Json(ErrorResponse {
            error: kind.to_string(),
            message: self.0.to_string(),
            details: None,
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Terminal event payload for streams that fail mid-flight
fn error_frame(err: &RagError) -> serde_json::Value {
    let (kind, _) = kind_and_status(err);
    serde_json::json!({ "error": kind, "message": err.to_string() })
}

// ============= SSE plumbing =============

fn sse_headers() -> AppendHeaders<[(&'static str, &'static str); 2]> {
    AppendHeaders([
        ("cache-control", "no-cache"),
        ("x-accel-buffering", "no"),
    ])
}

fn sse_json(value: &serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

fn sse_response(
    stream: impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static,
) -> impl IntoResponse {
    (sse_headers(), Sse::new(stream))
}

// ============= OpenAPI =============

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        status_handler,
        list_models_handler,
        set_active_model_handler,
        delete_model_handler,
        test_model_handler,
        list_documents_handler,
        retrieve_handler,
        delete_document_handler,
        clear_documents_handler,
    ),
    components(schemas(
        HealthResponse,
        StatusResponse,
        ModelEntry,
        ModelsResponse,
        ModelRequest,
        ActiveModelResponse,
        TestModelResponse,
        OkResponse,
        DocumentEntry,
        DocumentsResponse,
        RetrieveRequest,
        RetrieveHit,
        RetrieveResponse,
        HistoryEntry,
        ChatRequest,
        ErrorResponse,
    )),
    tags(
        (name = "health", description = "Health and status"),
        (name = "models", description = "Model management"),
        (name = "documents", description = "Document ingestion and retrieval"),
    ),
    info(
        title = "ragserve API",
        description = "Local retrieval-augmented generation server"
    )
)]
struct ApiDoc;

// ============= Router =============

/// CORS layer per the server configuration
///
/// A configured origin list restricts cross-origin access to those
/// origins; an enabled flag with no origins allows any.
fn cors_layer(server: &ServerConfig) -> Option<CorsLayer> {
    if !server.cors_enabled {
        return None;
    }

    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        Some(CorsLayer::permissive())
    } else {
        Some(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any),
        )
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/models", get(list_models_handler))
        .route("/api/models/active", post(set_active_model_handler))
        .route("/api/models/pull", post(pull_model_handler))
        .route("/api/models/delete", delete(delete_model_handler))
        .route("/api/models/test", post(test_model_handler))
        .route("/api/documents/list", get(list_documents_handler))
        .route("/api/documents/upload", post(upload_handler))
        .route("/api/documents/test", post(retrieve_handler))
        .route("/api/documents/clear", delete(clear_documents_handler))
        .route("/api/documents/{id}", delete(delete_document_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api-docs/openapi.json", get(openapi_spec_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY))
        .with_state(state);

    let router = match cors {
        Some(layer) => router.layer(layer),
        None => router,
    };

    router.layer(TraceLayer::new_for_http())
}

async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// ============= Handlers =============

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        timestamp: Utc::now(),
    })
}

/// Subsystem status
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "health",
    responses((status = 200, description = "Subsystem status", body = StatusResponse))
)]
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let (ollama_ok, _) = state.llm.check_connection().await;
    let (db_ok, document_count) = match state.store.get_document_count().await {
        Ok(count) => (true, count),
        Err(_) => (false, 0),
    };

    Json(StatusResponse {
        ollama_ok,
        db_ok,
        active_model: state.active_model().await,
        document_count,
    })
}

/// List installed models
#[utoipa::path(
    get,
    path = "/api/models",
    tag = "models",
    responses(
        (status = 200, description = "Installed models", body = ModelsResponse),
        (status = 503, description = "Ollama unreachable", body = ErrorResponse)
    )
)]
async fn list_models_handler(State(state): State<AppState>) -> ApiResult<Json<ModelsResponse>> {
    let models = state.llm.list_models().await?;
    Ok(Json(ModelsResponse {
        models: models
            .into_iter()
            .map(|m| ModelEntry {
                name: m.name,
                size: m.size,
            })
            .collect(),
    }))
}

/// Select the active chat model
#[utoipa::path(
    post,
    path = "/api/models/active",
    tag = "models",
    request_body = ModelRequest,
    responses(
        (status = 200, description = "Active model changed", body = ActiveModelResponse),
        (status = 404, description = "Model not installed", body = ErrorResponse)
    )
)]
async fn set_active_model_handler(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> ApiResult<Json<ActiveModelResponse>> {
    if request.model.trim().is_empty() {
        return Err(RagError::Validation("model name is empty".to_string()).into());
    }

    let installed = state.llm.list_models().await?;
    if !installed.iter().any(|m| m.name == request.model) {
        return Err(RagError::NotFound(format!("model {}", request.model)).into());
    }

    info!("Switching active model to {}", request.model);
    state.set_active_model(request.model.clone()).await;
    Ok(Json(ActiveModelResponse {
        active_model: request.model,
    }))
}

/// Pull a model, streaming progress as SSE
async fn pull_model_handler(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.model.trim().is_empty() {
        return Err(RagError::Validation("model name is empty".to_string()).into());
    }

    let mut rx = state.llm.pull_model(&request.model).await?;

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let frame = match event {
                StreamEvent::Fragment(status) => serde_json::json!({ "status": status }),
                StreamEvent::Done => serde_json::json!({ "done": true }),
                StreamEvent::Error(message) => serde_json::json!({
                    "error": "OllamaConnectionError",
                    "message": message,
                }),
            };
            let terminal = frame.get("done").is_some() || frame.get("error").is_some();
            yield Ok::<_, Infallible>(sse_json(&frame));
            if terminal {
                break;
            }
        }
    };

    Ok(sse_response(stream))
}

/// Delete an installed model
#[utoipa::path(
    delete,
    path = "/api/models/delete",
    tag = "models",
    request_body = ModelRequest,
    responses(
        (status = 200, description = "Model deleted", body = OkResponse),
        (status = 404, description = "Model not installed", body = ErrorResponse)
    )
)]
async fn delete_model_handler(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> ApiResult<Json<OkResponse>> {
    state.llm.delete_model(&request.model).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// Run a short prompt against a model
#[utoipa::path(
    post,
    path = "/api/models/test",
    tag = "models",
    request_body = ModelRequest,
    responses((status = 200, description = "Sample output", body = TestModelResponse))
)]
async fn test_model_handler(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> ApiResult<Json<TestModelResponse>> {
    let sample = state
        .llm
        .test_model(&request.model, "Reply with one short sentence confirming you work.")
        .await?;
    Ok(Json(TestModelResponse { ok: true, sample }))
}

/// List stored documents
#[utoipa::path(
    get,
    path = "/api/documents/list",
    tag = "documents",
    responses((status = 200, description = "Stored documents", body = DocumentsResponse))
)]
async fn list_documents_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<DocumentsResponse>> {
    let documents = state.store.get_all_documents().await?;
    Ok(Json(DocumentsResponse {
        documents: documents
            .into_iter()
            .map(|d| DocumentEntry {
                id: d.id,
                filename: d.filename,
                file_size: d.file_size,
                created_at: d.created_at,
                chunk_count: d.chunk_count,
            })
            .collect(),
    }))
}

/// Retrieval test: run a query through the retriever
#[utoipa::path(
    post,
    path = "/api/documents/test",
    tag = "documents",
    request_body = RetrieveRequest,
    responses(
        (status = 200, description = "Ranked results", body = RetrieveResponse),
        (status = 400, description = "Invalid query", body = ErrorResponse)
    )
)]
async fn retrieve_handler(
    State(state): State<AppState>,
    Json(request): Json<RetrieveRequest>,
) -> ApiResult<Json<RetrieveResponse>> {
    if request.query.trim().is_empty() || request.query.chars().count() > MAX_MESSAGE_CHARS {
        return Err(
            RagError::Validation(format!("query must be 1..{MAX_MESSAGE_CHARS} characters")).into(),
        );
    }
    if let Some(top_k) = request.top_k {
        if !(1..=100).contains(&top_k) {
            return Err(RagError::Validation("top_k must be 1..100".to_string()).into());
        }
    }

    let results = state
        .retriever
        .retrieve(&request.query, request.top_k, request.file_type.as_deref())
        .await?;

    Ok(Json(RetrieveResponse {
        results: results
            .into_iter()
            .map(|r| RetrieveHit {
                preview: r.chunk_text.chars().take(PREVIEW_CHARS).collect(),
                length: r.chunk_text.len(),
                filename: r.filename,
                chunk_index: r.chunk_index,
                similarity: r.similarity,
                page_number: r.metadata.page_number,
                section_title: r.metadata.section_title,
            })
            .collect(),
    }))
}

/// Upload documents, streaming per-file progress as SSE
///
/// Every file is validated (extension, size, duplicate) before the stream
/// starts, so boundary failures keep their HTTP status.
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let max_size = state.config.ingestion.max_file_size;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RagError::FileUpload(FileUploadError::Malformed(e.to_string())))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RagError::FileUpload(FileUploadError::Malformed(e.to_string())))?;
        files.push((filename, bytes.to_vec()));
    }

    if files.is_empty() {
        return Err(RagError::Validation("no files in upload".to_string()).into());
    }

    for (filename, bytes) in &files {
        if crate::ingest::DocumentFormat::from_filename(filename).is_none() {
            return Err(FileUploadError::UnsupportedType(filename.clone()).into());
        }
        if bytes.len() as u64 > max_size {
            return Err(FileUploadError::TooLarge {
                size: bytes.len() as u64,
                limit: max_size,
            }
            .into());
        }
        if state.store.document_exists(filename).await? {
            return Err(FileUploadError::Duplicate(filename.clone()).into());
        }
    }

    let stream = async_stream::stream! {
        let mut ingested = 0usize;
        let mut failed = 0usize;

        for (filename, bytes) in files {
            yield Ok::<_, Infallible>(sse_json(
                &serde_json::json!({ "message": format!("Processing {filename}") }),
            ));

            let (ptx, mut prx) = tokio::sync::mpsc::channel::<String>(16);
            let pipeline = Arc::clone(&state.pipeline);
            let name = filename.clone();
            let mut task = tokio::spawn(async move {
                pipeline.ingest_bytes(&name, &bytes, Some(ptx)).await
            });

            loop {
                tokio::select! {
                    Some(message) = prx.recv() => {
                        yield Ok(sse_json(&serde_json::json!({ "message": message })));
                    }
                    joined = &mut task => {
                        while let Ok(message) = prx.try_recv() {
                            yield Ok(sse_json(&serde_json::json!({ "message": message })));
                        }
                        match joined {
                            Ok(Ok(outcome)) => {
                                ingested += 1;
                                yield Ok(sse_json(&serde_json::json!({ "result": outcome })));
                            }
                            Ok(Err(e)) => {
                                failed += 1;
                                let mut frame = error_frame(&e);
                                frame["filename"] = serde_json::json!(filename);
                                yield Ok(sse_json(&frame));
                            }
                            Err(e) => {
                                failed += 1;
                                yield Ok(sse_json(&serde_json::json!({
                                    "error": "InternalError",
                                    "message": e.to_string(),
                                    "filename": filename,
                                })));
                            }
                        }
                        break;
                    }
                }
            }
        }

        state.persist().await;
        yield Ok(sse_json(&serde_json::json!({
            "done": true,
            "ingested": ingested,
            "failed": failed,
        })));
    };

    Ok(sse_response(stream))
}

/// Delete one document and its chunks
#[utoipa::path(
    delete,
    path = "/api/documents/{id}",
    tag = "documents",
    params(("id" = i64, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document deleted", body = OkResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    )
)]
async fn delete_document_handler(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    let deleted = state.store.delete_document(id).await?;
    if !deleted {
        return Err(RagError::NotFound(format!("document {id}")).into());
    }
    state.cache.clear().await;
    state.persist().await;
    Ok(Json(OkResponse { ok: true }))
}

/// Delete every stored document
#[utoipa::path(
    delete,
    path = "/api/documents/clear",
    tag = "documents",
    responses((status = 200, description = "Store cleared", body = OkResponse))
)]
async fn clear_documents_handler(
    State(state): State<AppState>,
) -> ApiResult<Json<OkResponse>> {
    let removed = state.store.delete_all_documents().await?;
    state.cache.clear().await;
    state.persist().await;
    info!("Cleared {} documents via API", removed);
    Ok(Json(OkResponse { ok: true }))
}

fn validate_chat(request: &ChatRequest) -> Result<Vec<Message>, RagError> {
    let message_chars = request.message.chars().count();
    if message_chars == 0 || message_chars > MAX_MESSAGE_CHARS {
        return Err(RagError::Validation(format!(
            "message must be 1..{MAX_MESSAGE_CHARS} characters"
        )));
    }

    if request.history.len() > MAX_HISTORY_ENTRIES {
        return Err(RagError::Validation(format!(
            "history exceeds {MAX_HISTORY_ENTRIES} entries"
        )));
    }

    let mut history = Vec::with_capacity(request.history.len());
    for entry in &request.history {
        let content_chars = entry.content.chars().count();
        if content_chars == 0 || content_chars > MAX_HISTORY_CONTENT_CHARS {
            return Err(RagError::Validation(format!(
                "history content must be 1..{MAX_HISTORY_CONTENT_CHARS} characters"
            )));
        }
        match entry.role.as_str() {
            "user" => history.push(user_message(entry.content.clone())),
            "assistant" => history.push(assistant_message(entry.content.clone())),
            other => {
                return Err(RagError::Validation(format!(
                    "history role must be user or assistant, got {other}"
                )))
            }
        }
    }

    Ok(history)
}

/// Chat endpoint, streaming tokens as SSE
async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let history = validate_chat(&request)?;
    let model = state.active_model().await;

    let mut rx = state
        .orchestrator
        .chat(model, request.message, history, request.use_rag);

    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            let terminal = frame.get("done").is_some() || frame.get("error").is_some();
            yield Ok::<_, Infallible>(sse_json(&frame));
            if terminal {
                break;
            }
        }
    };

    Ok(sse_response(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(message: &str, history: Vec<HistoryEntry>) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            use_rag: true,
            history,
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let cases: Vec<(RagError, &str, StatusCode)> = vec![
            (
                RagError::Validation("x".into()),
                "ValidationError",
                StatusCode::BAD_REQUEST,
            ),
            (
                FileUploadError::Duplicate("a.md".into()).into(),
                "FileUploadError",
                StatusCode::CONFLICT,
            ),
            (
                FileUploadError::UnsupportedType("a.exe".into()).into(),
                "FileUploadError",
                StatusCode::BAD_REQUEST,
            ),
            (
                RagError::DocumentProcessing("x".into()),
                "DocumentProcessingError",
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                RagError::EmbeddingGeneration("x".into()),
                "EmbeddingGenerationError",
                StatusCode::BAD_GATEWAY,
            ),
            (
                OllamaError::ConnectionFailed("x".into()).into(),
                "OllamaConnectionError",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RagError::DatabaseConnection("x".into()),
                "DatabaseConnectionError",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RagError::Search("x".into()),
                "SearchError",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, kind, status) in cases {
            let (k, s) = kind_and_status(&err);
            assert_eq!(k, kind);
            assert_eq!(s, status);
        }
    }

    #[test]
    fn test_model_not_found_maps_to_404() {
        let err: RagError = OllamaError::ModelNotFound("ghost".into()).into();
        let (kind, status) = kind_and_status(&err);
        assert_eq!(kind, "NotFound");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validate_chat_bounds() {
        assert!(validate_chat(&chat_request("hello", vec![])).is_ok());
        assert!(validate_chat(&chat_request("", vec![])).is_err());
        assert!(validate_chat(&chat_request(&"x".repeat(5001), vec![])).is_err());

        let too_many: Vec<HistoryEntry> = (0..51)
            .map(|_| HistoryEntry {
                role: "user".to_string(),
                content: "hi".to_string(),
            })
            .collect();
        assert!(validate_chat(&chat_request("hello", too_many)).is_err());
    }

    #[test]
    fn test_validate_chat_rejects_bad_roles() {
        let bad_role = vec![HistoryEntry {
            role: "system".to_string(),
            content: "sneaky".to_string(),
        }];
        assert!(validate_chat(&chat_request("hello", bad_role)).is_err());

        let ok = vec![
            HistoryEntry {
                role: "user".to_string(),
                content: "q".to_string(),
            },
            HistoryEntry {
                role: "assistant".to_string(),
                content: "a".to_string(),
            },
        ];
        let history = validate_chat(&chat_request("hello", ok)).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_cors_layer_selection() {
        let mut server = ServerConfig::default();
        assert!(cors_layer(&server).is_none(), "disabled CORS adds no layer");

        server.cors_enabled = true;
        assert!(cors_layer(&server).is_some(), "enabled with no origins is permissive");

        server.cors_origins = vec!["https://app.example.com".to_string()];
        assert!(cors_layer(&server).is_some(), "origin allowlist builds a layer");
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = error_frame(&RagError::Search("index gone".into()));
        assert_eq!(frame["error"], "SearchError");
        assert!(frame["message"].as_str().unwrap().contains("index gone"));
    }

    #[test]
    fn test_chat_request_defaults() {
        let parsed: ChatRequest =
            serde_json::from_str(r#"{"message": "hello"}"#).unwrap();
        assert!(parsed.use_rag);
        assert!(parsed.history.is_empty());
    }
}
