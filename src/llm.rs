//! Ollama LLM and embedding adapter
//!
//! Thin typed client over the Ollama HTTP API. Nothing is retried here;
//! callers decide what a failure means.

use crate::config::LlmConfig;
use crate::error::{OllamaError, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Message role in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// An installed model as reported by the Ollama server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// One event on a streaming chat or pull channel
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A content fragment (chat) or status line (pull)
    Fragment(String),
    /// The upstream marked the stream complete
    Done,
    /// The upstream failed; no further fragments follow
    Error(String),
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<MessageFragment>,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct MessageFragment {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
struct ModelNameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
}

/// Ollama client over reqwest
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// Get the base URL for API calls
    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout)
    }

    /// Check that the Ollama server answers; returns its version string
    pub async fn check_connection(&self) -> (bool, String) {
        let url = self.api_url("version");

        let response = match timeout(Duration::from_secs(5), self.client.get(&url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return (false, format!("Ollama unreachable: {e}")),
            Err(_) => return (false, "Ollama connection timed out".to_string()),
        };

        if !response.status().is_success() {
            return (false, format!("Ollama returned HTTP {}", response.status()));
        }

        match response.json::<VersionResponse>().await {
            Ok(v) => (true, format!("Ollama {}", v.version)),
            Err(e) => (false, format!("Invalid version response: {e}")),
        }
    }

    /// List models installed on the Ollama server
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        debug!("Listing available models");
        let url = self.api_url("tags");

        let response = timeout(self.request_timeout(), self.client.get(&url).send())
            .await
            .map_err(|_| OllamaError::Timeout)?
            .map_err(|e| OllamaError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OllamaError::GenerationFailed(error_text).into());
        }

        let models_response: ModelsResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse(e.to_string()))?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    /// Choose an embedding model from the installed set
    ///
    /// Preference order: exact match on a preferred name, then prefix
    /// match, then any model whose name contains "embed".
    pub fn pick_embedding_model(
        preferred: &[String],
        installed: &[ModelInfo],
    ) -> Option<String> {
        for want in preferred {
            if let Some(m) = installed.iter().find(|m| &m.name == want) {
                return Some(m.name.clone());
            }
        }
        for want in preferred {
            if let Some(m) = installed.iter().find(|m| m.name.starts_with(want.as_str())) {
                return Some(m.name.clone());
            }
        }
        installed
            .iter()
            .find(|m| m.name.to_lowercase().contains("embed"))
            .map(|m| m.name.clone())
    }

    /// Generate an embedding for a single text
    pub async fn generate_embedding(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(OllamaError::EmbeddingFailed("empty input text".to_string()).into());
        }

        debug!("Generating embedding for text of length {}", text.len());

        let request = EmbedRequest {
            model: model.to_string(),
            prompt: text.to_string(),
        };

        let url = self.api_url("embeddings");

        let response = timeout(
            self.request_timeout(),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| OllamaError::Timeout)?
        .map_err(|e| OllamaError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Ollama embedding API error: {}", error_text);
            return Err(OllamaError::EmbeddingFailed(error_text).into());
        }

        let embed_response: EmbedResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse(e.to_string()))?;

        if embed_response.embedding.is_empty() {
            return Err(
                OllamaError::EmbeddingFailed("model returned empty embedding".to_string()).into(),
            );
        }

        Ok(embed_response.embedding)
    }

    /// Stream a chat completion, yielding content fragments as they arrive
    ///
    /// The receiver closes after a `Done` or `Error` event. Dropping the
    /// receiver cancels the upstream request.
    pub async fn generate_chat_response(
        &self,
        model: &str,
        messages: Vec<Message>,
        temperature: f32,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        debug!("Streaming chat with {} messages", messages.len());

        let request = ChatRequest {
            model: model.to_string(),
            messages,
            stream: true,
            options: ChatOptions { temperature },
        };

        let url = self.api_url("chat");

        let response = timeout(
            self.request_timeout(),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| OllamaError::Timeout)?
        .map_err(|e| OllamaError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Ollama chat API error: {}", error_text);
            return Err(OllamaError::GenerationFailed(error_text).into());
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                // Ollama streams one JSON object per line
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<ChatResponse>(line) {
                        Ok(chunk) => {
                            if let Some(message) = chunk.message {
                                if !message.content.is_empty()
                                    && tx
                                        .send(StreamEvent::Fragment(message.content))
                                        .await
                                        .is_err()
                                {
                                    // Receiver gone: client disconnected
                                    return;
                                }
                            }
                            if chunk.done {
                                let _ = tx.send(StreamEvent::Done).await;
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Unparseable chat fragment: {}", e);
                            let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                            return;
                        }
                    }
                }
            }

            // Stream ended without a done marker
            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(rx)
    }

    /// One-shot, non-streaming generation used by the model test endpoint
    pub async fn test_model(&self, model: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![user_message(prompt)],
            stream: false,
            options: ChatOptions {
                temperature: self.config.default_temperature,
            },
        };

        let url = self.api_url("chat");

        let response = timeout(
            self.request_timeout(),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| OllamaError::Timeout)?
        .map_err(|e| OllamaError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(OllamaError::ModelNotFound(model.to_string()).into());
            }
            return Err(OllamaError::GenerationFailed(error_text).into());
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::InvalidResponse(e.to_string()))?;

        Ok(chat_response
            .message
            .map(|m| m.content)
            .unwrap_or_default())
    }

    /// Pull a model, streaming progress lines until completion
    ///
    /// The underlying connection has no overall deadline; dropping the
    /// receiver cancels the download request.
    pub async fn pull_model(&self, model: &str) -> Result<mpsc::Receiver<StreamEvent>> {
        info!("Pulling model {}", model);

        let request = ModelNameRequest {
            name: model.to_string(),
        };
        let url = self.api_url("pull");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OllamaError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OllamaError::GenerationFailed(error_text).into());
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let progress: PullProgress = match serde_json::from_str(line) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let status = match (progress.completed, progress.total) {
                        (Some(done), Some(total)) if total > 0 => {
                            format!("{} ({done}/{total})", progress.status)
                        }
                        _ => progress.status.clone(),
                    };

                    if tx.send(StreamEvent::Fragment(status)).await.is_err() {
                        return;
                    }
                    if progress.status == "success" {
                        let _ = tx.send(StreamEvent::Done).await;
                        return;
                    }
                }
            }

            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(rx)
    }

    /// Delete an installed model
    pub async fn delete_model(&self, model: &str) -> Result<()> {
        info!("Deleting model {}", model);

        let request = ModelNameRequest {
            name: model.to_string(),
        };
        let url = self.api_url("delete");

        let response = timeout(
            self.request_timeout(),
            self.client.delete(&url).json(&request).send(),
        )
        .await
        .map_err(|_| OllamaError::Timeout)?
        .map_err(|e| OllamaError::ConnectionFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OllamaError::ModelNotFound(model.to_string()).into());
        }

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(OllamaError::GenerationFailed(error_text).into());
        }

        Ok(())
    }
}

/// Helper function to create a system message
pub fn system_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::System,
        content: content.into(),
    }
}

/// Helper function to create a user message
pub fn user_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: content.into(),
    }
}

/// Helper function to create an assistant message
pub fn assistant_message(content: impl Into<String>) -> Message {
    Message {
        role: Role::Assistant,
        content: content.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> OllamaClient {
        let config = LlmConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        OllamaClient::new(config)
    }

    #[test]
    fn test_message_creation() {
        let system_msg = system_message("Answer only from the context");
        assert_eq!(system_msg.role, Role::System);

        let user_msg = user_message("Hello");
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.content, "Hello");
    }

    #[test]
    fn test_api_url_generation() {
        let client = test_client("http://localhost:11434/");
        assert_eq!(client.api_url("chat"), "http://localhost:11434/api/chat");
        assert_eq!(
            client.api_url("embeddings"),
            "http://localhost:11434/api/embeddings"
        );
    }

    #[test]
    fn test_pick_embedding_model_exact_then_prefix_then_contains() {
        let installed = vec![
            ModelInfo {
                name: "llama3.2".to_string(),
                size: None,
            },
            ModelInfo {
                name: "nomic-embed-text:latest".to_string(),
                size: None,
            },
        ];

        // Prefix match
        let picked = OllamaClient::pick_embedding_model(
            &["nomic-embed-text".to_string()],
            &installed,
        );
        assert_eq!(picked.as_deref(), Some("nomic-embed-text:latest"));

        // Falls back to any name containing "embed"
        let picked =
            OllamaClient::pick_embedding_model(&["mxbai-embed-large".to_string()], &installed);
        assert_eq!(picked.as_deref(), Some("nomic-embed-text:latest"));

        // Nothing suitable
        let none = OllamaClient::pick_embedding_model(
            &["whatever".to_string()],
            &[ModelInfo {
                name: "llama3.2".to_string(),
                size: None,
            }],
        );
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_generate_embedding_rejects_empty_text() {
        let client = test_client("http://localhost:11434");
        let result = client.generate_embedding("nomic-embed-text", "   ").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_generate_embedding_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(
                serde_json::json!({"model": "nomic-embed-text"}),
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embedding": [0.1, 0.2, 0.3]})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let embedding = client
            .generate_embedding("nomic-embed-text", "backup window")
            .await
            .unwrap();
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [
                    {"name": "llama3.2", "size": 2019393189u64},
                    {"name": "nomic-embed-text", "size": 274302450u64}
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let models = client.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "llama3.2");
    }

    #[tokio::test]
    async fn test_chat_stream_fragments_then_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let mut rx = client
            .generate_chat_response("llama3.2", vec![user_message("hi")], 0.0)
            .await
            .unwrap();

        let mut collected = String::new();
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Fragment(s) => collected.push_str(&s),
                StreamEvent::Done => saw_done = true,
                StreamEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(collected, "Hello");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn test_chat_upstream_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model exploded"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let result = client
            .generate_chat_response("llama3.2", vec![user_message("hi")], 0.0)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_model_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/delete"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let result = client.delete_model("missing-model").await;
        assert!(result.is_err());
    }
}
