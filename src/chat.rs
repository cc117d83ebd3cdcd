//! Chat orchestration: prompt assembly and token streaming
//!
//! The orchestrator owns its dependency handles, so a client disconnect
//! mid-stream only drops the channel; nothing request-scoped is touched
//! from inside the stream task.

use crate::context::ContextFormatter;
use crate::llm::{system_message, user_message, Message, OllamaClient, StreamEvent};
use crate::retrieval::Retriever;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Exact phrase the model must use when the context cannot answer
pub const REFUSAL_PHRASE: &str = "I don't have that information in the provided documents.";

/// System prompt for retrieval-augmented requests
pub const RAG_SYSTEM_PROMPT: &str = "\
You are a document assistant. Answer using ONLY the context provided below.

Rules:
1. Never use knowledge from outside the provided context.
2. If the context does not contain the answer, reply with exactly: \
\"I don't have that information in the provided documents.\"
3. Cite the source of every claim as [Source: <filename>].
4. Reproduce numeric values from the context verbatim; never round or \
estimate them.";

/// System prompt used when retrieval found nothing relevant
pub const NO_CONTEXT_PROMPT: &str = "\
No relevant documents were found for the user's question. Politely tell the \
user that the document collection does not contain that information, using \
exactly this sentence: \"I don't have that information in the provided \
documents.\" Do not answer from general knowledge.";

/// Temperature applied to every retrieval-augmented request
const RAG_TEMPERATURE: f32 = 0.0;

/// Build the message list for one chat turn
pub fn build_messages(
    message: &str,
    history: &[Message],
    rag_context: Option<&str>,
    use_rag: bool,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    match (use_rag, rag_context) {
        (true, Some(context)) if !context.is_empty() => {
            messages.push(system_message(RAG_SYSTEM_PROMPT));
            messages.extend_from_slice(history);
            messages.push(user_message(format!(
                "Context from documents:\n\n{context}\nQuestion: {message}"
            )));
        }
        (true, _) => {
            messages.push(system_message(NO_CONTEXT_PROMPT));
            messages.extend_from_slice(history);
            messages.push(user_message(message));
        }
        (false, _) => {
            messages.extend_from_slice(history);
            messages.push(user_message(message));
        }
    }

    messages
}

/// Assembles prompts and streams LLM tokens as JSON events
pub struct ChatOrchestrator {
    llm: Arc<OllamaClient>,
    retriever: Arc<Retriever>,
    max_context_chars: usize,
    default_temperature: f32,
}

impl ChatOrchestrator {
    pub fn new(
        llm: Arc<OllamaClient>,
        retriever: Arc<Retriever>,
        max_context_chars: usize,
        default_temperature: f32,
    ) -> Self {
        Self {
            llm,
            retriever,
            max_context_chars,
            default_temperature,
        }
    }

    /// Stream one chat turn as a sequence of JSON events
    ///
    /// Events are `{"content": ...}` fragments followed by `{"done": true}`,
    /// or a terminal `{"error", "message"}` when anything fails after the
    /// stream has started. The receiver closing cancels upstream work.
    pub fn chat(
        &self,
        model: String,
        message: String,
        history: Vec<Message>,
        use_rag: bool,
    ) -> mpsc::Receiver<serde_json::Value> {
        let (tx, rx) = mpsc::channel(64);

        // Capture handles now; the spawned task must not reach back into
        // any request-scoped state.
        let llm = Arc::clone(&self.llm);
        let retriever = Arc::clone(&self.retriever);
        let formatter = ContextFormatter::new(self.max_context_chars);
        let temperature = if use_rag {
            RAG_TEMPERATURE
        } else {
            self.default_temperature
        };

        tokio::spawn(async move {
            let rag_context = if use_rag {
                match retriever.retrieve(&message, None, None).await {
                    Ok(results) => {
                        debug!("Chat retrieval returned {} chunks", results.len());
                        Some(formatter.format(&results))
                    }
                    Err(e) => {
                        warn!("Chat retrieval failed: {}", e);
                        let _ = tx
                            .send(serde_json::json!({
                                "error": e.kind(),
                                "message": e.to_string(),
                            }))
                            .await;
                        return;
                    }
                }
            } else {
                None
            };

            let messages = build_messages(&message, &history, rag_context.as_deref(), use_rag);

            let mut stream = match llm
                .generate_chat_response(&model, messages, temperature)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(serde_json::json!({
                            "error": e.kind(),
                            "message": e.to_string(),
                        }))
                        .await;
                    return;
                }
            };

            while let Some(event) = stream.recv().await {
                let frame = match event {
                    StreamEvent::Fragment(content) => serde_json::json!({ "content": content }),
                    StreamEvent::Done => serde_json::json!({ "done": true }),
                    StreamEvent::Error(message) => serde_json::json!({
                        "error": "OllamaConnectionError",
                        "message": message,
                    }),
                };
                let terminal = frame.get("done").is_some() || frame.get("error").is_some();
                if tx.send(frame).await.is_err() {
                    // Client disconnected; dropping the upstream receiver
                    // cancels the LLM request.
                    return;
                }
                if terminal {
                    return;
                }
            }

            // Upstream closed without a done marker
            let _ = tx.send(serde_json::json!({ "done": true })).await;
        });

        rx
    }
}
