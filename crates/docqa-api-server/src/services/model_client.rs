use crate::utils::error::ApiError;
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// One token of a streaming generation. The upstream sequence is lazy,
/// finite and non-restartable; it closes on the first `done=true`.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatStreamRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    options: GenerationOptions,
    stream: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub num_predict: usize,
}

#[derive(Debug, Deserialize)]
struct ChatStreamLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenEvent, ApiError>> + Send>>;

/// Seam for the embedding wire call, so the batch scheduler can be
/// exercised against a mock backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, base_url: &str, model: &str, prompt: &str)
        -> Result<Vec<f32>, ApiError>;
}

#[async_trait::async_trait]
impl EmbeddingBackend for ModelServerClient {
    async fn embed(
        &self,
        base_url: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Vec<f32>, ApiError> {
        ModelServerClient::embed(self, base_url, model, prompt).await
    }
}

/// HTTP client for the model-server fleet: embeddings and streaming
/// chat completions (newline-delimited JSON).
#[derive(Clone)]
pub struct ModelServerClient {
    client: Client,
}

impl ModelServerClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Single-prompt embedding call against one instance.
    pub async fn embed(
        &self,
        base_url: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Vec<f32>, ApiError> {
        let url = format!("{}/api/embeddings", base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest { model, prompt })
            .send()
            .await
            .map_err(|e| ApiError::EmbeddingUnavailable(format!("embedding call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::EmbeddingUnavailable(format!(
                "embedding API error ({}): {}",
                status, body
            )));
        }

        let body: EmbeddingResponse = response.json().await.map_err(|e| {
            ApiError::EmbeddingUnavailable(format!("invalid embedding payload: {}", e))
        })?;

        if body.embedding.is_empty() {
            return Err(ApiError::EmbeddingUnavailable(
                "empty embedding returned".to_string(),
            ));
        }

        Ok(body.embedding)
    }

    /// Start a streaming generation. Returns token events in generation
    /// order; the stream ends at the first `done=true` line.
    pub async fn chat_stream(
        &self,
        base_url: &str,
        model: &str,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
    ) -> Result<TokenStream, ApiError> {
        debug!(model, messages = messages.len(), "starting chat stream");

        let url = format!("{}/api/chat", base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(&ChatStreamRequest {
                model,
                messages: &messages,
                options,
                stream: true,
            })
            .send()
            .await
            .map_err(|e| ApiError::GenerationFailed(format!("chat call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::GenerationFailed(format!(
                "chat API error ({}): {}",
                status, body
            )));
        }

        let mut bytes = response.bytes_stream();

        // NDJSON framing: a network chunk may hold partial lines, so we
        // buffer until '\n' before parsing.
        let stream = async_stream::stream! {
            let mut buffer = String::new();

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ApiError::GenerationFailed(format!("stream error: {}", e)));
                        break;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<ChatStreamLine>(&line) {
                        Ok(parsed) => {
                            let text = parsed
                                .message
                                .map(|m| m.content)
                                .unwrap_or_default();
                            let done = parsed.done;
                            yield Ok(TokenEvent { text, done });
                            if done {
                                break 'outer;
                            }
                        }
                        Err(e) => {
                            yield Err(ApiError::GenerationFailed(format!(
                                "invalid stream line: {}",
                                e
                            )));
                            break 'outer;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_line_parsing() {
        let line: ChatStreamLine =
            serde_json::from_str(r#"{"message":{"content":"Hello"},"done":false}"#).unwrap();
        assert_eq!(line.message.unwrap().content, "Hello");
        assert!(!line.done);

        let done: ChatStreamLine = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(done.done);
        assert!(done.message.is_none());
    }

    #[test]
    fn test_embedding_response_parsing() {
        let body: EmbeddingResponse =
            serde_json::from_str(r#"{"embedding":[0.1, 0.2, 0.3]}"#).unwrap();
        assert_eq!(body.embedding.len(), 3);
    }
}
