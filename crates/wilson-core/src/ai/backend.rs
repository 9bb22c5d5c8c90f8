//! Streaming chat backend seam.
//!
//! The loop controller only needs one operation: send a conversation, get a
//! decoded event stream back. [`HttpBackend`] is the production
//! implementation; tests script their own [`Backend`].

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::sse::{SseDecoder, StreamEvent};
use crate::ai::types::ChatMessage;

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend connection failed: {0}")]
    Connect(String),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("request cancelled")]
    Cancelled,
}

/// Something that can stream a model response for a conversation.
///
/// The returned channel yields decoded [`StreamEvent`]s and closes after the
/// terminal event. There is no timeout on the stream itself; it ends via
/// `done` or `error` (EOF is synthesized into an error by the decoder).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, BackendError>;
}

/// Production backend: POSTs the conversation and decodes the SSE response.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let wire: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.blocks }))
            .collect();
        json!({
            "model": self.model,
            "messages": wire,
            "stream": true,
        })
    }

    /// Open the response, retrying transient failures with capped backoff.
    /// Retries happen only before the stream opens, never mid-stream.
    async fn connect(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, BackendError> {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            let mut request = self.client.post(&self.url).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable || attempt == MAX_CONNECT_ATTEMPTS {
                        return Err(BackendError::Status(status.as_u16()));
                    }
                    tracing::warn!(status = status.as_u16(), attempt, "retrying backend request");
                }
                Err(e) => {
                    if attempt == MAX_CONNECT_ATTEMPTS {
                        return Err(BackendError::Connect(e.to_string()));
                    }
                    tracing::warn!(error = %e, attempt, "retrying backend request");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            }
            delay = (delay * 2).min(RETRY_MAX_DELAY);
        }
        unreachable!("retry loop returns on final attempt")
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, BackendError> {
        let body = self.request_body(messages);
        let response = self.connect(&body, cancel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut bytes = response.bytes_stream();

            loop {
                let chunk = tokio::select! {
                    chunk = bytes.next() => chunk,
                    _ = cancel.cancelled() => {
                        tracing::debug!("stream reader cancelled");
                        return;
                    }
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.feed(&bytes) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        if decoder.is_finished() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(StreamEvent::Error {
                            message: format!("stream read failed: {}", e),
                        });
                        return;
                    }
                    None => {
                        if let Some(event) = decoder.finish() {
                            let _ = tx.send(event);
                        }
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
