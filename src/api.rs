use crate::models::{Message, ModelInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tokio::sync::mpsc;

/// Receiving end of a stream's text increments. Closes once the decode task exits.
pub type IncrementReceiver = mpsc::UnboundedReceiver<String>;
type IncrementSender = mpsc::UnboundedSender<String>;

// Per-request settings that can change between turns
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub system_message: Option<String>,
}

// Trait defining the interface for the model server
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Starts a streamed chat turn over `messages` (which must not include the
    /// trailing empty assistant placeholder). Transport failures are returned
    /// here; anything that goes wrong later arrives as a final `Error: ...`
    /// increment before the receiver closes.
    async fn start_stream(
        &self,
        model: &str,
        messages: &[Message],
        options: &StreamOptions,
    ) -> Result<IncrementReceiver>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

// --- Ollama Provider Implementation ---

#[derive(Serialize, Debug)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
}

// One object of the streamed response
#[derive(Deserialize, Debug, Default)]
struct ChatResponseChunk {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

pub struct OllamaProvider {
    client: Client,
    host: String,
}

impl OllamaProvider {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }
}

/// Prepends the configured system message, if any, to the outgoing history.
fn build_request_messages(messages: &[Message], options: &StreamOptions) -> Vec<Message> {
    let system = options
        .system_message
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Message::system);

    system.into_iter().chain(messages.iter().cloned()).collect()
}

#[async_trait]
impl LLMApiProvider for OllamaProvider {
    async fn start_stream(
        &self,
        model: &str,
        messages: &[Message],
        options: &StreamOptions,
    ) -> Result<IncrementReceiver> {
        let request_url = self.endpoint("/api/chat");
        log::info!("Sending STREAM request to {} using model: {}", request_url, model);

        let request_body = ChatRequestBody {
            model,
            messages: build_request_messages(messages, options),
            stream: true,
        };

        let response = self
            .client
            .post(&request_url)
            .json(&request_body)
            .send()
            .await
            .with_context(|| format!("Failed to reach model server at {}", self.host))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Chat stream request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "Chat request failed with status {}: {}",
                status,
                error_body.trim()
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let body = Box::pin(response.bytes_stream());
        tokio::spawn(async move {
            forward_increments(body, tx).await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let request_url = self.endpoint("/api/tags");
        log::debug!("Fetching models from {}", request_url);

        let tags: TagsResponse = self
            .client
            .get(&request_url)
            .send()
            .await
            .with_context(|| format!("Failed to reach model server at {}", self.host))?
            .error_for_status()
            .context("Model listing request was rejected")?
            .json()
            .await
            .context("Failed to parse model listing")?;

        log::info!("Fetched {} models", tags.models.len());
        Ok(tags.models)
    }
}

/// Incremental decoder for a body made of back-to-back JSON objects.
///
/// Objects may be newline-delimited, concatenated, or split across reads.
#[derive(Debug, Default)]
struct ResponseDecoder {
    buf: Vec<u8>,
}

impl ResponseDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete object, or `None` when more bytes are needed.
    fn next_chunk(&mut self) -> Option<Result<ChatResponseChunk, serde_json::Error>> {
        let (item, consumed) = {
            let mut objects =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<ChatResponseChunk>();
            let item = objects.next();
            (item, objects.byte_offset())
        };

        match item {
            // Only whitespace left
            None => {
                self.buf.clear();
                None
            }
            Some(Ok(chunk)) => {
                self.buf.drain(..consumed);
                Some(Ok(chunk))
            }
            Some(Err(e)) if e.is_eof() => None,
            Some(Err(e)) => Some(Err(e)),
        }
    }

    /// Error for a trailing, truncated object once the body has ended.
    fn finish(&self) -> Option<serde_json::Error> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        serde_json::from_slice::<ChatResponseChunk>(&self.buf).err()
    }
}

fn send_error(tx: &IncrementSender, description: impl Display) {
    let _ = tx.send(format!("Error: {description}"));
}

/// Decodes `body` and forwards each object's content on `tx`.
///
/// Stops after the object flagged `done`, after a decode or read error (sent
/// as a final `Error: ...` increment), at end of body, or once the receiver is
/// gone. Dropping `tx` on return is what closes the increment channel.
async fn forward_increments<S, B, E>(mut body: S, tx: IncrementSender)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = ResponseDecoder::default();

    'read: loop {
        match body.next().await {
            Some(Ok(bytes)) => {
                decoder.feed(bytes.as_ref());
                while let Some(item) = decoder.next_chunk() {
                    match item {
                        Ok(chunk) => {
                            if let Some(error) = chunk.error {
                                log::warn!("Model server reported an error: {}", error);
                                send_error(&tx, error);
                                break 'read;
                            }
                            let content = chunk.message.map(|m| m.content).unwrap_or_default();
                            if tx.send(content).is_err() {
                                log::debug!("Increment receiver dropped, abandoning stream");
                                break 'read;
                            }
                            if chunk.done {
                                log::info!("Stream finished with done flag");
                                break 'read;
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to decode stream object: {}", e);
                            send_error(&tx, e);
                            break 'read;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                log::error!("Error reading stream body: {}", e);
                send_error(&tx, e);
                break;
            }
            None => {
                if let Some(e) = decoder.finish() {
                    log::error!("Stream ended mid-object: {}", e);
                    send_error(&tx, e);
                } else {
                    log::info!("Stream ended without done flag");
                }
                break;
            }
        }
    }

    log::debug!("Stream decode task exiting");
}
