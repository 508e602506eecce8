use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use refine_core::context::ChatContext;
use refine_core::errors::UpstreamError;
use refine_core::provider::{CallOptions, TextProvider};
use refine_core::stream::StreamEvent;

use crate::config::ProviderConfig;
use crate::sse::{self, SseParser};

const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Adapter for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| UpstreamError::NetworkError(format!("http client: {e}")))?;

        Ok(Self { client, config })
    }

    fn build_body(&self, context: &ChatContext, options: &CallOptions, stream: bool) -> RequestBody {
        let mut messages = Vec::with_capacity(3);
        if !context.system_prompt.is_empty() {
            messages.push(Message {
                role: "system",
                content: context.system_prompt.clone(),
            });
        }
        // Prior output rides along as an assistant turn so later segments
        // stay stylistically consistent with earlier ones.
        if let Some(history) = &context.history {
            messages.push(Message {
                role: "assistant",
                content: history.clone(),
            });
        }
        messages.push(Message {
            role: "user",
            content: context.input.clone(),
        });

        RequestBody {
            model: self.config.model.clone(),
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream,
        }
    }

    fn build_request(&self, body: &RequestBody) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.config.completions_url());

        if let Some(key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", key.0.expose_secret()));
        }

        req = req.header("accept", "application/json");
        req = req.header("content-type", "application/json");
        req.json(body)
    }
}

#[async_trait]
impl TextProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context, options), fields(model = %self.config.model))]
    async fn stream(
        &self,
        context: &ChatContext,
        options: &CallOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, UpstreamError> {
        let body = self.build_body(context, options, true);
        let req = self.build_request(&body);

        let resp = req
            .send()
            .await
            .map_err(|e| UpstreamError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        let byte_stream = resp.bytes_stream();
        let stream = SseStream::new(byte_stream);

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, context, options), fields(model = %self.config.model))]
    async fn complete(
        &self,
        context: &ChatContext,
        options: &CallOptions,
    ) -> Result<String, UpstreamError> {
        let body = self.build_body(context, options, false);
        let req = self
            .build_request(&body)
            .timeout(self.config.request_timeout);

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.config.request_timeout)
            } else {
                UpstreamError::NetworkError(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        let completion: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(UpstreamError::EmptyOutput);
        }

        Ok(text)
    }
}

#[derive(Serialize)]
struct RequestBody {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// Includes an idle timeout — if no data arrives within `idle_duration`,
/// emits an error.
///
/// The buffer holds raw bytes and is only decoded at SSE event boundaries,
/// so a multi-byte character split across network chunks reassembles before
/// UTF-8 decoding.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: SseParser,
    buffer: bytes::BytesMut,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            buffer: bytes::BytesMut::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_buffer_chunk(&mut self, chunk: &str) {
        for data in sse::data_lines(chunk) {
            let events = self.parser.parse_data(&data);
            self.pending.extend(events);
        }
    }
}

/// Byte offset just past the first `\n\n`, or None when no complete SSE
/// event is buffered yet.
fn event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        // Return pending events first
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received — reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.buffer.extend_from_slice(&bytes);

                    // Process complete SSE events from the buffer. Decoding
                    // happens per event, never mid-chunk, so partial UTF-8
                    // sequences stay buffered until their tail arrives.
                    while let Some(end) = event_boundary(&self.buffer) {
                        let event_bytes = self.buffer.split_to(end);
                        let chunk = String::from_utf8_lossy(&event_bytes).into_owned();
                        self.drain_buffer_chunk(&chunk);
                    }

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(StreamEvent::Error {
                        error: UpstreamError::StreamInterrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    // Stream ended — process remaining buffer
                    if !self.buffer.is_empty() {
                        let len = self.buffer.len();
                        let remaining = self.buffer.split_to(len);
                        let chunk = String::from_utf8_lossy(&remaining).into_owned();
                        self.drain_buffer_chunk(&chunk);
                        if !self.pending.is_empty() {
                            return std::task::Poll::Ready(Some(self.pending.remove(0)));
                        }
                    }
                    // Connection closed without the [DONE] sentinel. Emit
                    // the error once, then terminate.
                    if !self.parser.is_finished() && !self.finished {
                        self.finished = true;
                        return std::task::Poll::Ready(Some(StreamEvent::Error {
                            error: UpstreamError::StreamInterrupted(
                                "connection closed before completion".to_string(),
                            ),
                        }));
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    // No data available — check idle timeout
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        return std::task::Poll::Ready(Some(StreamEvent::Error {
                            error: UpstreamError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
