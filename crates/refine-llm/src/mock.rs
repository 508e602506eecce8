use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::Stream;
use tokio_stream::StreamExt;

use refine_core::context::ChatContext;
use refine_core::errors::UpstreamError;
use refine_core::provider::{CallOptions, TextProvider};
use refine_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(UpstreamError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: create a simple text response stream.
    pub fn stream_text(text: &str) -> Self {
        let text = text.to_string();
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::Delta {
                delta: text.clone(),
            },
            StreamEvent::Done { text },
        ])
    }

    /// Convenience: create a stream that ends with an error event.
    pub fn stream_error(error: UpstreamError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    fn next_response(&self) -> Result<&MockResponse, UpstreamError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        if idx >= self.responses.len() {
            return Err(UpstreamError::InvalidRequest(format!(
                "MockProvider: no response configured for call {}",
                idx
            )));
        }

        // SAFETY: We only access each index once due to atomic fetch_add.
        // The Vec is not mutated, we just need a shared reference.
        let response = unsafe {
            let ptr = self.responses.as_ptr().add(idx);
            &*ptr
        };

        Ok(response)
    }
}

#[async_trait]
impl TextProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        _context: &ChatContext,
        _options: &CallOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, UpstreamError> {
        let response = self.next_response()?;
        resolve_response(response).await
    }

    async fn complete(
        &self,
        _context: &ChatContext,
        _options: &CallOptions,
    ) -> Result<String, UpstreamError> {
        let response = self.next_response()?;
        let mut stream = resolve_response(response).await?;

        // Consume the scripted stream; Done wins, accumulated deltas
        // are the fallback when the script omits it.
        let mut accumulated = String::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta { delta } => accumulated.push_str(&delta),
                StreamEvent::Done { text } => return Ok(text),
                StreamEvent::Error { error } => return Err(error),
                StreamEvent::Start => {}
            }
        }

        if accumulated.is_empty() {
            Err(UpstreamError::EmptyOutput)
        } else {
            Ok(accumulated)
        }
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(
    response: &MockResponse,
) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, UpstreamError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => {
                let events = events.clone();
                return Ok(Box::pin(stream::iter(events)));
            }
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let context = ChatContext::empty();
        let mut stream = mock
            .stream(&context, &CallOptions::default())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert_eq!(events.len(), 3); // Start, Delta, Done
        assert!(matches!(events[0], StreamEvent::Start));
        if let StreamEvent::Delta { delta } = &events[1] {
            assert_eq!(delta, "hello world");
        } else {
            panic!("expected Delta");
        }
        assert!(matches!(&events[2], StreamEvent::Done { text } if text == "hello world"));
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(
            UpstreamError::AuthenticationFailed("bad".into()),
        )]);
        let context = ChatContext::empty();
        let result = mock.stream(&context, &CallOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sequential_responses() {
        let mock = MockProvider::new(vec![
            MockResponse::stream_text("first"),
            MockResponse::stream_text("second"),
        ]);
        let context = ChatContext::empty();

        // First call
        let result1 = mock.stream(&context, &CallOptions::default()).await;
        assert!(result1.is_ok());
        assert_eq!(mock.call_count(), 1);

        // Second call
        let result2 = mock.stream(&context, &CallOptions::default()).await;
        assert!(result2.is_ok());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("only one")]);
        let context = ChatContext::empty();

        let _ = mock.stream(&context, &CallOptions::default()).await;
        let result = mock.stream(&context, &CallOptions::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn provider_properties() {
        let mock = MockProvider::new(vec![]);
        assert_eq!(mock.name(), "mock");
        assert_eq!(mock.model(), "mock-model");
    }

    #[tokio::test]
    async fn complete_returns_done_text() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("buffered output")]);
        let context = ChatContext::empty();
        let text = mock
            .complete(&context, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "buffered output");
    }

    #[tokio::test]
    async fn complete_propagates_stream_error() {
        let mock = MockProvider::new(vec![MockResponse::stream_error(
            UpstreamError::ProviderOverloaded,
        )]);
        let context = ChatContext::empty();
        let result = mock.complete(&context, &CallOptions::default()).await;
        assert!(matches!(result, Err(UpstreamError::ProviderOverloaded)));
    }

    #[tokio::test]
    async fn delayed_response() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::stream_text("after delay"),
        )]);
        let context = ChatContext::empty();

        let start = std::time::Instant::now();
        let mut stream = mock
            .stream(&context, &CallOptions::default())
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(40),
            "Delay should have waited ~50ms, got {:?}",
            elapsed
        );

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn delayed_error() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::Error(UpstreamError::RateLimited { retry_after: None }),
        )]);
        let context = ChatContext::empty();

        let result = mock.stream(&context, &CallOptions::default()).await;
        match result {
            Err(UpstreamError::RateLimited { .. }) => {} // expected
            Err(other) => panic!("expected RateLimited, got: {other:?}"),
            Ok(_) => panic!("expected error"),
        }
    }
}
