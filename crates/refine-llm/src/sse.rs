use serde::Deserialize;
use serde_json::Value;

use refine_core::errors::UpstreamError;
use refine_core::stream::StreamEvent;

/// State machine for parsing an OpenAI-style chat-completions SSE stream.
///
/// The wire format is data-only: each event is a `data: {...}` line carrying
/// a chunk with `choices[0].delta.content`, terminated by a `data: [DONE]`
/// sentinel. Text accumulates across chunks so `Done` carries the full output.
pub struct SseParser {
    text: String,
    started: bool,
    finished: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            started: false,
            finished: false,
        }
    }

    /// Parse one `data:` payload and return zero or more StreamEvents.
    pub fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if self.finished {
            return events;
        }

        if data.trim() == "[DONE]" {
            self.finished = true;
            events.push(StreamEvent::Done {
                text: self.text.clone(),
            });
            return events;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                self.finished = true;
                events.push(StreamEvent::Error {
                    error: UpstreamError::MalformedResponse(format!("bad chunk: {e}")),
                });
                return events;
            }
        };

        // Mid-stream error payloads arrive as {"error": {...}}
        if let Some(err) = value.get("error") {
            self.finished = true;
            events.push(StreamEvent::Error {
                error: classify_error(err),
            });
            return events;
        }

        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        if let Ok(chunk) = serde_json::from_value::<ChunkPayload>(value) {
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        self.text.push_str(&content);
                        events.push(StreamEvent::Delta { delta: content });
                    }
                }
                // finish_reason arrives one chunk before [DONE]; the
                // sentinel is what actually terminates the stream.
            }
        }

        events
    }

    /// Text accumulated so far. Used as a fallback when the stream drops
    /// before the [DONE] sentinel arrives.
    pub fn accumulated_text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn classify_error(err: &Value) -> UpstreamError {
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown error")
        .to_string();
    let error_type = err.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match error_type {
        "authentication_error" => UpstreamError::AuthenticationFailed(message),
        "invalid_request_error" => UpstreamError::InvalidRequest(message),
        "rate_limit_error" | "insufficient_quota" => UpstreamError::RateLimited { retry_after: None },
        "overloaded_error" => UpstreamError::ProviderOverloaded,
        _ => UpstreamError::ServerError {
            status: 500,
            body: message,
        },
    }
}

/// Extract `data:` payloads from raw SSE text. Comment lines and
/// `event:` fields are ignored (the chat-completions stream is data-only).
pub fn data_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })
        .map(|data| data.to_string())
        .collect()
}

#[derive(Deserialize)]
struct ChunkPayload {
    choices: Vec<ChoicePayload>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    delta: DeltaPayload,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_text_stream() {
        let mut parser = SseParser::new();

        let events = parser.parse_data(
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Start));

        let events = parser.parse_data(
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Delta { delta } if delta == "Hello"));

        let events = parser.parse_data(
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":" world!"},"finish_reason":null}]}"#,
        );
        assert_eq!(events.len(), 1);

        let events = parser.parse_data(
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        );
        assert!(events.is_empty());

        let events = parser.parse_data("[DONE]");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Done { text } if text == "Hello world!"));
        assert!(parser.is_finished());
    }

    #[test]
    fn data_after_done_ignored() {
        let mut parser = SseParser::new();
        parser.parse_data(r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#);
        parser.parse_data("[DONE]");

        let events =
            parser.parse_data(r#"{"choices":[{"delta":{"content":"late"},"finish_reason":null}]}"#);
        assert!(events.is_empty());
        assert_eq!(parser.accumulated_text(), "hi");
    }

    #[test]
    fn parse_error_payload() {
        let mut parser = SseParser::new();
        let events = parser.parse_data(
            r#"{"error":{"message":"Rate limit reached","type":"rate_limit_error","code":"rate_limit_exceeded"}}"#,
        );
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], StreamEvent::Error { error } if error.is_retryable()),
            "expected retryable error, got: {events:?}"
        );
    }

    #[test]
    fn parse_auth_error_payload() {
        let mut parser = SseParser::new();
        let events = parser.parse_data(
            r#"{"error":{"message":"Incorrect API key provided","type":"authentication_error"}}"#,
        );
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.is_fatal()));
    }

    #[test]
    fn malformed_chunk_is_error() {
        let mut parser = SseParser::new();
        let events = parser.parse_data("{not json");
        assert!(matches!(
            &events[0],
            StreamEvent::Error {
                error: UpstreamError::MalformedResponse(_)
            }
        ));
    }

    #[test]
    fn accumulated_text_tracks_partial_output() {
        let mut parser = SseParser::new();
        parser.parse_data(r#"{"choices":[{"delta":{"content":"partial "},"finish_reason":null}]}"#);
        parser.parse_data(r#"{"choices":[{"delta":{"content":"output"},"finish_reason":null}]}"#);
        assert_eq!(parser.accumulated_text(), "partial output");
        assert!(!parser.is_finished());
    }

    #[test]
    fn data_lines_basic() {
        let raw = "data: {\"a\":1}\n\ndata: [DONE]\n\n";
        let lines = data_lines(raw);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"a\":1}");
        assert_eq!(lines[1], "[DONE]");
    }

    #[test]
    fn data_lines_skips_comments_and_events() {
        let raw = ": keep-alive\nevent: ping\ndata: {\"b\":2}\n\n";
        let lines = data_lines(raw);
        assert_eq!(lines, vec!["{\"b\":2}"]);
    }
}
