use serde::{Deserialize, Serialize};

use crate::errors::UpstreamError;

/// Events emitted during a streaming transformation call. Ordering contract:
///
/// Start → Delta* → Done
///
/// Error can appear at any point and terminates the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    Delta { delta: String },
    Done { text: String },
    Error { error: UpstreamError },
}

/// Lightweight error info for wire payloads (no full UpstreamError ownership).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&UpstreamError> for UpstreamErrorInfo {
    fn from(e: &UpstreamError) -> Self {
        Self {
            kind: e.error_kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
