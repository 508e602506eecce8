use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use refine_core::context::ChatContext;
use refine_core::events::{send_event, ProgressEvent};
use refine_core::ids::SessionId;
use refine_core::provider::{CallOptions, TextProvider};
use refine_core::text::text_length;

use crate::config::EngineConfig;

/// Shrinks the running history with a summarization call once it outgrows
/// the threshold. Failure is never fatal to the session.
pub struct HistoryCompressor {
    provider: Arc<dyn TextProvider>,
    prompt: String,
    threshold: usize,
    call_timeout: Duration,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl HistoryCompressor {
    pub fn new(
        provider: Arc<dyn TextProvider>,
        prompt: impl Into<String>,
        config: &EngineConfig,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            provider,
            prompt: prompt.into(),
            threshold: config.compression_threshold,
            call_timeout: config.stage_timeout,
            event_tx,
        }
    }

    pub fn needs_compression(&self, history: &str) -> bool {
        text_length(history) > self.threshold
    }

    /// Attempt to compress `history`. Returns the shorter replacement, or
    /// None when the call failed or did not actually reduce the length; the
    /// caller keeps the original in either case.
    #[instrument(skip(self, history), fields(session_id = %session_id))]
    pub async fn compress(&self, session_id: &SessionId, history: &str) -> Option<String> {
        let context = ChatContext::new(self.prompt.clone(), history);
        let options = CallOptions::default();
        let call = self.provider.complete(&context, &options);

        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "history compression failed, keeping uncompressed history");
                return None;
            }
            Err(_) => {
                warn!("history compression timed out, keeping uncompressed history");
                return None;
            }
        };

        let chars_before = text_length(history);
        let chars_after = text_length(&result);
        if chars_after >= chars_before {
            warn!(
                chars_before,
                chars_after, "compression did not reduce history, discarding result"
            );
            return None;
        }

        debug!(chars_before, chars_after, "history compressed");
        send_event(
            &self.event_tx,
            ProgressEvent::HistoryCompressed {
                session_id: session_id.clone(),
                chars_before,
                chars_after,
            },
        );
        Some(result)
    }
}
