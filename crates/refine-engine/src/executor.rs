use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use refine_core::context::ChatContext;
use refine_core::events::{send_event, ProgressEvent};
use refine_core::ids::SessionId;
use refine_core::provider::CallOptions;
use refine_core::session::Stage;
use refine_core::stream::StreamEvent;

use crate::config::{DeliveryMode, EngineConfig};
use crate::error::EngineError;
use crate::prompts::StagePrompts;
use crate::providers::ProviderSet;

/// Runs one transformation stage against the upstream provider. Delivery
/// mode is a deployment decision; the executor never retries.
pub struct StageExecutor {
    providers: ProviderSet,
    prompts: StagePrompts,
    delivery: DeliveryMode,
    stage_timeout: Duration,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl StageExecutor {
    pub fn new(
        providers: ProviderSet,
        prompts: StagePrompts,
        config: &EngineConfig,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            providers,
            prompts,
            delivery: config.delivery,
            stage_timeout: config.stage_timeout,
            event_tx,
        }
    }

    /// Transform `input` through `stage`, emitting delta events as output
    /// arrives. Returns the assembled stage output.
    #[instrument(skip(self, input, history, cancel), fields(session_id = %session_id, segment_index, stage = %stage))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        segment_index: u32,
        stage: Stage,
        input: &str,
        history: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Stopped);
        }

        let context = ChatContext::new(self.prompts.for_stage(stage), input).with_history(history);
        let options = CallOptions::default();

        match self.delivery {
            DeliveryMode::Streaming => {
                self.run_streaming(session_id, segment_index, stage, &context, &options, cancel)
                    .await
            }
            DeliveryMode::Buffered => {
                self.run_buffered(session_id, segment_index, stage, &context, &options, cancel)
                    .await
            }
        }
    }

    async fn run_streaming(
        &self,
        session_id: &SessionId,
        segment_index: u32,
        stage: Stage,
        context: &ChatContext,
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let provider = self.providers.for_stage(stage);
        let consume = async {
            let mut stream = provider.stream(context, options).await?;
            let mut accumulated = String::new();
            let final_text;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Stopped),
                    event = stream.next() => event,
                };

                match event {
                    Some(StreamEvent::Start) => {}
                    Some(StreamEvent::Delta { delta }) => {
                        accumulated.push_str(&delta);
                        send_event(
                            &self.event_tx,
                            ProgressEvent::Delta {
                                session_id: session_id.clone(),
                                segment_index,
                                stage,
                                delta,
                            },
                        );
                    }
                    Some(StreamEvent::Done { text }) => {
                        final_text = if text.is_empty() { accumulated } else { text };
                        break;
                    }
                    Some(StreamEvent::Error { error }) => return Err(error.into()),
                    None => {
                        if accumulated.is_empty() {
                            return Err(EngineError::Internal(
                                "stream ended without terminal event".into(),
                            ));
                        }
                        final_text = accumulated;
                        break;
                    }
                }
            }

            Ok(final_text)
        };

        let text = tokio::time::timeout(self.stage_timeout, consume)
            .await
            .map_err(|_| EngineError::StageTimeout(self.stage_timeout))??;

        if text.trim().is_empty() {
            return Err(refine_core::errors::UpstreamError::EmptyOutput.into());
        }
        Ok(text)
    }

    async fn run_buffered(
        &self,
        session_id: &SessionId,
        segment_index: u32,
        stage: Stage,
        context: &ChatContext,
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let provider = self.providers.for_stage(stage);
        let call = tokio::time::timeout(self.stage_timeout, provider.complete(context, options));

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Stopped),
            result = call => result.map_err(|_| EngineError::StageTimeout(self.stage_timeout))??,
        };

        if text.trim().is_empty() {
            return Err(refine_core::errors::UpstreamError::EmptyOutput.into());
        }

        // Buffered mode still emits one delta so clients render output the
        // same way in both modes.
        send_event(
            &self.event_tx,
            ProgressEvent::Delta {
                session_id: session_id.clone(),
                segment_index,
                stage,
                delta: text.clone(),
            },
        );

        Ok(text)
    }
}
