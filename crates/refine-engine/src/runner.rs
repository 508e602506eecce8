use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use refine_core::events::{send_event, ProgressEvent};
use refine_core::ids::SessionId;
use refine_core::session::SessionStatus;
use refine_core::text::{text_length, truncate_str};
use refine_store::segments::SegmentRepo;
use refine_store::sessions::SessionRepo;
use refine_store::Database;

use crate::compressor::HistoryCompressor;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::StageExecutor;

const MAX_ERROR_BYTES: usize = 500;

/// Drives one session through its segments, strictly in order. Owns all
/// session/segment writes while the session runs; resume is idempotent
/// because settled segments are skipped over.
pub struct SessionRunner {
    session_repo: SessionRepo,
    segment_repo: SegmentRepo,
    executor: StageExecutor,
    compressor: HistoryCompressor,
    skip_threshold: usize,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl SessionRunner {
    pub fn new(
        db: Database,
        executor: StageExecutor,
        compressor: HistoryCompressor,
        config: &EngineConfig,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            session_repo: SessionRepo::new(db.clone()),
            segment_repo: SegmentRepo::new(db),
            executor,
            compressor,
            skip_threshold: config.skip_threshold,
            event_tx,
        }
    }

    /// Process the session until a terminal state is reached. Returns the
    /// terminal status; hard store failures bubble as errors.
    #[instrument(skip(self, cancel), fields(session_id = %session_id))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<SessionStatus, EngineError> {
        let session = self
            .session_repo
            .get(session_id)
            .map_err(|_| EngineError::SessionNotFound(session_id.to_string()))?;

        let segments = self.segment_repo.list(session_id)?;
        if segments.is_empty() {
            return Err(EngineError::InvalidInput("session has no segments".into()));
        }

        let stages = session.mode.stages();
        let mut history = session.history;

        for segment in &segments {
            if segment.status.is_settled() {
                continue;
            }

            if cancel.is_cancelled() {
                return self.finish_stopped(session_id);
            }

            // Headings and other short fragments pass through untouched.
            if text_length(&segment.source_text) < self.skip_threshold {
                self.segment_repo.mark_skipped(session_id, segment.idx)?;
                send_event(
                    &self.event_tx,
                    ProgressEvent::SegmentSkipped {
                        session_id: session_id.clone(),
                        segment_index: segment.idx,
                    },
                );
                continue;
            }

            self.session_repo.update_cursor(session_id, segment.idx)?;
            self.segment_repo.mark_processing(session_id, segment.idx)?;

            let mut input = segment.source_text.clone();
            for &stage in stages {
                match self
                    .executor
                    .run(session_id, segment.idx, stage, &input, &history, cancel)
                    .await
                {
                    Ok(output) => {
                        self.segment_repo
                            .store_output(session_id, segment.idx, stage, &output)?;
                        send_event(
                            &self.event_tx,
                            ProgressEvent::StageComplete {
                                session_id: session_id.clone(),
                                segment_index: segment.idx,
                                stage,
                                text: output.clone(),
                            },
                        );
                        input = output;
                    }
                    Err(EngineError::Stopped) => {
                        return self.finish_stopped(session_id);
                    }
                    Err(e) => {
                        return self.finish_failed(session_id, segment.idx, e);
                    }
                }
            }

            self.segment_repo.mark_done(session_id, segment.idx)?;

            if !history.is_empty() {
                history.push_str("\n\n");
            }
            history.push_str(&input);
            self.session_repo.update_history(session_id, &history)?;

            if self.compressor.needs_compression(&history) {
                if let Some(compressed) = self.compressor.compress(session_id, &history).await {
                    history = compressed;
                    self.session_repo.update_history(session_id, &history)?;
                }
            }
        }

        self.session_repo
            .update_status(session_id, SessionStatus::Completed)?;
        info!(%session_id, "session completed");
        send_event(
            &self.event_tx,
            ProgressEvent::SessionComplete {
                session_id: session_id.clone(),
            },
        );
        Ok(SessionStatus::Completed)
    }

    /// Cooperative stop: partial output of the in-flight segment is
    /// discarded, everything already settled stays as is.
    fn finish_stopped(&self, session_id: &SessionId) -> Result<SessionStatus, EngineError> {
        self.segment_repo.reset_unsettled(session_id)?;
        self.session_repo
            .update_status(session_id, SessionStatus::Stopped)?;
        info!(%session_id, "session stopped");
        send_event(
            &self.event_tx,
            ProgressEvent::SessionStopped {
                session_id: session_id.clone(),
            },
        );
        Ok(SessionStatus::Stopped)
    }

    fn finish_failed(
        &self,
        session_id: &SessionId,
        segment_index: u32,
        error: EngineError,
    ) -> Result<SessionStatus, EngineError> {
        let rendered = error.to_string();
        let message = truncate_str(&rendered, MAX_ERROR_BYTES).to_string();
        warn!(%session_id, segment_index, error = %message, "session failed");

        self.segment_repo
            .mark_failed(session_id, segment_index, &message)?;
        self.session_repo.mark_failed(session_id, &message)?;
        send_event(
            &self.event_tx,
            ProgressEvent::SessionFailed {
                session_id: session_id.clone(),
                segment_index: Some(segment_index),
                error: message,
            },
        );
        Ok(SessionStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use refine_core::errors::UpstreamError;
    use refine_core::session::{ProcessingMode, SegmentStatus, Stage};
    use refine_llm::{MockProvider, MockResponse};

    use crate::config::DeliveryMode;
    use crate::prompts::StagePrompts;
    use crate::providers::ProviderSet;

    struct Harness {
        db: Database,
        session_id: SessionId,
        runner: SessionRunner,
        provider: Arc<MockProvider>,
        rx: broadcast::Receiver<ProgressEvent>,
    }

    fn setup(
        mode: ProcessingMode,
        segment_texts: &[&str],
        responses: Vec<MockResponse>,
        config: EngineConfig,
    ) -> Harness {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create(None, mode).unwrap();
        let texts: Vec<String> = segment_texts.iter().map(|s| s.to_string()).collect();
        SegmentRepo::new(db.clone())
            .insert_batch(&session.id, &texts)
            .unwrap();
        SessionRepo::new(db.clone())
            .set_total_segments(&session.id, texts.len() as u32)
            .unwrap();

        let provider = Arc::new(MockProvider::new(responses));
        let (tx, rx) = broadcast::channel(256);
        let executor = StageExecutor::new(
            ProviderSet::uniform(provider.clone()),
            StagePrompts::default(),
            &config,
            tx.clone(),
        );
        let compressor = HistoryCompressor::new(
            provider.clone(),
            StagePrompts::default().compress,
            &config,
            tx.clone(),
        );
        let runner = SessionRunner::new(db.clone(), executor, compressor, &config, tx);

        Harness {
            db,
            session_id: session.id,
            runner,
            provider,
            rx,
        }
    }

    fn buffered_config() -> EngineConfig {
        EngineConfig {
            delivery: DeliveryMode::Buffered,
            stage_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    const LONG_A: &str = "The first paragraph rambles on at considerable length about nothing.";
    const LONG_B: &str = "The second paragraph also carries enough words to clear the bar.";
    const LONG_C: &str = "The third paragraph continues in the same long-winded fashion here.";

    #[tokio::test]
    async fn heading_skipped_body_processed() {
        let body = "这是一段需要认真润色的很长的正文内容，讲述了一个完整的故事。".repeat(8);
        let mut h = setup(
            ProcessingMode::Polish,
            &["第一章", &body, &body],
            vec![
                MockResponse::stream_text("润色后的第一段正文。"),
                MockResponse::stream_text("润色后的第二段正文。"),
            ],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(h.provider.call_count(), 2);

        let segs = SegmentRepo::new(h.db.clone()).list(&h.session_id).unwrap();
        assert_eq!(segs[0].status, SegmentStatus::Skipped);
        assert!(segs[0].is_heading);
        assert!(segs[0].polished_text.is_none());
        assert_eq!(segs[1].status, SegmentStatus::Done);
        assert_eq!(segs[1].polished_text.as_deref(), Some("润色后的第一段正文。"));
        assert_eq!(segs[2].status, SegmentStatus::Done);

        let counts = SegmentRepo::new(h.db.clone()).counts(&h.session_id).unwrap();
        assert_eq!(counts.percent(), 100);

        let kinds: Vec<&str> = drain(&mut h.rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![
                "segment_skipped",
                "delta",
                "stage_complete",
                "delta",
                "stage_complete",
                "session_complete",
            ]
        );
    }

    #[tokio::test]
    async fn short_segments_never_reach_the_provider() {
        let mut h = setup(
            ProcessingMode::Polish,
            &["Title", "短", "Ch 3"],
            vec![],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(h.provider.call_count(), 0);

        let segs = SegmentRepo::new(h.db.clone()).list(&h.session_id).unwrap();
        assert!(segs.iter().all(|s| s.status == SegmentStatus::Skipped));

        let kinds: Vec<&str> = drain(&mut h.rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds.last(), Some(&"session_complete"));
    }

    #[tokio::test]
    async fn failure_captures_segment_and_session() {
        let mut h = setup(
            ProcessingMode::Polish,
            &[LONG_A, LONG_B, LONG_C],
            vec![
                MockResponse::stream_text("Polished one."),
                MockResponse::Error(UpstreamError::ServerError {
                    status: 502,
                    body: "bad gateway".into(),
                }),
            ],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Failed);

        let session = SessionRepo::new(h.db.clone()).get(&h.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error_message.unwrap().contains("server error"));

        let segs = SegmentRepo::new(h.db.clone()).list(&h.session_id).unwrap();
        assert_eq!(segs[0].status, SegmentStatus::Done);
        assert_eq!(segs[1].status, SegmentStatus::Failed);
        assert!(segs[1].error_message.is_some());
        assert_eq!(segs[2].status, SegmentStatus::Pending);

        let events = drain(&mut h.rx);
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::SessionFailed {
                segment_index: Some(1),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn retry_resumes_without_reexecuting_done_segments() {
        let h = setup(
            ProcessingMode::Polish,
            &[LONG_A, LONG_B, LONG_C],
            vec![
                MockResponse::stream_text("Polished one."),
                MockResponse::Error(UpstreamError::ServerError {
                    status: 500,
                    body: "boom".into(),
                }),
            ],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Failed);

        // Retry path: reset in-flight/failed segments, then run again with a
        // healthy upstream.
        SegmentRepo::new(h.db.clone())
            .reset_unsettled(&h.session_id)
            .unwrap();

        let config = buffered_config();
        let provider2 = Arc::new(MockProvider::new(vec![
            MockResponse::stream_text("Polished two."),
            MockResponse::stream_text("Polished three."),
        ]));
        let (tx, _rx) = broadcast::channel(256);
        let executor = StageExecutor::new(
            ProviderSet::uniform(provider2.clone()),
            StagePrompts::default(),
            &config,
            tx.clone(),
        );
        let compressor = HistoryCompressor::new(
            provider2.clone(),
            StagePrompts::default().compress,
            &config,
            tx.clone(),
        );
        let runner2 = SessionRunner::new(h.db.clone(), executor, compressor, &config, tx);

        let status = runner2.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(provider2.call_count(), 2);

        let segs = SegmentRepo::new(h.db.clone()).list(&h.session_id).unwrap();
        // Byte-identical: segment 0 was not re-executed
        assert_eq!(segs[0].polished_text.as_deref(), Some("Polished one."));
        assert_eq!(segs[1].polished_text.as_deref(), Some("Polished two."));
        assert_eq!(segs[2].polished_text.as_deref(), Some("Polished three."));

        let session = SessionRepo::new(h.db.clone()).get(&h.session_id).unwrap();
        assert_eq!(
            session.history,
            "Polished one.\n\nPolished two.\n\nPolished three."
        );
    }

    #[tokio::test]
    async fn stop_preserves_completed_outputs() {
        let mut h = setup(
            ProcessingMode::Polish,
            &[LONG_A, LONG_B],
            vec![
                MockResponse::stream_text("Done one."),
                MockResponse::delayed(
                    Duration::from_millis(200),
                    MockResponse::stream_text("Done two."),
                ),
            ],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let session_id = h.session_id.clone();
        let runner = h.runner;
        let task = tokio::spawn(async move { runner.run(&session_id, &cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let status = task.await.unwrap().unwrap();
        assert_eq!(status, SessionStatus::Stopped);

        let session = SessionRepo::new(h.db.clone()).get(&h.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);

        let segs = SegmentRepo::new(h.db.clone()).list(&h.session_id).unwrap();
        assert_eq!(segs[0].status, SegmentStatus::Done);
        assert_eq!(segs[0].polished_text.as_deref(), Some("Done one."));
        // In-flight partial output discarded
        assert_eq!(segs[1].status, SegmentStatus::Pending);
        assert!(segs[1].polished_text.is_none());

        let kinds: Vec<&str> = drain(&mut h.rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds.last(), Some(&"session_stopped"));
    }

    #[tokio::test]
    async fn pre_cancelled_run_stops_immediately() {
        let h = setup(
            ProcessingMode::Polish,
            &[LONG_A],
            vec![MockResponse::stream_text("never used")],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Stopped);
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn polish_enhance_chains_stage_outputs() {
        let mut h = setup(
            ProcessingMode::PolishEnhance,
            &[LONG_A],
            vec![
                MockResponse::stream_text("polished text output"),
                MockResponse::stream_text("enhanced text output"),
            ],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(h.provider.call_count(), 2);

        let seg = SegmentRepo::new(h.db.clone()).get(&h.session_id, 0).unwrap();
        assert_eq!(seg.polished_text.as_deref(), Some("polished text output"));
        assert_eq!(seg.enhanced_text.as_deref(), Some("enhanced text output"));
        assert_eq!(seg.final_text(), "enhanced text output");

        // History holds the final stage output only
        let session = SessionRepo::new(h.db.clone()).get(&h.session_id).unwrap();
        assert_eq!(session.history, "enhanced text output");

        let events = drain(&mut h.rx);
        let stages: Vec<Stage> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::StageComplete { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(stages, vec![Stage::Polish, Stage::Enhance]);
    }

    #[tokio::test]
    async fn emotion_mode_writes_primary_column() {
        let h = setup(
            ProcessingMode::Emotion,
            &[LONG_A],
            vec![MockResponse::stream_text("rewritten with feeling")],
            buffered_config(),
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);

        let seg = SegmentRepo::new(h.db.clone()).get(&h.session_id, 0).unwrap();
        assert_eq!(seg.polished_text.as_deref(), Some("rewritten with feeling"));
        assert!(seg.enhanced_text.is_none());
    }

    #[tokio::test]
    async fn history_compressed_mid_run() {
        let config = EngineConfig {
            compression_threshold: 30,
            ..buffered_config()
        };
        let long_output =
            "This polished output is certainly long enough to trip the compression check.";
        let mut h = setup(
            ProcessingMode::Polish,
            &[LONG_A, LONG_B],
            vec![
                MockResponse::stream_text(long_output),
                MockResponse::stream_text("sum"),
                MockResponse::stream_text("Second polished output."),
            ],
            config,
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(h.provider.call_count(), 3);

        let session = SessionRepo::new(h.db.clone()).get(&h.session_id).unwrap();
        assert_eq!(session.history, "sum\n\nSecond polished output.");

        let events = drain(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::HistoryCompressed { .. })));
    }

    #[tokio::test]
    async fn compression_failure_does_not_halt_session() {
        let config = EngineConfig {
            compression_threshold: 30,
            ..buffered_config()
        };
        let long_output =
            "This polished output is certainly long enough to trip the compression check.";
        let mut h = setup(
            ProcessingMode::Polish,
            &[LONG_A, LONG_B],
            vec![
                MockResponse::stream_text(long_output),
                MockResponse::Error(UpstreamError::ServerError {
                    status: 500,
                    body: "summarizer down".into(),
                }),
                MockResponse::stream_text("Second polished output."),
            ],
            config,
        );

        let cancel = CancellationToken::new();
        let status = h.runner.run(&h.session_id, &cancel).await.unwrap();
        assert_eq!(status, SessionStatus::Completed);

        let session = SessionRepo::new(h.db.clone()).get(&h.session_id).unwrap();
        assert_eq!(
            session.history,
            format!("{long_output}\n\nSecond polished output.")
        );

        let events = drain(&mut h.rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProgressEvent::HistoryCompressed { .. })));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = setup(ProcessingMode::Polish, &[LONG_A], vec![], buffered_config());
        let cancel = CancellationToken::new();
        let result = h
            .runner
            .run(&SessionId::from_raw("sess_missing"), &cancel)
            .await;
        assert!(matches!(result, Err(EngineError::SessionNotFound(_))));
    }
}
