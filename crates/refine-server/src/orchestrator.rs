//! Session orchestrator — connects the engine to the server.
//!
//! The `SessionOrchestrator` trait defines the lifecycle entry points the RPC
//! handlers call: submit, stop, retry, delete, queue status.
//! `EngineOrchestrator` is the production implementation: it owns the
//! admission controller and spawns one worker task per session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use refine_core::events::{send_event, ProgressEvent};
use refine_core::ids::SessionId;
use refine_core::session::{ProcessingMode, SessionStatus};
use refine_core::text::{split_into_segments, truncate_str};
use refine_engine::admission::{AdmissionController, QueueStatus, Ticket};
use refine_engine::compressor::HistoryCompressor;
use refine_engine::executor::StageExecutor;
use refine_engine::prompts::StagePrompts;
use refine_engine::providers::ProviderSet;
use refine_engine::runner::SessionRunner;
use refine_engine::{EngineConfig, EngineError};
use refine_store::segments::SegmentRepo;
use refine_store::sessions::SessionRepo;
use refine_store::Database;

const MAX_ERROR_BYTES: usize = 500;

/// Parameters for submitting a document.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub text: String,
    pub mode: ProcessingMode,
    pub owner: Option<String>,
}

/// Result of accepting a submission (or a retry). Acceptance means the
/// session is enqueued, not completed.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub session_id: SessionId,
    pub total_segments: u32,
    /// 0 when granted a slot immediately, otherwise 1-based queue position.
    pub queue_position: usize,
    pub estimated_wait: Duration,
}

/// Trait for orchestrating session lifecycles.
#[async_trait]
pub trait SessionOrchestrator: Send + Sync {
    async fn submit(&self, params: SubmitParams) -> Result<SubmitOutcome, EngineError>;
    async fn retry(&self, session_id: &SessionId) -> Result<SubmitOutcome, EngineError>;
    fn stop(&self, session_id: &SessionId) -> Result<bool, EngineError>;
    fn delete(&self, session_id: &SessionId) -> Result<(), EngineError>;
    fn queue_status(&self) -> QueueStatus;
    fn position_of(&self, session_id: &SessionId) -> Option<usize>;
    fn is_active(&self, session_id: &SessionId) -> bool;
    fn stop_all(&self) -> usize;
}

/// Production orchestrator backed by the engine crates.
pub struct EngineOrchestrator {
    db: Database,
    session_repo: SessionRepo,
    segment_repo: SegmentRepo,
    runner: Arc<SessionRunner>,
    admission: Arc<AdmissionController>,
    event_tx: broadcast::Sender<ProgressEvent>,
    segment_max_chars: usize,
    active: Arc<DashMap<SessionId, CancellationToken>>,
}

impl EngineOrchestrator {
    pub fn new(
        db: Database,
        providers: ProviderSet,
        prompts: StagePrompts,
        config: &EngineConfig,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        let executor =
            StageExecutor::new(providers.clone(), prompts.clone(), config, event_tx.clone());
        let compressor = HistoryCompressor::new(
            Arc::clone(providers.compression()),
            prompts.compress.clone(),
            config,
            event_tx.clone(),
        );
        let runner = Arc::new(SessionRunner::new(
            db.clone(),
            executor,
            compressor,
            config,
            event_tx.clone(),
        ));

        Self {
            session_repo: SessionRepo::new(db.clone()),
            segment_repo: SegmentRepo::new(db.clone()),
            db,
            runner,
            admission: Arc::new(AdmissionController::new(config.max_concurrent)),
            event_tx,
            segment_max_chars: config.segment_max_chars,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Enqueue the session and spawn its worker task. The worker parks until
    /// admission grants a slot, then drives the runner to a terminal state
    /// and frees the slot. All session row writes during the run happen in
    /// the worker.
    fn spawn_worker(&self, session_id: SessionId) -> Ticket {
        let ticket = self.admission.submit(session_id.clone());
        let cancel = CancellationToken::new();
        self.active.insert(session_id.clone(), cancel.clone());

        let runner = Arc::clone(&self.runner);
        let admission = Arc::clone(&self.admission);
        let active = Arc::clone(&self.active);
        let session_repo = SessionRepo::new(self.db.clone());
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            if admission.await_slot(&session_id, &cancel).await.is_err() {
                // Stopped while queued; no slot was ever held.
                if let Err(e) = session_repo.update_status(&session_id, SessionStatus::Stopped) {
                    tracing::error!(%session_id, error = %e, "failed to record queued stop");
                }
                send_event(
                    &event_tx,
                    ProgressEvent::SessionStopped {
                        session_id: session_id.clone(),
                    },
                );
                active.remove(&session_id);
                return;
            }

            if let Err(e) = session_repo.mark_processing(&session_id) {
                tracing::error!(%session_id, error = %e, "failed to mark session processing");
                admission.release(&session_id, Duration::ZERO);
                active.remove(&session_id);
                return;
            }

            let started = Instant::now();
            let result = runner.run(&session_id, &cancel).await;
            admission.release(&session_id, started.elapsed());
            active.remove(&session_id);

            match result {
                Ok(status) => {
                    tracing::info!(%session_id, %status, "session worker finished");
                }
                Err(e) => {
                    // Store-level failures bubble past the runner's own
                    // failure capture; settle the row here.
                    let rendered = e.to_string();
                    let message = truncate_str(&rendered, MAX_ERROR_BYTES).to_string();
                    tracing::warn!(%session_id, error = %message, "session worker errored");
                    if let Err(store_err) = session_repo.mark_failed(&session_id, &message) {
                        tracing::error!(%session_id, error = %store_err, "failed to record failure");
                    }
                    send_event(
                        &event_tx,
                        ProgressEvent::SessionFailed {
                            session_id: session_id.clone(),
                            segment_index: None,
                            error: message,
                        },
                    );
                }
            }
        });

        ticket
    }

    fn get_session(&self, session_id: &SessionId) -> Result<refine_store::sessions::SessionRow, EngineError> {
        self.session_repo
            .get(session_id)
            .map_err(|_| EngineError::SessionNotFound(session_id.to_string()))
    }
}

#[async_trait]
impl SessionOrchestrator for EngineOrchestrator {
    async fn submit(&self, params: SubmitParams) -> Result<SubmitOutcome, EngineError> {
        if params.text.trim().is_empty() {
            return Err(EngineError::InvalidInput("document text is empty".into()));
        }
        let segments = split_into_segments(&params.text, self.segment_max_chars);
        if segments.is_empty() {
            return Err(EngineError::InvalidInput(
                "document produced no segments".into(),
            ));
        }

        let session = self
            .session_repo
            .create(params.owner.as_deref(), params.mode)?;
        self.segment_repo.insert_batch(&session.id, &segments)?;
        self.session_repo
            .set_total_segments(&session.id, segments.len() as u32)?;

        tracing::info!(
            session_id = %session.id,
            mode = %params.mode,
            segments = segments.len(),
            "session submitted"
        );

        let ticket = self.spawn_worker(session.id.clone());
        Ok(SubmitOutcome {
            session_id: session.id,
            total_segments: segments.len() as u32,
            queue_position: ticket.position,
            estimated_wait: ticket.estimated_wait,
        })
    }

    async fn retry(&self, session_id: &SessionId) -> Result<SubmitOutcome, EngineError> {
        if self.active.contains_key(session_id) {
            return Err(EngineError::NotRetryable(
                "session is already running".into(),
            ));
        }

        let session = self.get_session(session_id)?;
        if !session.status.is_retryable() {
            return Err(EngineError::NotRetryable(format!(
                "session is {}, only failed sessions can be retried",
                session.status
            )));
        }

        // Done/skipped segments keep their outputs; everything else goes
        // back to pending and reprocesses from the first unsettled segment.
        self.segment_repo.reset_unsettled(session_id)?;
        self.session_repo
            .update_status(session_id, SessionStatus::Queued)?;

        tracing::info!(%session_id, "session retry accepted");

        let ticket = self.spawn_worker(session_id.clone());
        Ok(SubmitOutcome {
            session_id: session_id.clone(),
            total_segments: session.total_segments,
            queue_position: ticket.position,
            estimated_wait: ticket.estimated_wait,
        })
    }

    fn stop(&self, session_id: &SessionId) -> Result<bool, EngineError> {
        if let Some((_, cancel)) = self.active.remove(session_id) {
            // The worker observes the cancellation and settles the row.
            cancel.cancel();
            tracing::info!(%session_id, "stop requested");
            return Ok(true);
        }

        let session = self.get_session(session_id)?;
        if session.status.is_terminal() {
            return Ok(false);
        }

        // No worker owns the session; settle the row directly.
        self.admission.withdraw(session_id);
        self.session_repo
            .update_status(session_id, SessionStatus::Stopped)?;
        send_event(
            &self.event_tx,
            ProgressEvent::SessionStopped {
                session_id: session_id.clone(),
            },
        );
        Ok(true)
    }

    fn delete(&self, session_id: &SessionId) -> Result<(), EngineError> {
        self.get_session(session_id)?;

        if let Some((_, cancel)) = self.active.remove(session_id) {
            cancel.cancel();
        } else {
            self.admission.withdraw(session_id);
        }

        self.session_repo.delete(session_id)?;
        tracing::info!(%session_id, "session deleted");
        Ok(())
    }

    fn queue_status(&self) -> QueueStatus {
        self.admission.status()
    }

    fn position_of(&self, session_id: &SessionId) -> Option<usize> {
        self.admission.position_of(session_id)
    }

    fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    fn stop_all(&self) -> usize {
        let count = self.active.len();
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        self.active.clear();
        count
    }
}
