use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::SessionId;
use crate::session::Stage;

/// Progress events emitted while a session is being processed.
/// Ephemeral: delivered at most once per subscriber, never persisted or
/// replayed. Late subscribers reconcile by reading session/segment state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "delta")]
    Delta {
        session_id: SessionId,
        segment_index: u32,
        stage: Stage,
        delta: String,
    },

    #[serde(rename = "stage_complete")]
    StageComplete {
        session_id: SessionId,
        segment_index: u32,
        stage: Stage,
        text: String,
    },

    #[serde(rename = "segment_skipped")]
    SegmentSkipped {
        session_id: SessionId,
        segment_index: u32,
    },

    #[serde(rename = "session_complete")]
    SessionComplete { session_id: SessionId },

    #[serde(rename = "session_failed")]
    SessionFailed {
        session_id: SessionId,
        segment_index: Option<u32>,
        error: String,
    },

    #[serde(rename = "session_stopped")]
    SessionStopped { session_id: SessionId },

    #[serde(rename = "history_compressed")]
    HistoryCompressed {
        session_id: SessionId,
        chars_before: usize,
        chars_after: usize,
    },
}

impl ProgressEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Delta { session_id, .. }
            | Self::StageComplete { session_id, .. }
            | Self::SegmentSkipped { session_id, .. }
            | Self::SessionComplete { session_id }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionStopped { session_id }
            | Self::HistoryCompressed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::StageComplete { .. } => "stage_complete",
            Self::SegmentSkipped { .. } => "segment_skipped",
            Self::SessionComplete { .. } => "session_complete",
            Self::SessionFailed { .. } => "session_failed",
            Self::SessionStopped { .. } => "session_stopped",
            Self::HistoryCompressed { .. } => "history_compressed",
        }
    }
}

/// Send an event on the broadcast channel, tolerating the no-receiver case.
/// A session can run with zero live subscribers; processing never depends on
/// delivery.
pub fn send_event(tx: &broadcast::Sender<ProgressEvent>, event: ProgressEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("no event receivers, progress event dropped");
    }
}
