//! Wire format for the WebSocket API.
//!
//! RPC params arrive in camelCase from clients and are normalized to
//! snake_case before dispatch; responses and pushed events go out in
//! camelCase.

use serde::Serialize;

use refine_core::events::ProgressEvent;
use refine_store::segments::{SegmentCounts, SegmentRow};
use refine_store::sessions::SessionRow;

/// camelCase param keys and their snake_case equivalents.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[("sessionId", "session_id")];

/// Normalize camelCase params to snake_case for the handlers.
/// If the snake_case key already exists, the existing value takes precedence.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if !result.contains_key(snake) {
            if let Some(val) = result.remove(camel) {
                result.insert(snake.to_string(), val);
            }
        } else {
            result.remove(camel);
        }
    }
    serde_json::Value::Object(result)
}

/// Pushed progress event. Envelope structure: `{ type, sessionId, timestamp, data }`.
#[derive(Debug, Serialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub timestamp: String,
    pub data: serde_json::Value,
}

/// Map internal event type names to the wire format (session.* prefix).
pub fn wire_event_type(internal_type: &str) -> String {
    match internal_type {
        "delta" => "session.delta".into(),
        "stage_complete" => "session.stage_complete".into(),
        "segment_skipped" => "session.segment_skipped".into(),
        "session_complete" => "session.complete".into(),
        "session_failed" => "session.failed".into(),
        "session_stopped" => "session.stopped".into(),
        "history_compressed" => "session.history_compressed".into(),
        other => format!("session.{other}"),
    }
}

pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Convert an internal ProgressEvent to the wire envelope.
pub fn progress_event_to_wire(event: &ProgressEvent) -> WireEvent {
    let event_type = wire_event_type(event.event_type());
    let session_id = event.session_id().to_string();
    let timestamp = now_iso8601();

    let data = match event {
        ProgressEvent::Delta {
            segment_index,
            stage,
            delta,
            ..
        } => serde_json::json!({
            "segmentIndex": segment_index,
            "stage": stage.to_string(),
            "delta": delta,
        }),
        ProgressEvent::StageComplete {
            segment_index,
            stage,
            text,
            ..
        } => serde_json::json!({
            "segmentIndex": segment_index,
            "stage": stage.to_string(),
            "text": text,
        }),
        ProgressEvent::SegmentSkipped { segment_index, .. } => serde_json::json!({
            "segmentIndex": segment_index,
        }),
        ProgressEvent::SessionComplete { .. } => serde_json::json!({}),
        ProgressEvent::SessionFailed {
            segment_index,
            error,
            ..
        } => serde_json::json!({
            "segmentIndex": segment_index,
            "error": error,
        }),
        ProgressEvent::SessionStopped { .. } => serde_json::json!({}),
        ProgressEvent::HistoryCompressed {
            chars_before,
            chars_after,
            ..
        } => serde_json::json!({
            "charsBefore": chars_before,
            "charsAfter": chars_after,
        }),
    };

    WireEvent {
        event_type,
        session_id,
        timestamp,
        data,
    }
}

/// Convert a SessionRow to camelCase wire format.
pub fn session_to_wire(session: &SessionRow) -> serde_json::Value {
    serde_json::json!({
        "id": session.id.to_string(),
        "owner": session.owner,
        "mode": session.mode.to_string(),
        "status": session.status.to_string(),
        "cursor": session.cursor,
        "totalSegments": session.total_segments,
        "errorMessage": session.error_message,
        "createdAt": session.created_at,
        "updatedAt": session.updated_at,
        "completedAt": session.completed_at,
    })
}

/// Convert a SegmentRow to camelCase wire format.
pub fn segment_to_wire(segment: &SegmentRow) -> serde_json::Value {
    serde_json::json!({
        "index": segment.idx,
        "sourceText": segment.source_text,
        "polishedText": segment.polished_text,
        "enhancedText": segment.enhanced_text,
        "status": segment.status.to_string(),
        "isHeading": segment.is_heading,
        "errorMessage": segment.error_message,
        "completedAt": segment.completed_at,
    })
}

/// Point-in-time progress snapshot.
pub fn progress_to_wire(session: &SessionRow, counts: &SegmentCounts) -> serde_json::Value {
    serde_json::json!({
        "status": session.status.to_string(),
        "completed": counts.settled,
        "total": counts.total,
        "percent": counts.percent(),
        "cursor": session.cursor,
        "error": session.error_message,
    })
}
