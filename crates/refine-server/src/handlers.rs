//! RPC method handlers.

use std::sync::Arc;

use refine_core::ids::SessionId;
use refine_core::session::ProcessingMode;
use refine_engine::EngineError;
use refine_store::error::StoreError;
use refine_store::segments::SegmentRepo;
use refine_store::sessions::SessionRepo;
use refine_store::Database;

use crate::client::{ClientId, ClientRegistry};
use crate::orchestrator::{SessionOrchestrator, SubmitOutcome, SubmitParams};
use crate::rpc::{self, RpcResponse};
use crate::wire;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub orchestrator: Option<Arc<dyn SessionOrchestrator>>,
}

impl HandlerState {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            orchestrator: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn SessionOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }
}

/// The WebSocket connection a request arrived on. `session.subscribe`
/// mutates per-connection state, so it needs this; HTTP entry points pass
/// None.
pub struct ConnectionContext {
    pub registry: Arc<ClientRegistry>,
    pub client_id: ClientId,
}

/// Dispatch an RPC method to the appropriate handler.
///
/// Normalizes camelCase params to snake_case before routing, so all
/// handlers receive consistent snake_case keys.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    conn: Option<&ConnectionContext>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = wire::normalize_params(params);

    match method {
        // Session lifecycle (orchestrator-dependent)
        "session.submit" => session_submit(state, &params, id).await,
        "session.stop" => session_stop(state, &params, id),
        "session.retry" => session_retry(state, &params, id).await,
        "session.delete" => session_delete(state, &params, id),

        // Session reads
        "session.get" => session_get(state, &params, id),
        "session.list" => session_list(state, &params, id),
        "session.progress" => session_progress(state, &params, id),
        "session.export" => session_export(state, &params, id),

        // Events
        "session.subscribe" => session_subscribe(state, conn, &params, id).await,

        // Queue
        "queue.status" => queue_status(state, &params, id),

        // System
        "system.ping" => system_ping(id),
        "system.health" | "health" => system_health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn engine_error_response(id: Option<serde_json::Value>, error: EngineError) -> RpcResponse {
    match error {
        EngineError::SessionNotFound(msg) => {
            RpcResponse::not_found(id, format!("Session not found: {msg}"))
        }
        EngineError::InvalidInput(msg) => RpcResponse::invalid_params(id, msg),
        EngineError::NotRetryable(msg) => RpcResponse::error(id, rpc::INVALID_REQUEST, msg),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

fn store_error_response(id: Option<serde_json::Value>, error: StoreError) -> RpcResponse {
    match error {
        StoreError::NotFound(msg) => RpcResponse::not_found(id, msg),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

fn outcome_json(outcome: &SubmitOutcome) -> serde_json::Value {
    serde_json::json!({
        "sessionId": outcome.session_id.to_string(),
        "status": "queued",
        "totalSegments": outcome.total_segments,
        "queuePosition": outcome.queue_position,
        "estimatedWaitSecs": outcome.estimated_wait.as_secs(),
    })
}

// ── Session lifecycle ──

async fn session_submit(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref orchestrator) = state.orchestrator else {
        return RpcResponse::internal_error(id, "Session orchestrator not configured");
    };

    let text = match rpc::require_str(params, "text") {
        Ok(t) => t.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let mode: ProcessingMode = match rpc::require_str(params, "mode") {
        Ok(m) => match m.parse() {
            Ok(mode) => mode,
            Err(e) => return RpcResponse::invalid_params(id, e),
        },
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let owner = rpc::optional_str(params, "owner").map(str::to_string);

    match orchestrator.submit(SubmitParams { text, mode, owner }).await {
        Ok(outcome) => RpcResponse::success(id, outcome_json(&outcome)),
        Err(e) => engine_error_response(id, e),
    }
}

fn session_stop(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref orchestrator) = state.orchestrator else {
        return RpcResponse::internal_error(id, "Session orchestrator not configured");
    };

    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match orchestrator.stop(&session_id) {
        Ok(stopped) => RpcResponse::success(id, serde_json::json!({"stopped": stopped})),
        Err(e) => engine_error_response(id, e),
    }
}

async fn session_retry(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref orchestrator) = state.orchestrator else {
        return RpcResponse::internal_error(id, "Session orchestrator not configured");
    };

    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match orchestrator.retry(&session_id).await {
        Ok(outcome) => RpcResponse::success(id, outcome_json(&outcome)),
        Err(e) => engine_error_response(id, e),
    }
}

fn session_delete(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref orchestrator) = state.orchestrator else {
        return RpcResponse::internal_error(id, "Session orchestrator not configured");
    };

    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match orchestrator.delete(&session_id) {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"deleted": true})),
        Err(e) => engine_error_response(id, e),
    }
}

// ── Session reads ──

fn session_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let session = match SessionRepo::new(state.db.clone()).get(&session_id) {
        Ok(s) => s,
        Err(e) => return store_error_response(id, e),
    };
    let segments = match SegmentRepo::new(state.db.clone()).list(&session_id) {
        Ok(s) => s,
        Err(e) => return store_error_response(id, e),
    };

    let mut result = wire::session_to_wire(&session);
    result["segments"] = serde_json::Value::Array(
        segments.iter().map(wire::segment_to_wire).collect(),
    );
    RpcResponse::success(id, result)
}

fn session_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let owner = rpc::optional_str(params, "owner");
    let limit = rpc::optional_i64(params, "limit").unwrap_or(50).clamp(1, 500) as u32;
    let offset = rpc::optional_i64(params, "offset").unwrap_or(0).max(0) as u32;

    match SessionRepo::new(state.db.clone()).list(owner, limit, offset) {
        Ok(sessions) => {
            let items: Vec<serde_json::Value> =
                sessions.iter().map(wire::session_to_wire).collect();
            RpcResponse::success(
                id,
                serde_json::json!({"sessions": items, "count": items.len()}),
            )
        }
        Err(e) => store_error_response(id, e),
    }
}

fn session_progress(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let session = match SessionRepo::new(state.db.clone()).get(&session_id) {
        Ok(s) => s,
        Err(e) => return store_error_response(id, e),
    };
    let counts = match SegmentRepo::new(state.db.clone()).counts(&session_id) {
        Ok(c) => c,
        Err(e) => return store_error_response(id, e),
    };

    RpcResponse::success(id, wire::progress_to_wire(&session, &counts))
}

fn session_export(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    if let Err(e) = SessionRepo::new(state.db.clone()).get(&session_id) {
        return store_error_response(id, e);
    }
    let segments = match SegmentRepo::new(state.db.clone()).list(&session_id) {
        Ok(s) => s,
        Err(e) => return store_error_response(id, e),
    };

    let text = segments
        .iter()
        .map(|s| s.final_text())
        .collect::<Vec<_>>()
        .join("\n\n");

    RpcResponse::success(
        id,
        serde_json::json!({
            "sessionId": session_id.to_string(),
            "text": text,
        }),
    )
}

// ── Events ──

async fn session_subscribe(
    state: &Arc<HandlerState>,
    conn: Option<&ConnectionContext>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    // Subscribing to an unknown session would silently deliver nothing.
    if let Err(e) = SessionRepo::new(state.db.clone()).get(&session_id) {
        return store_error_response(id, e);
    }

    let Some(conn) = conn else {
        return RpcResponse::error(
            id,
            rpc::INVALID_REQUEST,
            "session.subscribe requires a WebSocket connection",
        );
    };

    conn.registry.subscribe(&conn.client_id, session_id.clone());

    RpcResponse::success(
        id,
        serde_json::json!({
            "subscribed": true,
            "sessionId": session_id.to_string(),
        }),
    )
}

// ── Queue ──

fn queue_status(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref orchestrator) = state.orchestrator else {
        return RpcResponse::internal_error(id, "Session orchestrator not configured");
    };

    let status = orchestrator.queue_status();
    let queued: Vec<serde_json::Value> = status
        .queued
        .iter()
        .map(|entry| {
            serde_json::json!({
                "sessionId": entry.session_id.to_string(),
                "position": entry.position,
                "estimatedWaitSecs": entry.estimated_wait.as_secs(),
            })
        })
        .collect();

    let mut result = serde_json::json!({
        "active": status.active,
        "maxConcurrent": status.ceiling,
        "queueLength": status.queued.len(),
        "queued": queued,
    });

    if let Ok(raw) = rpc::require_str(params, "session_id") {
        let session_id = SessionId::from_raw(raw);
        result["running"] = serde_json::json!(orchestrator.is_active(&session_id));
        result["position"] = serde_json::json!(orchestrator.position_of(&session_id));
    }

    RpcResponse::success(id, result)
}

// ── System ──

fn system_ping(id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "pong": true,
            "timestamp": wire::now_iso8601(),
        }),
    )
}

fn system_health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .is_ok();

    let status = if db_ok { "healthy" } else { "unhealthy" };
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": status,
            "database": db_ok,
            "timestamp": wire::now_iso8601(),
        }),
    )
}
