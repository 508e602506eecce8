use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use refine_core::ids::SessionId;
use refine_core::session::{ProcessingMode, SessionStatus};
use refine_core::text::truncate_str;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Error messages are bounded before persistence so a runaway upstream body
/// never bloats the row.
const MAX_ERROR_BYTES: usize = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub owner: Option<String>,
    pub mode: ProcessingMode,
    pub status: SessionStatus,
    /// Index of the next segment to process.
    pub cursor: u32,
    pub total_segments: u32,
    /// Accumulated running history, persisted after every completed segment
    /// so a retry resumes with compressed context intact.
    pub history: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in the queued state.
    #[instrument(skip(self), fields(mode = %mode))]
    pub fn create(
        &self,
        owner: Option<&str>,
        mode: ProcessingMode,
    ) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, owner, mode, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, ?5)",
                rusqlite::params![id.as_str(), owner, mode.to_string(), now, now],
            )?;

            Ok(SessionRow {
                id,
                owner: owner.map(str::to_string),
                mode,
                status: SessionStatus::Queued,
                cursor: 0,
                total_segments: 0,
                history: String::new(),
                error_message: None,
                created_at: now.clone(),
                updated_at: now,
                completed_at: None,
            })
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner, mode, status, cursor, total_segments, history,
                        error_message, created_at, updated_at, completed_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions, newest first, optionally filtered by owner.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        owner: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params): (&str, Vec<String>) = match owner {
                Some(o) => (
                    "SELECT id, owner, mode, status, cursor, total_segments, history,
                            error_message, created_at, updated_at, completed_at
                     FROM sessions WHERE owner = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    vec![o.to_string(), limit.to_string(), offset.to_string()],
                ),
                None => (
                    "SELECT id, owner, mode, status, cursor, total_segments, history,
                            error_message, created_at, updated_at, completed_at
                     FROM sessions
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    vec![limit.to_string(), offset.to_string()],
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Update session status. Terminal statuses also set completed_at.
    #[instrument(skip(self), fields(session_id = %session_id, status = %status))]
    pub fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            if status.is_terminal() {
                conn.execute(
                    "UPDATE sessions SET status = ?1, updated_at = ?2, completed_at = ?2 WHERE id = ?3",
                    rusqlite::params![status.to_string(), now, session_id.as_str()],
                )?;
            } else {
                conn.execute(
                    "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status.to_string(), now, session_id.as_str()],
                )?;
            }
            Ok(())
        })
    }

    /// Transition to processing, clearing any prior failure message.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn mark_processing(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET status = 'processing', error_message = NULL,
                        completed_at = NULL, updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Transition to failed with a bounded error message.
    #[instrument(skip(self, error), fields(session_id = %session_id))]
    pub fn mark_failed(&self, session_id: &SessionId, error: &str) -> Result<(), StoreError> {
        let error = truncate_str(error, MAX_ERROR_BYTES);
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET status = 'failed', error_message = ?1,
                        updated_at = ?2, completed_at = ?2
                 WHERE id = ?3",
                rusqlite::params![error, now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Advance the segment cursor.
    #[instrument(skip(self), fields(session_id = %session_id, cursor))]
    pub fn update_cursor(&self, session_id: &SessionId, cursor: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET cursor = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![cursor, now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Persist the running history text.
    #[instrument(skip(self, history), fields(session_id = %session_id))]
    pub fn update_history(&self, session_id: &SessionId, history: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET history = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![history, now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Record the segment count once the document has been split.
    #[instrument(skip(self), fields(session_id = %session_id, total))]
    pub fn set_total_segments(&self, session_id: &SessionId, total: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET total_segments = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![total, now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Delete a session (hard delete — also deletes its segments).
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM segments WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                [session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Startup recovery: in-flight state is not durable, so any session left
    /// `processing` or `queued` by a previous process is marked failed and
    /// stays retryable.
    #[instrument(skip(self))]
    pub fn recover_interrupted(&self, message: &str) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE status IN ('processing', 'queued')",
            )?;
            let ids: Vec<SessionId> = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(SessionId::from_raw)
                .collect();

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET status = 'failed', error_message = ?1,
                        updated_at = ?2, completed_at = ?2
                 WHERE status IN ('processing', 'queued')",
                rusqlite::params![truncate_str(message, MAX_ERROR_BYTES), now],
            )?;
            Ok(ids)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let mode_str: String = row_helpers::get(row, 2, "sessions", "mode")?;
    let status_str: String = row_helpers::get(row, 3, "sessions", "status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        owner: row_helpers::get_opt(row, 1, "sessions", "owner")?,
        mode: row_helpers::parse_enum(&mode_str, "sessions", "mode")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        cursor: row_helpers::get::<i64>(row, 4, "sessions", "cursor")? as u32,
        total_segments: row_helpers::get::<i64>(row, 5, "sessions", "total_segments")? as u32,
        history: row_helpers::get(row, 6, "sessions", "history")?,
        error_message: row_helpers::get_opt(row, 7, "sessions", "error_message")?,
        created_at: row_helpers::get(row, 8, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 9, "sessions", "updated_at")?,
        completed_at: row_helpers::get_opt(row, 10, "sessions", "completed_at")?,
    })
}
