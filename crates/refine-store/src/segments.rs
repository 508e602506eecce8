use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use refine_core::ids::SessionId;
use refine_core::session::{SegmentStatus, Stage};
use refine_core::text::truncate_str;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const MAX_ERROR_BYTES: usize = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentRow {
    pub session_id: SessionId,
    pub idx: u32,
    pub source_text: String,
    pub polished_text: Option<String>,
    pub enhanced_text: Option<String>,
    pub status: SegmentStatus,
    /// Set when the segment was classified as a heading (below the skip
    /// threshold) and skipped without transformation.
    pub is_heading: bool,
    pub error_message: Option<String>,
    pub completed_at: Option<String>,
}

impl SegmentRow {
    /// The text this segment contributes to the final document: the output
    /// of the last stage that ran, falling back to the source for skipped
    /// or unprocessed segments.
    pub fn final_text(&self) -> &str {
        self.enhanced_text
            .as_deref()
            .or(self.polished_text.as_deref())
            .unwrap_or(&self.source_text)
    }
}

/// Aggregate segment counts for progress reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentCounts {
    pub settled: u32,
    pub total: u32,
}

impl SegmentCounts {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.settled as u64 * 100) / self.total as u64) as u8
        }
    }
}

pub struct SegmentRepo {
    db: Database,
}

impl SegmentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the split segments for a session, all pending, in index order.
    #[instrument(skip(self, texts), fields(session_id = %session_id, count = texts.len()))]
    pub fn insert_batch(
        &self,
        session_id: &SessionId,
        texts: &[String],
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO segments (session_id, idx, source_text, status)
                 VALUES (?1, ?2, ?3, 'pending')",
            )?;
            for (idx, text) in texts.iter().enumerate() {
                stmt.execute(rusqlite::params![session_id.as_str(), idx as i64, text])?;
            }
            Ok(())
        })
    }

    /// List all segments for a session in index order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<SegmentRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, idx, source_text, polished_text, enhanced_text,
                        status, is_heading, error_message, completed_at
                 FROM segments WHERE session_id = ?1 ORDER BY idx",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_segment(row)?);
            }
            Ok(results)
        })
    }

    /// Get one segment.
    pub fn get(&self, session_id: &SessionId, idx: u32) -> Result<SegmentRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, idx, source_text, polished_text, enhanced_text,
                        status, is_heading, error_message, completed_at
                 FROM segments WHERE session_id = ?1 AND idx = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), idx])?;
            match rows.next()? {
                Some(row) => row_to_segment(row),
                None => Err(StoreError::NotFound(format!(
                    "segment {idx} of session {session_id}"
                ))),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, idx))]
    pub fn mark_processing(&self, session_id: &SessionId, idx: u32) -> Result<(), StoreError> {
        self.set_status(session_id, idx, "processing")
    }

    /// Store one stage's output. Enhance writes its own column; every other
    /// stage writes the primary output column.
    #[instrument(skip(self, text), fields(session_id = %session_id, idx, stage = %stage))]
    pub fn store_output(
        &self,
        session_id: &SessionId,
        idx: u32,
        stage: Stage,
        text: &str,
    ) -> Result<(), StoreError> {
        let column = match stage {
            Stage::Enhance => "enhanced_text",
            Stage::Polish | Stage::EmotionRewrite => "polished_text",
        };
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE segments SET {column} = ?1 WHERE session_id = ?2 AND idx = ?3"),
                rusqlite::params![text, session_id.as_str(), idx],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, idx))]
    pub fn mark_done(&self, session_id: &SessionId, idx: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE segments SET status = 'done', completed_at = ?1
                 WHERE session_id = ?2 AND idx = ?3",
                rusqlite::params![now, session_id.as_str(), idx],
            )?;
            Ok(())
        })
    }

    /// Mark a heading/noise segment skipped without transformation.
    #[instrument(skip(self), fields(session_id = %session_id, idx))]
    pub fn mark_skipped(&self, session_id: &SessionId, idx: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE segments SET status = 'skipped', is_heading = 1, completed_at = ?1
                 WHERE session_id = ?2 AND idx = ?3",
                rusqlite::params![now, session_id.as_str(), idx],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, error), fields(session_id = %session_id, idx))]
    pub fn mark_failed(
        &self,
        session_id: &SessionId,
        idx: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        let error = truncate_str(error, MAX_ERROR_BYTES);
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE segments SET status = 'failed', error_message = ?1
                 WHERE session_id = ?2 AND idx = ?3",
                rusqlite::params![error, session_id.as_str(), idx],
            )?;
            Ok(())
        })
    }

    /// Settled (done or skipped) vs total counts for progress reporting.
    pub fn counts(&self, session_id: &SessionId) -> Result<SegmentCounts, StoreError> {
        self.db.with_conn(|conn| {
            let (settled, total): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(status IN ('done', 'skipped')), 0), COUNT(*)
                 FROM segments WHERE session_id = ?1",
                [session_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(SegmentCounts {
                settled: settled as u32,
                total: total as u32,
            })
        })
    }

    /// First segment that is neither done nor skipped, i.e. where a resume
    /// re-enters the pipeline. None when every segment is settled.
    pub fn first_unsettled(&self, session_id: &SessionId) -> Result<Option<u32>, StoreError> {
        self.db.with_conn(|conn| {
            let idx: Option<i64> = conn.query_row(
                "SELECT MIN(idx) FROM segments
                 WHERE session_id = ?1 AND status NOT IN ('done', 'skipped')",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(idx.map(|i| i as u32))
        })
    }

    /// Reset in-flight and failed segments to pending ahead of a retry.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn reset_unsettled(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE segments SET status = 'pending', error_message = NULL
                 WHERE session_id = ?1 AND status IN ('processing', 'failed')",
                [session_id.as_str()],
            )?;
            Ok(())
        })
    }

    fn set_status(
        &self,
        session_id: &SessionId,
        idx: u32,
        status: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE segments SET status = ?1 WHERE session_id = ?2 AND idx = ?3",
                rusqlite::params![status, session_id.as_str(), idx],
            )?;
            Ok(())
        })
    }
}

fn row_to_segment(row: &rusqlite::Row<'_>) -> Result<SegmentRow, StoreError> {
    let status_str: String = row_helpers::get(row, 5, "segments", "status")?;

    Ok(SegmentRow {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "segments", "session_id")?),
        idx: row_helpers::get::<i64>(row, 1, "segments", "idx")? as u32,
        source_text: row_helpers::get(row, 2, "segments", "source_text")?,
        polished_text: row_helpers::get_opt(row, 3, "segments", "polished_text")?,
        enhanced_text: row_helpers::get_opt(row, 4, "segments", "enhanced_text")?,
        status: row_helpers::parse_enum(&status_str, "segments", "status")?,
        is_heading: row_helpers::get::<i64>(row, 6, "segments", "is_heading")? != 0,
        error_message: row_helpers::get_opt(row, 7, "segments", "error_message")?,
        completed_at: row_helpers::get_opt(row, 8, "segments", "completed_at")?,
    })
}
