//! Durable embedding work queue.
//!
//! The queue is the sole authority for ingestion state. Rows are keyed by
//! (source_type, source_id); re-enqueueing resets a row to pending. Status
//! codes: -1 pending, 0 success, positive = terminally failed (the value is
//! the attempt count at exhaustion).
use crate::errors::Result;
use crate::store::{VectorDb, now_ms};
use rusqlite::{Connection, OptionalExtension, params};

pub const STATUS_PENDING: i64 = -1;
pub const STATUS_SUCCESS: i64 = 0;

/// Literal one-line prefix packing pair/parent metadata into the queued text.
const META_PREFIX: &str = "MEMO_META:";

/// One queued document.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub source_type: String,
    pub source_id: i64,
    pub text: String,
    pub status: i64,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

/// Queue row counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Prepend the metadata line when either relation is present. Absence of the
/// prefix means both are null.
pub(crate) fn pack_meta(text: &str, pair_id: Option<i64>, parent_id: Option<i64>) -> String {
    if pair_id.is_none() && parent_id.is_none() {
        return text.to_string();
    }
    let pair = pair_id.map(|v| v.to_string()).unwrap_or_default();
    let parent = parent_id.map(|v| v.to_string()).unwrap_or_default();
    format!("{META_PREFIX}{pair},{parent}\n{text}")
}

/// Strip the metadata line back out. Tolerates a malformed prefix by
/// treating the whole string as payload.
pub(crate) fn unpack_meta(stored: &str) -> (Option<i64>, Option<i64>, &str) {
    let Some(rest) = stored.strip_prefix(META_PREFIX) else {
        return (None, None, stored);
    };
    let Some((header, payload)) = rest.split_once('\n') else {
        return (None, None, stored);
    };
    let Some((pair, parent)) = header.split_once(',') else {
        return (None, None, stored);
    };
    (pair.parse().ok(), parent.parse().ok(), payload)
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        source_type: row.get(1)?,
        source_id: row.get(2)?,
        text: row.get(3)?,
        status: row.get(4)?,
        error_message: row.get(5)?,
        attempts: row.get::<_, i64>(6)? as u32,
        created_at: row.get(7)?,
        processed_at: row.get(8)?,
    })
}

const ITEM_COLUMNS: &str =
    "id, source_type, source_id, text, status, error_message, attempts, created_at, processed_at";

/// Upsert a work item. On conflict the text is replaced and the row returns
/// to pending with a clean slate: attempts 0, no error, no processed_at.
pub(crate) fn enqueue(
    conn: &Connection,
    source_type: &str,
    source_id: i64,
    text_with_meta: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO embed_queue (source_type, source_id, text, status, attempts, created_at)
         VALUES (?1, ?2, ?3, -1, 0, ?4)
         ON CONFLICT(source_type, source_id) DO UPDATE SET
             text = excluded.text,
             status = -1,
             error_message = NULL,
             attempts = 0,
             processed_at = NULL",
        params![source_type, source_id, text_with_meta, now_ms()],
    )?;
    Ok(())
}

/// The oldest pending items, up to `batch_size`.
pub(crate) fn pending_batch(conn: &Connection, batch_size: usize) -> Result<Vec<QueueItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM embed_queue
         WHERE status = -1 ORDER BY created_at ASC, id ASC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(params![batch_size as i64], item_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn get_item(
    conn: &Connection,
    source_type: &str,
    source_id: i64,
) -> Result<Option<QueueItem>> {
    conn.query_row(
        &format!(
            "SELECT {ITEM_COLUMNS} FROM embed_queue
             WHERE source_type = ?1 AND source_id = ?2"
        ),
        params![source_type, source_id],
        item_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn mark_success(conn: &Connection, id: i64, attempts: u32) -> Result<()> {
    conn.execute(
        "UPDATE embed_queue SET status = 0, attempts = ?2, error_message = NULL, processed_at = ?3
         WHERE id = ?1",
        params![id, i64::from(attempts), now_ms()],
    )?;
    Ok(())
}

/// Record a failed attempt. Non-terminal failures stay pending for the next
/// pass; a terminal failure freezes the row with status = attempts.
pub(crate) fn record_failure(
    conn: &Connection,
    id: i64,
    attempts: u32,
    error: &str,
    terminal: bool,
) -> Result<()> {
    if terminal {
        conn.execute(
            "UPDATE embed_queue
             SET status = ?2, attempts = ?2, error_message = ?3, processed_at = ?4
             WHERE id = ?1",
            params![id, i64::from(attempts), error, now_ms()],
        )?;
    } else {
        conn.execute(
            "UPDATE embed_queue SET attempts = ?2, error_message = ?3 WHERE id = ?1",
            params![id, i64::from(attempts), error],
        )?;
    }
    Ok(())
}

impl VectorDb {
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let (pending, succeeded, failed): (i64, i64, i64) = conn.query_row(
            "SELECT
                 COUNT(*) FILTER (WHERE status = -1),
                 COUNT(*) FILTER (WHERE status = 0),
                 COUNT(*) FILTER (WHERE status > 0)
             FROM embed_queue",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(QueueStats {
            pending: pending as u64,
            succeeded: succeeded as u64,
            failed: failed as u64,
        })
    }

    /// Terminally failed items, newest first, for inspection.
    pub fn list_queue_failures(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM embed_queue
             WHERE status > 0 ORDER BY processed_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], item_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop pending items that have not been processed. Returns rows removed.
    pub fn clear_pending_queue(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM embed_queue WHERE status = -1", [])?)
    }

    /// Drop terminally failed items. Returns rows removed.
    pub fn clear_failed_queue(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM embed_queue WHERE status > 0", [])?)
    }
}
