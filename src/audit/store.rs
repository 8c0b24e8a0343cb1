//! SQLite sink for processing history.

use super::models::{HistoryEntry, HistoryOperation, HistoryStatus};
use crate::ledger::SqliteProgressLedger;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only storage of history entries.
pub trait AuditStore: Send + Sync {
    /// Append entries in order. All or nothing.
    fn append(&self, entries: &[HistoryEntry]) -> Result<()>;

    /// All entries for an album, oldest first.
    fn entries_for_album(&self, album_path: &Path) -> Result<Vec<HistoryEntry>>;
}

/// History store sharing the ledger's SQLite connection.
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    pub fn new(ledger: &SqliteProgressLedger) -> Self {
        Self {
            conn: ledger.connection(),
        }
    }

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
        Ok(HistoryEntry {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            session_id: row.get("session_id")?,
            album_id: row.get("album_id")?,
            album_path: PathBuf::from(row.get::<_, String>("album_path")?),
            operation: HistoryOperation::from_str(&row.get::<_, String>("operation")?)
                .unwrap_or(HistoryOperation::Convert),
            status: HistoryStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(HistoryStatus::Failed),
            error: row.get("error")?,
            duration_ms: row.get("duration_ms")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            working_source_path: row
                .get::<_, Option<String>>("working_source_path")?
                .map(PathBuf::from),
            working_processed_path: row
                .get::<_, Option<String>>("working_processed_path")?
                .map(PathBuf::from),
            details: row
                .get::<_, Option<String>>("details")?
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, entries: &[HistoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for entry in entries {
            tx.execute(
                r#"INSERT INTO processing_history (
                    timestamp, session_id, album_id, album_path, operation, status,
                    error, duration_ms, started_at, finished_at,
                    working_source_path, working_processed_path, details
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
                params![
                    entry.timestamp,
                    entry.session_id,
                    entry.album_id,
                    Self::path_str(&entry.album_path),
                    entry.operation.as_str(),
                    entry.status.as_str(),
                    entry.error,
                    entry.duration_ms,
                    entry.started_at,
                    entry.finished_at,
                    entry.working_source_path.as_deref().map(Self::path_str),
                    entry.working_processed_path.as_deref().map(Self::path_str),
                    entry.details.as_ref().map(|d| d.to_string()),
                ],
            )?;
        }
        tx.commit().context("Failed to commit history entries")?;
        Ok(())
    }

    fn entries_for_album(&self, album_path: &Path) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_history WHERE album_path = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([Self::path_str(album_path)], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
