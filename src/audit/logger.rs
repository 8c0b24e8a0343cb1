//! Buffered audit trail for pipeline operations.
//!
//! Entries are collected in memory and written in one transaction on
//! [`AuditTrail::flush`]. Losing entries never affects recovery, but the
//! owner must flush before the underlying connection goes away.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::models::{HistoryEntry, HistoryOperation, HistoryStatus};
use super::store::AuditStore;
use crate::ledger::ProcessingRecord;

/// Helper for recording operation history during album processing.
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    pending: Mutex<Vec<HistoryEntry>>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn entry_for(
        record: &ProcessingRecord,
        operation: HistoryOperation,
        status: HistoryStatus,
    ) -> HistoryEntry {
        HistoryEntry::new(&record.album_path, operation, status)
            .with_session(&record.session_id)
            .with_album_id(record.album_id.clone())
            .with_working_paths(
                record.working_source_path.clone(),
                record.working_processed_path.clone(),
            )
    }

    fn push(&self, entry: HistoryEntry) {
        self.pending.lock().unwrap().push(entry);
    }

    /// Log an operation starting for an album.
    pub fn log_started(&self, record: &ProcessingRecord, operation: HistoryOperation) {
        self.push(Self::entry_for(record, operation, HistoryStatus::Started));
    }

    /// Log an operation completing successfully.
    pub fn log_succeeded(
        &self,
        record: &ProcessingRecord,
        operation: HistoryOperation,
        duration: Duration,
        details: Option<serde_json::Value>,
    ) {
        let entry =
            Self::entry_for(record, operation, HistoryStatus::Success).with_duration(duration);
        let entry = match details {
            Some(details) => entry.with_details(details),
            None => entry,
        };
        self.push(entry);
    }

    /// Log an operation failing.
    pub fn log_failed(
        &self,
        record: &ProcessingRecord,
        operation: HistoryOperation,
        duration: Duration,
        error: &str,
    ) {
        self.push(
            Self::entry_for(record, operation, HistoryStatus::Failed)
                .with_duration(duration)
                .with_error(error),
        );
    }

    /// Log a per-track conversion result.
    pub fn log_track(
        &self,
        record: &ProcessingRecord,
        track: &Path,
        success: bool,
        duration: Duration,
        message: Option<&str>,
    ) {
        let status = if success {
            HistoryStatus::Success
        } else {
            HistoryStatus::Failed
        };
        let mut details = serde_json::json!({
            "track": track.to_string_lossy(),
        });
        let mut entry =
            Self::entry_for(record, HistoryOperation::Convert, status).with_duration(duration);
        match (success, message) {
            (true, Some(message)) => details["message"] = serde_json::json!(message),
            (false, Some(message)) => entry = entry.with_error(message),
            _ => {}
        }
        self.push(entry.with_details(details));
    }

    /// Log an album skipped before any record was created.
    pub fn log_album_skipped(&self, session_id: &str, album_path: &Path, reason: &str) {
        self.push(
            HistoryEntry::new(album_path, HistoryOperation::Prepare, HistoryStatus::Skipped)
                .with_session(session_id)
                .with_details(serde_json::json!({ "reason": reason })),
        );
    }

    /// Number of entries waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Write all buffered entries. On failure the entries stay buffered.
    pub fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return Ok(());
        }
        self.store.append(&pending)?;
        pending.clear();
        Ok(())
    }
}

impl Drop for AuditTrail {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            warn!("Dropping audit trail with {} unflushed entries", pending);
        }
    }
}
