//! Audit history entry types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Operation an audit entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOperation {
    Prepare,
    Convert,
    Archive,
    Finalize,
    Cleanup,
}

impl HistoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOperation::Prepare => "prepare",
            HistoryOperation::Convert => "convert",
            HistoryOperation::Archive => "archive",
            HistoryOperation::Finalize => "finalize",
            HistoryOperation::Cleanup => "cleanup",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(HistoryOperation::Prepare),
            "convert" => Some(HistoryOperation::Convert),
            "archive" => Some(HistoryOperation::Archive),
            "finalize" => Some(HistoryOperation::Finalize),
            "cleanup" => Some(HistoryOperation::Cleanup),
            _ => None,
        }
    }
}

/// Outcome recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Started,
    Success,
    Failed,
    Skipped,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Started => "started",
            HistoryStatus::Success => "success",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "started" => Some(HistoryStatus::Started),
            "success" => Some(HistoryStatus::Success),
            "failed" => Some(HistoryStatus::Failed),
            "skipped" => Some(HistoryStatus::Skipped),
            _ => None,
        }
    }
}

/// A single append-only history row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: Option<i64>,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub session_id: Option<String>,
    pub album_id: Option<String>,
    pub album_path: PathBuf,
    pub operation: HistoryOperation,
    pub status: HistoryStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub working_source_path: Option<PathBuf>,
    pub working_processed_path: Option<PathBuf>,
    pub details: Option<serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(
        album_path: impl Into<PathBuf>,
        operation: HistoryOperation,
        status: HistoryStatus,
    ) -> Self {
        Self {
            id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            session_id: None,
            album_id: None,
            album_path: album_path.into(),
            operation,
            status,
            error: None,
            duration_ms: None,
            started_at: None,
            finished_at: None,
            working_source_path: None,
            working_processed_path: None,
            details: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_album_id(mut self, album_id: Option<String>) -> Self {
        self.album_id = album_id;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Record the duration and derive start/finish timestamps from it.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        let duration_ms = duration.as_millis() as i64;
        self.duration_ms = Some(duration_ms);
        self.finished_at = Some(self.timestamp);
        self.started_at = Some(self.timestamp - duration_ms);
        self
    }

    pub fn with_working_paths(
        mut self,
        source: Option<PathBuf>,
        processed: Option<PathBuf>,
    ) -> Self {
        self.working_source_path = source;
        self.working_processed_path = processed;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
