//! Data models for the progress ledger.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stage of an album in the processing state machine.
///
/// Within one attempt stages only move forward along
/// `PREPARING -> CONVERTING -> ARCHIVING -> FINALIZING -> COMPLETED`.
/// Every in-flight stage may drop into its own `FAILED_*` terminal, from
/// which a new attempt starts again at `PREPARING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStage {
    Preparing,
    Converting,
    Archiving,
    Finalizing,
    Completed,      // terminal
    FailedPrepare,  // terminal
    FailedConvert,  // terminal
    FailedArchive,  // terminal
    FailedFinalize, // terminal
}

impl ProcessingStage {
    pub const ALL: [ProcessingStage; 9] = [
        ProcessingStage::Preparing,
        ProcessingStage::Converting,
        ProcessingStage::Archiving,
        ProcessingStage::Finalizing,
        ProcessingStage::Completed,
        ProcessingStage::FailedPrepare,
        ProcessingStage::FailedConvert,
        ProcessingStage::FailedArchive,
        ProcessingStage::FailedFinalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Preparing => "PREPARING",
            ProcessingStage::Converting => "CONVERTING",
            ProcessingStage::Archiving => "ARCHIVING",
            ProcessingStage::Finalizing => "FINALIZING",
            ProcessingStage::Completed => "COMPLETED",
            ProcessingStage::FailedPrepare => "FAILED_PREPARE",
            ProcessingStage::FailedConvert => "FAILED_CONVERT",
            ProcessingStage::FailedArchive => "FAILED_ARCHIVE",
            ProcessingStage::FailedFinalize => "FAILED_FINALIZE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// Returns true for COMPLETED and every FAILED_* stage.
    pub fn is_terminal(&self) -> bool {
        *self == ProcessingStage::Completed || self.is_failure()
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProcessingStage::FailedPrepare
                | ProcessingStage::FailedConvert
                | ProcessingStage::FailedArchive
                | ProcessingStage::FailedFinalize
        )
    }

    /// The next stage of a successful attempt.
    pub fn next(&self) -> Option<Self> {
        match self {
            ProcessingStage::Preparing => Some(ProcessingStage::Converting),
            ProcessingStage::Converting => Some(ProcessingStage::Archiving),
            ProcessingStage::Archiving => Some(ProcessingStage::Finalizing),
            ProcessingStage::Finalizing => Some(ProcessingStage::Completed),
            _ => None,
        }
    }

    /// The FAILED_* terminal an in-flight stage falls into.
    pub fn failure(&self) -> Option<Self> {
        match self {
            ProcessingStage::Preparing => Some(ProcessingStage::FailedPrepare),
            ProcessingStage::Converting => Some(ProcessingStage::FailedConvert),
            ProcessingStage::Archiving => Some(ProcessingStage::FailedArchive),
            ProcessingStage::Finalizing => Some(ProcessingStage::FailedFinalize),
            _ => None,
        }
    }

    /// Whether the ledger accepts moving a record from `self` to `next`.
    ///
    /// Besides the forward chain and the failure edges, any non-completed
    /// record may restart at PREPARING. FAILED_FINALIZE may also re-enter
    /// FINALIZING, which the orchestrator only does once the output is
    /// already verified on disk.
    pub fn can_transition_to(&self, next: ProcessingStage) -> bool {
        if *self == next {
            return true;
        }
        if *self == ProcessingStage::Completed {
            return false;
        }
        if next == ProcessingStage::Preparing {
            return true;
        }
        if *self == ProcessingStage::FailedFinalize && next == ProcessingStage::Finalizing {
            return true;
        }
        self.next() == Some(next) || self.failure() == Some(next)
    }

    /// Lowercase name used in user facing reports ("failed at converting").
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingStage::Preparing | ProcessingStage::FailedPrepare => "preparing",
            ProcessingStage::Converting | ProcessingStage::FailedConvert => "converting",
            ProcessingStage::Archiving | ProcessingStage::FailedArchive => "archiving",
            ProcessingStage::Finalizing | ProcessingStage::FailedFinalize => "finalizing",
            ProcessingStage::Completed => "completed",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single track inside an album.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Pending,
    Converted,
    /// Convertible format whose conversion is disabled; copied through unchanged.
    Skipped,
    Failed,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Pending => "pending",
            TrackStatus::Converted => "converted",
            TrackStatus::Skipped => "skipped",
            TrackStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TrackStatus::Pending),
            "converted" => Some(TrackStatus::Converted),
            "skipped" => Some(TrackStatus::Skipped),
            "failed" => Some(TrackStatus::Failed),
            _ => None,
        }
    }

    /// Done tracks are not touched again on resume.
    pub fn is_done(&self) -> bool {
        matches!(self, TrackStatus::Converted | TrackStatus::Skipped)
    }
}

/// Per-file progress within a processing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRecord {
    /// Path of the source file relative to the album root.
    pub source_path: PathBuf,
    /// Absolute path of the produced file, once produced.
    pub output_path: Option<PathBuf>,
    pub status: TrackStatus,
    pub attempts: u32,
    pub message: Option<String>,
}

impl TrackRecord {
    pub fn pending(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            output_path: None,
            status: TrackStatus::Pending,
            attempts: 0,
            message: None,
        }
    }
}

/// Durable per-album, per-session processing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRecord {
    pub id: String,
    pub session_id: String,
    /// Original album location, the record's natural key within a session.
    pub album_path: PathBuf,
    pub album_name: String,
    pub album_id: Option<String>,
    pub content_fingerprint: Option<String>,
    pub stage: ProcessingStage,
    /// Attempt counter, bumped every time the record re-enters PREPARING.
    pub attempt: u32,
    pub working_source_path: Option<PathBuf>,
    pub working_processed_path: Option<PathBuf>,
    /// Timestamp component of the archive directory name, fixed before copying.
    pub archive_stamp: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    /// Set while the original album was removed to make room for in-place output.
    pub source_displaced: bool,
    pub error_message: Option<String>,
    pub superseded_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub tracks: Vec<TrackRecord>,
}

impl ProcessingRecord {
    pub fn track(&self, source_path: &std::path::Path) -> Option<&TrackRecord> {
        self.tracks.iter().find(|t| t.source_path == source_path)
    }

    pub fn has_working_paths(&self) -> bool {
        self.working_source_path.is_some() || self.working_processed_path.is_some()
    }
}

/// Tri-state update for an optional record field.
///
/// `Keep` leaves the stored value alone, `Clear` writes NULL and `Set`
/// replaces the value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    /// Resolve the update against the currently stored value.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            FieldUpdate::Keep => current,
            FieldUpdate::Clear => None,
            FieldUpdate::Set(value) => Some(value),
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }
}

impl<T> From<Option<T>> for FieldUpdate<T> {
    /// `Some` sets, `None` clears. Use `FieldUpdate::Keep` explicitly to leave a field alone.
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldUpdate::Set(v),
            None => FieldUpdate::Clear,
        }
    }
}

/// The complete set of changes a single `upsert` may apply to a record.
///
/// Records are addressed by `(session_id, album_path)`. Every updatable
/// field is listed here; there is no other way to mutate a record.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub session_id: String,
    pub album_path: PathBuf,
    pub album_name: String,
    pub stage: Option<ProcessingStage>,
    pub album_id: FieldUpdate<String>,
    pub content_fingerprint: FieldUpdate<String>,
    pub working_source_path: FieldUpdate<PathBuf>,
    pub working_processed_path: FieldUpdate<PathBuf>,
    pub archive_stamp: FieldUpdate<String>,
    pub archive_path: FieldUpdate<PathBuf>,
    pub output_path: FieldUpdate<PathBuf>,
    pub error_message: FieldUpdate<String>,
    pub source_displaced: Option<bool>,
    /// Tracks to insert or replace, matched on `source_path`.
    pub tracks: Vec<TrackRecord>,
    /// Earlier-session record whose staging this record takes over.
    pub supersedes: Option<String>,
}

impl RecordUpdate {
    pub fn new(
        session_id: impl Into<String>,
        album_path: impl Into<PathBuf>,
        album_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            album_path: album_path.into(),
            album_name: album_name.into(),
            ..Default::default()
        }
    }

    pub fn with_stage(mut self, stage: ProcessingStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_album_id(mut self, album_id: impl Into<String>) -> Self {
        self.album_id = FieldUpdate::Set(album_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.content_fingerprint = FieldUpdate::Set(fingerprint.into());
        self
    }

    pub fn with_working_paths(mut self, source: PathBuf, processed: PathBuf) -> Self {
        self.working_source_path = FieldUpdate::Set(source);
        self.working_processed_path = FieldUpdate::Set(processed);
        self
    }

    pub fn clear_working_paths(mut self) -> Self {
        self.working_source_path = FieldUpdate::Clear;
        self.working_processed_path = FieldUpdate::Clear;
        self
    }

    pub fn with_archive_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.archive_stamp = FieldUpdate::Set(stamp.into());
        self
    }

    pub fn with_archive_path(mut self, path: PathBuf) -> Self {
        self.archive_path = FieldUpdate::Set(path);
        self
    }

    /// Drop the archive name and location of an attempt over other content.
    pub fn clear_archive(mut self) -> Self {
        self.archive_stamp = FieldUpdate::Clear;
        self.archive_path = FieldUpdate::Clear;
        self
    }

    pub fn with_output_path(mut self, path: PathBuf) -> Self {
        self.output_path = FieldUpdate::Set(path);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = FieldUpdate::Set(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = FieldUpdate::Clear;
        self
    }

    pub fn with_source_displaced(mut self, displaced: bool) -> Self {
        self.source_displaced = Some(displaced);
        self
    }

    pub fn with_track(mut self, track: TrackRecord) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn with_tracks(mut self, tracks: impl IntoIterator<Item = TrackRecord>) -> Self {
        self.tracks.extend(tracks);
        self
    }

    pub fn superseding(mut self, record_id: impl Into<String>) -> Self {
        self.supersedes = Some(record_id.into());
        self
    }
}

/// Lifecycle of a processing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Completed => "COMPLETED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(SessionStatus::Running),
            "PAUSED" => Some(SessionStatus::Paused),
            "COMPLETED" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

/// One batch run over an input directory.
///
/// Passed explicitly through the pipeline; there is no process-wide session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub status: SessionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// Aggregated counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total_albums: usize,
    pub albums_by_stage: BTreeMap<ProcessingStage, usize>,
    pub tracks_by_status: BTreeMap<TrackStatus, usize>,
}

impl SessionStats {
    pub fn albums_in(&self, stage: ProcessingStage) -> usize {
        self.albums_by_stage.get(&stage).copied().unwrap_or(0)
    }

    pub fn tracks_in(&self, status: TrackStatus) -> usize {
        self.tracks_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn failed_albums(&self) -> usize {
        self.albums_by_stage
            .iter()
            .filter(|(stage, _)| stage.is_failure())
            .map(|(_, count)| count)
            .sum()
    }
}
