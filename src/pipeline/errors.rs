//! Stage errors.
//!
//! Each stage has its own error type. `StageError` wraps them for the
//! orchestrator and knows which FAILED_* stage an error lands the album in.

use crate::dedup::DedupError;
use crate::ledger::ProcessingStage;
use crate::staging::StagingError;
use crate::transcoder::TranscodeError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Fingerprint failed: {0}")]
    Fingerprint(#[from] DedupError),

    #[error("Original album missing and no archive to restore from: {0:?}")]
    SourceMissing(PathBuf),

    #[error("{first:?} and {second:?} would both be written to {output:?}")]
    OutputCollision {
        first: PathBuf,
        second: PathBuf,
        output: PathBuf,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("{track:?}: {message}")]
    TrackFailed { track: PathBuf, message: String },

    #[error("{failed} of {total} tracks failed")]
    TracksFailed { failed: usize, total: usize },

    #[error("Missing staging directory for {0:?}")]
    MissingStaging(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

impl ConvertError {
    /// Whether retrying the same track can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConvertError::Transcode(TranscodeError::NonAbsolutePath(_))
            | ConvertError::Transcode(TranscodeError::MissingInput(_)) => false,
            ConvertError::Transcode(_) | ConvertError::TrackFailed { .. } | ConvertError::Io(_) => {
                true
            }
            ConvertError::TracksFailed { .. }
            | ConvertError::MissingStaging(_)
            | ConvertError::Ledger(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Missing staging directory for {0:?}")]
    MissingStaging(PathBuf),

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Output location already holds other content: {0:?}")]
    OutputExists(PathBuf),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Archive missing for {0:?}, refusing to touch the original")]
    ArchiveMissing(PathBuf),

    #[error("Missing staging directory for {0:?}")]
    MissingStaging(PathBuf),

    #[error("Original {original:?} was removed and cannot be restored: {reason}")]
    StillDisplaced { original: PathBuf, reason: String },

    #[error("{cause}; originals restored from archive")]
    Restored { cause: Box<FinalizeError> },

    #[error("{cause}; restoring originals from {archive:?} also failed: {restore}")]
    RestoreFailed {
        cause: Box<FinalizeError>,
        archive: PathBuf,
        restore: StagingError,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("preparing: {0}")]
    Prepare(#[from] PrepareError),

    #[error("converting: {0}")]
    Convert(#[from] ConvertError),

    #[error("archiving: {0}")]
    Archive(#[from] ArchiveError),

    #[error("finalizing: {0}")]
    Finalize(#[from] FinalizeError),
}

impl StageError {
    /// The terminal stage this error leaves the album in.
    pub fn stage(&self) -> ProcessingStage {
        match self {
            StageError::Prepare(_) => ProcessingStage::FailedPrepare,
            StageError::Convert(_) => ProcessingStage::FailedConvert,
            StageError::Archive(_) => ProcessingStage::FailedArchive,
            StageError::Finalize(_) => ProcessingStage::FailedFinalize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_error_retryability() {
        let relative = ConvertError::Transcode(TranscodeError::NonAbsolutePath("a.dsf".into()));
        assert!(!relative.is_retryable());
        let missing = ConvertError::Transcode(TranscodeError::MissingInput("/a.dsf".into()));
        assert!(!missing.is_retryable());
        let tool = ConvertError::TrackFailed {
            track: "a.dsf".into(),
            message: "ffmpeg exited with 1".into(),
        };
        assert!(tool.is_retryable());
    }

    #[test]
    fn test_stage_error_maps_to_failed_stage() {
        let err = StageError::from(PrepareError::Staging(StagingError::InsufficientSpace {
            required: 10,
            available: 1,
        }));
        assert_eq!(err.stage(), ProcessingStage::FailedPrepare);
        assert!(err.to_string().starts_with("preparing: Insufficient disk space"));

        let err = StageError::from(FinalizeError::OutputExists("/out".into()));
        assert_eq!(err.stage(), ProcessingStage::FailedFinalize);
    }
}
