//! Boundary to the external conversion tools.

mod ffmpeg;

pub use ffmpeg::{check_tool_available, CommandExtractor, FfmpegTranscoder};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Path must be absolute: {0:?}")]
    NonAbsolutePath(PathBuf),

    #[error("Input not found: {0:?}")]
    MissingInput(PathBuf),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one transcoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub elapsed: Duration,
    /// Metadata written next to the output, when the tool produces one.
    pub metadata_sidecar: Option<PathBuf>,
}

impl TranscodeOutcome {
    pub fn succeeded(elapsed: Duration) -> Self {
        Self {
            success: true,
            message: None,
            elapsed,
            metadata_sidecar: None,
        }
    }

    pub fn failed(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            elapsed,
            metadata_sidecar: None,
        }
    }
}

/// Converts one audio file into the output format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Both paths must be absolute.
    async fn transcode(&self, input: &Path, output: &Path)
        -> Result<TranscodeOutcome, TranscodeError>;
}

/// Extracts raw tracks from a disc image.
#[async_trait]
pub trait ContainerExtractor: Send + Sync {
    /// Returns the extracted track files, all inside `output_dir`.
    async fn extract(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>, TranscodeError>;
}

/// Reject relative or missing paths before anything is spawned.
pub fn check_paths(input: &Path, output: &Path) -> Result<(), TranscodeError> {
    for path in [input, output] {
        if !path.is_absolute() {
            return Err(TranscodeError::NonAbsolutePath(path.to_path_buf()));
        }
    }
    if !input.exists() {
        return Err(TranscodeError::MissingInput(input.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_paths_rejects_relative_paths() {
        let err = check_paths(Path::new("in.dsf"), Path::new("/out.flac")).unwrap_err();
        assert!(matches!(err, TranscodeError::NonAbsolutePath(_)));
        let err = check_paths(Path::new("/in.dsf"), Path::new("out.flac")).unwrap_err();
        assert!(matches!(err, TranscodeError::NonAbsolutePath(_)));
    }

    #[test]
    fn test_check_paths_requires_existing_input() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("in.dsf");
        let output = temp.path().join("out.flac");
        assert!(matches!(
            check_paths(&input, &output),
            Err(TranscodeError::MissingInput(_))
        ));
        std::fs::write(&input, b"dsd").unwrap();
        assert!(check_paths(&input, &output).is_ok());
    }
}
