//! Working directory management.
//!
//! Owns every filesystem mutation touching staging, archive and output
//! locations. Knows nothing about processing stages.

mod manager;
mod paths;
mod space;
pub mod verify;

pub use manager::WorkingDirectoryManager;
pub use paths::{
    is_transient_copy, looks_like_staging, sanitize_name, staging_base_name, OriginalPath,
    StagingKind, StagingPair, StagingPath,
};
pub use space::{estimate_required_space, FsSpaceMeter, SpaceMeter};
pub use verify::VerifySummary;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(
        "Insufficient disk space: required {:#}, available {:#}",
        human_bytes(.required),
        human_bytes(.available)
    )]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Destination already exists with different content: {0:?}")]
    DestinationExists(PathBuf),

    #[error("Missing source: {0:?}")]
    MissingSource(PathBuf),

    #[error("Refusing to remove {0:?}")]
    RefusedRemoval(PathBuf),

    #[error("Invalid path: {0:?}")]
    InvalidPath(PathBuf),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn human_bytes(bytes: &u64) -> byte_unit::Byte {
    byte_unit::Byte::from(*bytes)
}
