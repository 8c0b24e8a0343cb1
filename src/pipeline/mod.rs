//! The album state machine and the batch loop around it.

mod batch;
pub mod errors;
mod orchestrator;
mod retry_policy;

pub use batch::{BatchReport, BatchRunner};
pub use errors::{
    ArchiveError, CleanupError, ConvertError, FinalizeError, PrepareError, StageError,
};
pub use orchestrator::{output_location, AlbumOutcome, AlbumPipeline, EXTRACT_DIR};
pub use retry_policy::RetryPolicy;
