//! Progress ledger.
//!
//! Durable per-session record of every album's stage, staging paths,
//! archive and output locations and per-track progress. This is the only
//! source of truth used to decide what to do after a restart.

mod models;
mod schema;
mod store;

pub use models::{
    FieldUpdate, ProcessingRecord, ProcessingStage, RecordUpdate, Session, SessionStats,
    SessionStatus, TrackRecord, TrackStatus,
};
pub use store::{ProgressLedger, SqliteProgressLedger};
