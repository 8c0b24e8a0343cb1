//! Processing history.
//!
//! Append-only diagnostics trail. Nothing here is consulted when deciding
//! how to resume an album.

mod logger;
mod models;
mod store;

pub use logger::AuditTrail;
pub use models::{HistoryEntry, HistoryOperation, HistoryStatus};
pub use store::{AuditStore, SqliteAuditStore};
