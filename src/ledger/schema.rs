//! Database schema for the progress ledger.
//!
//! Sessions, per-album processing records, per-track progress and the
//! append-only processing history all live in one SQLite file.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

// =============================================================================
// Sessions Table - Version 0
// =============================================================================

const SESSIONS_TABLE_V0: Table = Table {
    name: "sessions",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("input_dir", &SqlType::Text, non_null = true),
        sqlite_column!("output_dir", &SqlType::Text, non_null = true),
        sqlite_column!("archive_dir", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", &SqlType::Integer),
    ],
    indices: &[("idx_sessions_started", "started_at")],
    unique_constraints: &[],
};

// =============================================================================
// Processing Records Table - Version 0
// =============================================================================

/// One row per album per session.
const PROCESSING_RECORDS_TABLE_V0: Table = Table {
    name: "processing_records",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "session_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "sessions",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("album_path", &SqlType::Text, non_null = true),
        sqlite_column!("album_name", &SqlType::Text, non_null = true),
        sqlite_column!("album_id", &SqlType::Text),
        sqlite_column!("content_fingerprint", &SqlType::Text),
        sqlite_column!("stage", &SqlType::Text, non_null = true),
        sqlite_column!(
            "attempt",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("working_source_path", &SqlType::Text),
        sqlite_column!("working_processed_path", &SqlType::Text),
        sqlite_column!("archive_stamp", &SqlType::Text),
        sqlite_column!("archive_path", &SqlType::Text),
        sqlite_column!("output_path", &SqlType::Text),
        sqlite_column!(
            "source_displaced",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("superseded_by", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_records_fingerprint", "content_fingerprint, stage"),
        ("idx_records_album_path", "album_path"),
        ("idx_records_stage", "stage"),
    ],
    unique_constraints: &[&["session_id", "album_path"]],
};

// =============================================================================
// Processing Tracks Table - Version 0
// =============================================================================

const PROCESSING_TRACKS_TABLE_V0: Table = Table {
    name: "processing_tracks",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "record_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "processing_records",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("source_path", &SqlType::Text, non_null = true),
        sqlite_column!("output_path", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_tracks_record", "record_id")],
    unique_constraints: &[&["record_id", "source_path"]],
};

// =============================================================================
// Processing History Table - Version 0
// =============================================================================

/// Append-only audit rows. Never read for recovery decisions.
const PROCESSING_HISTORY_TABLE_V0: Table = Table {
    name: "processing_history",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
        sqlite_column!("session_id", &SqlType::Text),
        sqlite_column!("album_id", &SqlType::Text),
        sqlite_column!("album_path", &SqlType::Text, non_null = true),
        sqlite_column!("operation", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("working_source_path", &SqlType::Text),
        sqlite_column!("working_processed_path", &SqlType::Text),
        sqlite_column!("details", &SqlType::Text),
    ],
    indices: &[
        ("idx_history_album_path", "album_path"),
        ("idx_history_operation", "operation"),
        ("idx_history_timestamp", "timestamp"),
    ],
    unique_constraints: &[],
};

pub const LEDGER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        SESSIONS_TABLE_V0,
        PROCESSING_RECORDS_TABLE_V0,
        PROCESSING_TRACKS_TABLE_V0,
        PROCESSING_HISTORY_TABLE_V0,
    ],
    migration: None,
}];
