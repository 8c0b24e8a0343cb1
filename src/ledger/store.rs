//! SQLite-backed progress ledger.
//!
//! Every mutation of a processing record goes through [`ProgressLedger::upsert`],
//! which runs in a single transaction on a connection opened with
//! `synchronous = FULL`. When `upsert` returns `Ok`, the new state is on disk.

use super::models::*;
use super::schema::LEDGER_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Durable storage of sessions and processing records.
pub trait ProgressLedger: Send + Sync {
    // === Sessions ===

    /// Start a new session over the given roots.
    fn create_session(&self, input_dir: &Path, output_dir: &Path, archive_dir: &Path)
        -> Result<Session>;

    fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Most recently started session that is not completed, if any.
    fn latest_resumable_session(&self) -> Result<Option<Session>>;

    /// Most recently started session regardless of status.
    fn latest_session(&self) -> Result<Option<Session>>;

    fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<()>;

    // === Records ===

    /// Record for an album within a session.
    fn record(&self, session_id: &str, album_path: &Path) -> Result<Option<ProcessingRecord>>;

    fn records_for_session(&self, session_id: &str) -> Result<Vec<ProcessingRecord>>;

    /// Newest non-completed, non-superseded record for this album from any other session.
    fn latest_unfinished_for_album(
        &self,
        album_path: &Path,
        excluding_session: &str,
    ) -> Result<Option<ProcessingRecord>>;

    /// Newest record with this fingerprint that reached COMPLETED with an output path.
    fn find_completed_by_fingerprint(&self, fingerprint: &str)
        -> Result<Option<ProcessingRecord>>;

    /// Records, from any session, whose original album was removed ahead of an in-place promotion.
    fn displaced_records(&self) -> Result<Vec<ProcessingRecord>>;

    /// Apply an update, creating the record if needed. The only record mutation.
    fn upsert(&self, update: &RecordUpdate) -> Result<ProcessingRecord>;

    /// Working paths referenced by any record.
    fn referenced_working_paths(&self) -> Result<Vec<PathBuf>>;

    // === Statistics ===

    fn session_stats(&self, session_id: &str) -> Result<SessionStats>;
}

/// SQLite-backed progress ledger.
pub struct SqliteProgressLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProgressLedger {
    /// Open an existing ledger database or create a new one with the current schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = if db_path.exists() {
            Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open ledger database at {:?}", db_path))?
        } else {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create ledger directory {:?}", parent)
                })?;
            }
            let conn = Connection::open(db_path)
                .with_context(|| format!("Failed to create ledger database at {:?}", db_path))?;
            LEDGER_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new progress ledger at {:?}", db_path);
            conn
        };

        Self::configure(&conn)?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read ledger database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Ledger database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;
        if version >= LEDGER_VERSIONED_SCHEMAS.len() {
            bail!(
                "Ledger database version {} is too new (max supported: {})",
                version,
                LEDGER_VERSIONED_SCHEMAS.len() - 1
            );
        }

        LEDGER_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory ledger for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        LEDGER_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        // journal_mode returns a row, so it can't go through execute()
        let _: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        conn.execute("PRAGMA synchronous = FULL;", [])?;
        Ok(())
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = LEDGER_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating ledger database from version {} to {}",
            current_version, target_version
        );
        for schema in LEDGER_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running ledger migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;
        Ok(())
    }

    /// Shared connection, used by the audit store living in the same file.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get("id")?,
            input_dir: PathBuf::from(row.get::<_, String>("input_dir")?),
            output_dir: PathBuf::from(row.get::<_, String>("output_dir")?),
            archive_dir: PathBuf::from(row.get::<_, String>("archive_dir")?),
            status: SessionStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(SessionStatus::Running),
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// Convert a row into a record without its tracks.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ProcessingRecord> {
        let stage_str: String = row.get("stage")?;
        let stage = ProcessingStage::from_str(&stage_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown stage {}", stage_str).into(),
            )
        })?;
        Ok(ProcessingRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            album_path: PathBuf::from(row.get::<_, String>("album_path")?),
            album_name: row.get("album_name")?,
            album_id: row.get("album_id")?,
            content_fingerprint: row.get("content_fingerprint")?,
            stage,
            attempt: row.get("attempt")?,
            working_source_path: row
                .get::<_, Option<String>>("working_source_path")?
                .map(PathBuf::from),
            working_processed_path: row
                .get::<_, Option<String>>("working_processed_path")?
                .map(PathBuf::from),
            archive_stamp: row.get("archive_stamp")?,
            archive_path: row.get::<_, Option<String>>("archive_path")?.map(PathBuf::from),
            output_path: row.get::<_, Option<String>>("output_path")?.map(PathBuf::from),
            source_displaced: row.get::<_, i64>("source_displaced")? != 0,
            error_message: row.get("error_message")?,
            superseded_by: row.get("superseded_by")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
            tracks: Vec::new(),
        })
    }

    fn row_to_track(row: &rusqlite::Row) -> rusqlite::Result<TrackRecord> {
        Ok(TrackRecord {
            source_path: PathBuf::from(row.get::<_, String>("source_path")?),
            output_path: row.get::<_, Option<String>>("output_path")?.map(PathBuf::from),
            status: TrackStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(TrackStatus::Pending),
            attempts: row.get("attempts")?,
            message: row.get("message")?,
        })
    }

    fn load_tracks(conn: &Connection, record: &mut ProcessingRecord) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_tracks WHERE record_id = ?1 ORDER BY source_path ASC",
        )?;
        record.tracks = stmt
            .query_map([&record.id], Self::row_to_track)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(())
    }

    fn query_one_record(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<ProcessingRecord>> {
        let record = conn
            .query_row(sql, params, Self::row_to_record)
            .optional()?;
        match record {
            Some(mut record) => {
                Self::load_tracks(conn, &mut record)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn find_record_tx(
        tx: &Transaction,
        session_id: &str,
        album_path: &str,
    ) -> Result<Option<ProcessingRecord>> {
        Ok(tx
            .query_row(
                "SELECT * FROM processing_records WHERE session_id = ?1 AND album_path = ?2",
                params![session_id, album_path],
                Self::row_to_record,
            )
            .optional()?)
    }

    fn apply_update(tx: &Transaction, update: &RecordUpdate) -> Result<String> {
        let album_path = Self::path_str(&update.album_path);
        let now = Self::now();

        let (mut record, is_new) = match Self::find_record_tx(tx, &update.session_id, &album_path)? {
            Some(existing) => (existing, false),
            None => {
                let stage = update.stage.unwrap_or(ProcessingStage::Preparing);
                if update.supersedes.is_none() && stage != ProcessingStage::Preparing {
                    bail!(
                        "New record for {:?} must start at PREPARING, got {}",
                        update.album_path,
                        stage
                    );
                }
                let record = ProcessingRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: update.session_id.clone(),
                    album_path: update.album_path.clone(),
                    album_name: update.album_name.clone(),
                    album_id: None,
                    content_fingerprint: None,
                    stage,
                    attempt: 1,
                    working_source_path: None,
                    working_processed_path: None,
                    archive_stamp: None,
                    archive_path: None,
                    output_path: None,
                    source_displaced: false,
                    error_message: None,
                    superseded_by: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                    tracks: Vec::new(),
                };
                (record, true)
            }
        };

        if let Some(next) = update.stage {
            if !is_new && next != record.stage {
                if !record.stage.can_transition_to(next) {
                    bail!(
                        "Illegal stage transition for {:?}: {} -> {}",
                        update.album_path,
                        record.stage,
                        next
                    );
                }
                if next == ProcessingStage::Preparing {
                    record.attempt += 1;
                }
            }
            record.stage = next;
            if next == ProcessingStage::Completed && record.completed_at.is_none() {
                record.completed_at = Some(now);
            }
        }

        record.album_id = update.album_id.clone().apply(record.album_id);
        record.content_fingerprint = update
            .content_fingerprint
            .clone()
            .apply(record.content_fingerprint);
        record.working_source_path = update
            .working_source_path
            .clone()
            .apply(record.working_source_path);
        record.working_processed_path = update
            .working_processed_path
            .clone()
            .apply(record.working_processed_path);
        record.archive_stamp = update.archive_stamp.clone().apply(record.archive_stamp);
        record.archive_path = update.archive_path.clone().apply(record.archive_path);
        record.output_path = update.output_path.clone().apply(record.output_path);
        record.error_message = update.error_message.clone().apply(record.error_message);
        if let Some(displaced) = update.source_displaced {
            record.source_displaced = displaced;
        }
        record.updated_at = now;

        tx.execute(
            r#"INSERT INTO processing_records (
                id, session_id, album_path, album_name, album_id, content_fingerprint,
                stage, attempt, working_source_path, working_processed_path,
                archive_stamp, archive_path, output_path, source_displaced,
                error_message, superseded_by, created_at, updated_at, completed_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
            )
            ON CONFLICT(id) DO UPDATE SET
                album_name = excluded.album_name,
                album_id = excluded.album_id,
                content_fingerprint = excluded.content_fingerprint,
                stage = excluded.stage,
                attempt = excluded.attempt,
                working_source_path = excluded.working_source_path,
                working_processed_path = excluded.working_processed_path,
                archive_stamp = excluded.archive_stamp,
                archive_path = excluded.archive_path,
                output_path = excluded.output_path,
                source_displaced = excluded.source_displaced,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at"#,
            params![
                record.id,
                record.session_id,
                album_path,
                record.album_name,
                record.album_id,
                record.content_fingerprint,
                record.stage.as_str(),
                record.attempt,
                record.working_source_path.as_deref().map(Self::path_str),
                record.working_processed_path.as_deref().map(Self::path_str),
                record.archive_stamp,
                record.archive_path.as_deref().map(Self::path_str),
                record.output_path.as_deref().map(Self::path_str),
                record.source_displaced as i64,
                record.error_message,
                record.superseded_by,
                record.created_at,
                record.updated_at,
                record.completed_at,
            ],
        )?;

        for track in &update.tracks {
            tx.execute(
                r#"INSERT INTO processing_tracks (
                    record_id, source_path, output_path, status, attempts, message, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(record_id, source_path) DO UPDATE SET
                    output_path = excluded.output_path,
                    status = excluded.status,
                    attempts = excluded.attempts,
                    message = excluded.message,
                    updated_at = excluded.updated_at"#,
                params![
                    record.id,
                    Self::path_str(&track.source_path),
                    track.output_path.as_deref().map(Self::path_str),
                    track.status.as_str(),
                    track.attempts,
                    track.message,
                    now,
                ],
            )?;
        }

        if let Some(previous_id) = &update.supersedes {
            if *previous_id == record.id {
                bail!("Record {} cannot supersede itself", previous_id);
            }
            let changed = tx.execute(
                r#"UPDATE processing_records
                   SET working_source_path = NULL,
                       working_processed_path = NULL,
                       superseded_by = ?1,
                       updated_at = ?2
                   WHERE id = ?3"#,
                params![record.id, now, previous_id],
            )?;
            if changed == 0 {
                bail!("Superseded record {} does not exist", previous_id);
            }
            debug!("Record {} superseded by {}", previous_id, record.id);
        }

        Ok(record.id)
    }
}

impl ProgressLedger for SqliteProgressLedger {
    fn create_session(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        archive_dir: &Path,
    ) -> Result<Session> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            status: SessionStatus::Running,
            started_at: Self::now(),
            completed_at: None,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO sessions (id, input_dir, output_dir, archive_dir, status, started_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                session.id,
                Self::path_str(&session.input_dir),
                Self::path_str(&session.output_dir),
                Self::path_str(&session.archive_dir),
                session.status.as_str(),
                session.started_at,
            ],
        )
        .context("Failed to create session")?;
        Ok(session)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                [id],
                Self::row_to_session,
            )
            .optional()?)
    }

    fn latest_resumable_session(&self) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                r#"SELECT * FROM sessions
                   WHERE status != 'COMPLETED'
                   ORDER BY started_at DESC, rowid DESC
                   LIMIT 1"#,
                [],
                Self::row_to_session,
            )
            .optional()?)
    }

    fn latest_session(&self) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM sessions ORDER BY started_at DESC, rowid DESC LIMIT 1",
                [],
                Self::row_to_session,
            )
            .optional()?)
    }

    fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let completed_at = (status == SessionStatus::Completed).then(Self::now);
        let changed = conn.execute(
            "UPDATE sessions SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.as_str(), completed_at, id],
        )?;
        if changed == 0 {
            bail!("Session {} not found", id);
        }
        Ok(())
    }

    fn record(&self, session_id: &str, album_path: &Path) -> Result<Option<ProcessingRecord>> {
        let conn = self.conn.lock().unwrap();
        Self::query_one_record(
            &conn,
            "SELECT * FROM processing_records WHERE session_id = ?1 AND album_path = ?2",
            &[&session_id, &Self::path_str(album_path)],
        )
    }

    fn records_for_session(&self, session_id: &str) -> Result<Vec<ProcessingRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_records WHERE session_id = ?1 ORDER BY album_path ASC",
        )?;
        let mut records = stmt
            .query_map([session_id], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in records.iter_mut() {
            Self::load_tracks(&conn, record)?;
        }
        Ok(records)
    }

    fn latest_unfinished_for_album(
        &self,
        album_path: &Path,
        excluding_session: &str,
    ) -> Result<Option<ProcessingRecord>> {
        let conn = self.conn.lock().unwrap();
        Self::query_one_record(
            &conn,
            r#"SELECT * FROM processing_records
               WHERE album_path = ?1
                 AND session_id != ?2
                 AND stage != 'COMPLETED'
                 AND superseded_by IS NULL
               ORDER BY updated_at DESC
               LIMIT 1"#,
            &[&Self::path_str(album_path), &excluding_session],
        )
    }

    fn find_completed_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ProcessingRecord>> {
        let conn = self.conn.lock().unwrap();
        Self::query_one_record(
            &conn,
            r#"SELECT * FROM processing_records
               WHERE content_fingerprint = ?1
                 AND stage = 'COMPLETED'
                 AND output_path IS NOT NULL
               ORDER BY completed_at DESC
               LIMIT 1"#,
            &[&fingerprint],
        )
    }

    fn displaced_records(&self) -> Result<Vec<ProcessingRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM processing_records WHERE source_displaced = 1 ORDER BY updated_at ASC",
        )?;
        let mut records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in records.iter_mut() {
            Self::load_tracks(&conn, record)?;
        }
        Ok(records)
    }

    fn upsert(&self, update: &RecordUpdate) -> Result<ProcessingRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let record_id = Self::apply_update(&tx, update)?;
        tx.commit()
            .with_context(|| format!("Failed to commit ledger update for {:?}", update.album_path))?;

        Self::query_one_record(
            &conn,
            "SELECT * FROM processing_records WHERE id = ?1",
            &[&record_id],
        )?
        .with_context(|| format!("Record {} vanished after upsert", record_id))
    }

    fn referenced_working_paths(&self) -> Result<Vec<PathBuf>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT working_source_path, working_processed_path FROM processing_records
               WHERE working_source_path IS NOT NULL OR working_processed_path IS NOT NULL"#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .flat_map(|(source, processed)| [source, processed])
            .flatten()
            .map(PathBuf::from)
            .collect())
    }

    fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let conn = self.conn.lock().unwrap();

        let mut albums_by_stage = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT stage, COUNT(*) FROM processing_records WHERE session_id = ?1 GROUP BY stage",
        )?;
        let stage_counts = stmt
            .query_map([session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut total_albums = 0;
        for (stage, count) in stage_counts {
            if let Some(stage) = ProcessingStage::from_str(&stage) {
                albums_by_stage.insert(stage, count as usize);
                total_albums += count as usize;
            }
        }

        let mut tracks_by_status = BTreeMap::new();
        let mut stmt = conn.prepare(
            r#"SELECT t.status, COUNT(*) FROM processing_tracks t
               JOIN processing_records r ON r.id = t.record_id
               WHERE r.session_id = ?1
               GROUP BY t.status"#,
        )?;
        let status_counts = stmt
            .query_map([session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in status_counts {
            if let Some(status) = TrackStatus::from_str(&status) {
                tracks_by_status.insert(status, count as usize);
            }
        }

        Ok(SessionStats {
            total_albums,
            albums_by_stage,
            tracks_by_status,
        })
    }
}
