//! Album pipeline.
//!
//! Drives one album through `PREPARING -> CONVERTING -> ARCHIVING ->
//! FINALIZING -> COMPLETED`. Every transition is persisted before the
//! filesystem work it announces, so a crash at any point leaves the ledger
//! describing a state the next run can pick up from.

use super::errors::{
    ArchiveError, CleanupError, ConvertError, FinalizeError, PrepareError, StageError,
};
use super::retry_policy::RetryPolicy;
use crate::album::{AlbumScanner, AlbumUnit, FileClass, FormatPolicy, MediaFile};
use crate::audit::{AuditTrail, HistoryOperation};
use crate::config::{ConversionSettings, ProcessingSettings};
use crate::dedup::{ContentFingerprint, Deduplicator};
use crate::ledger::{
    ProcessingRecord, ProcessingStage, ProgressLedger, RecordUpdate, Session, TrackRecord,
    TrackStatus,
};
use crate::staging::{OriginalPath, StagingError, StagingPair, WorkingDirectoryManager};
use crate::transcoder::{ContainerExtractor, TranscodeOutcome, Transcoder};
use anyhow::Result;
use chrono::Local;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Scratch directory inside the processed staging dir for disc image extraction.
pub const EXTRACT_DIR: &str = ".extract";

/// Format of the timestamp in archive directory names.
const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// What happened to one album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlbumOutcome {
    Completed {
        record_id: String,
        output_path: PathBuf,
    },
    SkippedNoConvertible,
    SkippedAlreadyProcessed {
        prior_output: PathBuf,
    },
    Failed {
        stage: ProcessingStage,
        reason: String,
    },
    /// Dry run: what a real run would have converted.
    Planned {
        output_path: PathBuf,
        conversions: usize,
    },
}

impl AlbumOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, AlbumOutcome::Failed { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, AlbumOutcome::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            AlbumOutcome::SkippedNoConvertible | AlbumOutcome::SkippedAlreadyProcessed { .. }
        )
    }
}

impl fmt::Display for AlbumOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlbumOutcome::Completed { .. } => write!(f, "completed"),
            AlbumOutcome::SkippedNoConvertible => write!(f, "skipped (no convertible content)"),
            AlbumOutcome::SkippedAlreadyProcessed { .. } => {
                write!(f, "skipped (already processed)")
            }
            AlbumOutcome::Failed { stage, reason } => {
                write!(f, "failed at {}: {}", stage.label(), reason)
            }
            AlbumOutcome::Planned {
                output_path,
                conversions,
            } => write!(
                f,
                "dry run, {} files to convert into {}",
                conversions,
                output_path.display()
            ),
        }
    }
}

/// Where the converted album lands: the same relative location under the
/// output root, or the album's own path when converting in place.
pub fn output_location(session: &Session, album_path: &Path, album_name: &str) -> PathBuf {
    let relative = album_path
        .strip_prefix(&session.input_dir)
        .ok()
        .filter(|r| !r.as_os_str().is_empty());
    match relative {
        Some(relative) => session.output_dir.join(relative),
        None if session.output_dir == session.input_dir => album_path.to_path_buf(),
        None => session.output_dir.join(album_name),
    }
}

/// First pair of album files whose processed copies would land on the same path.
fn output_collision(album: &AlbumUnit, extension: &str) -> Option<PrepareError> {
    let mut targets: HashMap<PathBuf, &Path> = HashMap::new();
    for file in &album.files {
        let target = match file.class {
            FileClass::Convert => file.relative_path.with_extension(extension),
            FileClass::Extract => file.relative_path.with_extension(""),
            FileClass::Disabled | FileClass::Passthrough => file.relative_path.clone(),
        };
        let first = match targets.get(&target) {
            Some(first) => Some(first.to_path_buf()),
            // Extracted tracks land inside the target directory
            None if file.class == FileClass::Extract => album
                .files
                .iter()
                .find(|other| other.relative_path.starts_with(&target))
                .map(|other| other.relative_path.clone()),
            None => None,
        };
        if let Some(first) = first {
            return Some(PrepareError::OutputCollision {
                first,
                second: file.relative_path.clone(),
                output: target,
            });
        }
        targets.insert(target, &file.relative_path);
    }
    None
}

/// Result of trying to put a removed original back.
enum Recovery {
    /// The output had been promoted, nothing to restore.
    Promoted,
    Restored,
    Unrecoverable(String),
}

/// One album's pass through the stages.
struct AlbumRun<'a> {
    session: &'a Session,
    album: &'a AlbumUnit,
    pair: StagingPair,
    output_path: PathBuf,
}

impl AlbumRun<'_> {
    fn in_place(&self) -> bool {
        self.output_path == self.album.path()
    }

    fn update(&self) -> RecordUpdate {
        RecordUpdate::new(&self.session.id, self.album.path(), &self.album.name)
    }
}

fn update_for(record: &ProcessingRecord) -> RecordUpdate {
    RecordUpdate::new(&record.session_id, &record.album_path, &record.album_name)
}

fn recorded_pair(record: &ProcessingRecord) -> Option<StagingPair> {
    match (&record.working_source_path, &record.working_processed_path) {
        (Some(source), Some(processed)) => StagingPair::from_paths(source, processed),
        _ => None,
    }
}

fn operation_for(stage: ProcessingStage) -> HistoryOperation {
    match stage {
        ProcessingStage::Preparing | ProcessingStage::FailedPrepare => HistoryOperation::Prepare,
        ProcessingStage::Converting | ProcessingStage::FailedConvert => HistoryOperation::Convert,
        ProcessingStage::Archiving | ProcessingStage::FailedArchive => HistoryOperation::Archive,
        ProcessingStage::Finalizing
        | ProcessingStage::FailedFinalize
        | ProcessingStage::Completed => HistoryOperation::Finalize,
    }
}

pub struct AlbumPipeline {
    ledger: Arc<dyn ProgressLedger>,
    staging: WorkingDirectoryManager,
    dedup: Deduplicator,
    transcoder: Arc<dyn Transcoder>,
    extractor: Arc<dyn ContainerExtractor>,
    audit: Arc<AuditTrail>,
    settings: ProcessingSettings,
    retry: RetryPolicy,
    policy: FormatPolicy,
    output_extension: &'static str,
}

impl AlbumPipeline {
    pub fn new(
        ledger: Arc<dyn ProgressLedger>,
        staging: WorkingDirectoryManager,
        transcoder: Arc<dyn Transcoder>,
        extractor: Arc<dyn ContainerExtractor>,
        audit: Arc<AuditTrail>,
        settings: &ProcessingSettings,
        conversion: &ConversionSettings,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(
                ledger.clone(),
                settings.max_file_size_for_expensive_analysis,
            ),
            ledger,
            staging,
            transcoder,
            extractor,
            audit,
            retry: RetryPolicy::new(settings),
            settings: settings.clone(),
            policy: FormatPolicy::new(conversion),
            output_extension: conversion.output_extension(),
        }
    }

    pub fn staging(&self) -> &WorkingDirectoryManager {
        &self.staging
    }

    pub fn ledger(&self) -> &Arc<dyn ProgressLedger> {
        &self.ledger
    }

    /// Process one album within `session`.
    ///
    /// Stage failures are recorded and reported as `AlbumOutcome::Failed`.
    /// `Err` means the ledger itself could not be written.
    pub async fn process_album(&self, session: &Session, album: &AlbumUnit) -> Result<AlbumOutcome> {
        let Some(record) = self.displaced_record(session, album)? else {
            return self.process_present(session, album).await;
        };
        if self.settings.dry_run {
            warn!(
                "[dry run] Original of {} was removed by an earlier run, a real run restores it first",
                album.name
            );
            return self.process_present(session, album).await;
        }

        let started = Instant::now();
        match self.recover_record(&record).await? {
            Recovery::Promoted => self.process_present(session, album).await,
            Recovery::Restored => {
                let restored = self.reload(album)?;
                self.process_present(session, &restored).await
            }
            Recovery::Unrecoverable(reason) => {
                self.refuse_displaced(session, album, &record, reason, started)
            }
        }
    }

    /// The record of this album, or of an unfinished earlier run, if it still
    /// has the original marked as removed.
    fn displaced_record(
        &self,
        session: &Session,
        album: &AlbumUnit,
    ) -> Result<Option<ProcessingRecord>> {
        let record = match self.ledger.record(&session.id, album.path())? {
            Some(record) => Some(record),
            None => self
                .ledger
                .latest_unfinished_for_album(album.path(), &session.id)?,
        };
        Ok(record.filter(|r| r.source_displaced))
    }

    /// Rescan an album whose files were just put back from the archive.
    fn reload(&self, album: &AlbumUnit) -> Result<AlbumUnit> {
        let scanner = AlbumScanner::new(self.policy.clone(), Vec::new());
        Ok(AlbumUnit {
            name: album.name.clone(),
            ..scanner.load_album(album.path())?
        })
    }

    /// Fail an album whose original could not be put back, leaving its
    /// staging and archive untouched.
    fn refuse_displaced(
        &self,
        session: &Session,
        album: &AlbumUnit,
        record: &ProcessingRecord,
        reason: String,
        started: Instant,
    ) -> Result<AlbumOutcome> {
        let err = StageError::from(FinalizeError::StillDisplaced {
            original: album.path().to_path_buf(),
            reason,
        });
        let stage = err.stage();
        let reason = err.to_string();
        error!("{} failed at {}: {}", album.name, stage.label(), reason);

        let record = if record.session_id == session.id {
            self.ledger
                .upsert(&update_for(record).with_stage(stage).with_error(&reason))?
        } else {
            record.clone()
        };
        self.audit
            .log_failed(&record, HistoryOperation::Finalize, started.elapsed(), &reason);
        Ok(AlbumOutcome::Failed { stage, reason })
    }

    /// Process an album whose original is in place.
    async fn process_present(&self, session: &Session, album: &AlbumUnit) -> Result<AlbumOutcome> {
        let existing = self.ledger.record(&session.id, album.path())?;
        let carried = match existing {
            Some(_) => None,
            None => self
                .ledger
                .latest_unfinished_for_album(album.path(), &session.id)?,
        };

        if let Some(record) = &existing {
            if record.stage == ProcessingStage::Completed {
                debug!("{} already completed in this session", album.name);
                return Ok(AlbumOutcome::SkippedAlreadyProcessed {
                    prior_output: record
                        .output_path
                        .clone()
                        .unwrap_or_else(|| album.path().to_path_buf()),
                });
            }
        }

        if let Some(record) = existing.as_ref().or(carried.as_ref()) {
            if Self::can_resume_to_completion(record) && self.settings.dry_run {
                info!(
                    "[dry run] {}: output already promoted, would finish record {}",
                    album.name, record.id
                );
                return Ok(AlbumOutcome::Planned {
                    output_path: record
                        .output_path
                        .clone()
                        .unwrap_or_else(|| album.path().to_path_buf()),
                    conversions: 0,
                });
            }
            if Self::can_resume_to_completion(record) {
                return self
                    .resume_to_completion(session, album, record, existing.is_none())
                    .await;
            }
        }

        if !album.has_convertible_content() {
            info!("Skipping {}: no convertible content", album.name);
            self.audit
                .log_album_skipped(&session.id, album.path(), "no convertible content");
            return Ok(AlbumOutcome::SkippedNoConvertible);
        }

        let fingerprint = match self.dedup.fingerprint(album).await {
            Ok(fingerprint) => fingerprint,
            Err(e) if self.settings.dry_run => {
                let err = StageError::from(PrepareError::from(e));
                warn!("[dry run] {}: {}", album.name, err);
                return Ok(AlbumOutcome::Failed {
                    stage: err.stage(),
                    reason: err.to_string(),
                });
            }
            Err(e) => {
                self.begin_attempt(session, album, existing.as_ref(), carried.as_ref(), None)?;
                if let Some(prior) = carried.as_ref() {
                    self.release_superseded_staging(prior, None).await;
                }
                let err = StageError::from(PrepareError::from(e));
                return self.fail(session, album, None, err, Instant::now()).await;
            }
        };

        let prior = if self.settings.skip_already_processed {
            self.dedup.find_prior(&fingerprint)?
        } else {
            None
        };
        if let Some(prior) = prior.as_ref().filter(|p| p.output_present()) {
            info!(
                "Skipping {}: same content already converted to {:?}",
                album.name, prior.output_path
            );
            self.audit
                .log_album_skipped(&session.id, album.path(), "already processed");
            return Ok(AlbumOutcome::SkippedAlreadyProcessed {
                prior_output: prior.output_path.clone(),
            });
        }

        if self.settings.dry_run {
            return Ok(self.plan(session, album, &fingerprint));
        }

        let album_id = Deduplicator::album_id_for(
            &fingerprint,
            prior.as_ref(),
            existing.as_ref().and_then(|r| r.album_id.as_deref()),
        );
        let run = AlbumRun {
            session,
            album,
            pair: self.staging.derive_pair(&album.name, fingerprint.as_str()),
            output_path: output_location(session, album.path(), &album.name),
        };
        let record = self.begin_attempt(
            session,
            album,
            existing.as_ref(),
            carried.as_ref(),
            Some((&fingerprint, &album_id)),
        )?;
        if let Some(prior) = carried.as_ref() {
            self.release_superseded_staging(prior, Some(&run.pair)).await;
        }
        info!(
            "Processing {} (record {}, attempt {})",
            album.name, record.id, record.attempt
        );

        self.run_stages(&run, record).await
    }

    /// Log the stages a real run would take `album` through.
    fn plan(
        &self,
        session: &Session,
        album: &AlbumUnit,
        fingerprint: &ContentFingerprint,
    ) -> AlbumOutcome {
        let failed = |err: StageError| {
            warn!("[dry run] {}: {}", album.name, err);
            AlbumOutcome::Failed {
                stage: err.stage(),
                reason: err.to_string(),
            }
        };
        if let Some(collision) = output_collision(album, self.output_extension) {
            return failed(collision.into());
        }
        let required = match self.staging.check_space(album) {
            Ok(required) => required,
            Err(e) => return failed(PrepareError::from(e).into()),
        };

        let pair = self.staging.derive_pair(&album.name, fingerprint.as_str());
        let output_path = output_location(session, album.path(), &album.name);
        let conversions = album
            .files
            .iter()
            .filter(|f| f.class.needs_conversion())
            .count();
        info!(
            "[dry run] {}: stage {} bytes into {}",
            album.name, required, pair.source
        );
        info!(
            "[dry run] {}: convert {} files to {}",
            album.name, conversions, self.output_extension
        );
        info!(
            "[dry run] {}: archive original under {:?}",
            album.name,
            self.staging.archive_root()
        );
        info!("[dry run] {}: promote to {:?}", album.name, output_path);
        if self.settings.remove_source_after_conversion && output_path != album.path() {
            info!("[dry run] {}: remove original {:?}", album.name, album.path());
        }
        AlbumOutcome::Planned {
            output_path,
            conversions,
        }
    }

    fn can_resume_to_completion(record: &ProcessingRecord) -> bool {
        matches!(
            record.stage,
            ProcessingStage::Finalizing | ProcessingStage::FailedFinalize
        ) && !record.source_displaced
            && record.output_path.as_deref().is_some_and(Path::exists)
    }

    /// Enter PREPARING, taking over an earlier session's record when there is one.
    fn begin_attempt(
        &self,
        session: &Session,
        album: &AlbumUnit,
        existing: Option<&ProcessingRecord>,
        carried: Option<&ProcessingRecord>,
        identity: Option<(&ContentFingerprint, &String)>,
    ) -> Result<ProcessingRecord> {
        let mut update = RecordUpdate::new(&session.id, album.path(), &album.name)
            .with_stage(ProcessingStage::Preparing)
            .clear_error();
        if let Some((fingerprint, album_id)) = identity {
            update = update
                .with_fingerprint(fingerprint.as_str())
                .with_album_id(album_id);
            let content_changed = existing
                .and_then(|r| r.content_fingerprint.as_deref())
                .is_some_and(|previous| previous != fingerprint.as_str());
            if content_changed {
                // The archive named by the old stamp holds the old content
                update = update.clear_archive();
            }
        }
        if let (None, Some(prior)) = (existing, carried) {
            update = update.superseding(&prior.id);
            let same_content = identity.is_some_and(|(fingerprint, _)| {
                prior.content_fingerprint.as_deref() == Some(fingerprint.as_str())
            });
            if same_content {
                if let (Some(source), Some(processed)) =
                    (&prior.working_source_path, &prior.working_processed_path)
                {
                    update = update.with_working_paths(source.clone(), processed.clone());
                }
                if let Some(stamp) = &prior.archive_stamp {
                    update = update.with_archive_stamp(stamp);
                }
                update = update.with_tracks(prior.tracks.iter().cloned());
            }
        }
        self.ledger.upsert(&update)
    }

    /// Staging of a superseded record that this run did not take over is deleted.
    async fn release_superseded_staging(
        &self,
        prior: &ProcessingRecord,
        current: Option<&StagingPair>,
    ) {
        let Some(pair) = recorded_pair(prior) else {
            return;
        };
        if current == Some(&pair) {
            return;
        }
        if let Err(e) = self.staging.cleanup_pair(&pair).await {
            warn!("Failed to remove superseded staging {}: {}", pair.source, e);
        }
    }

    async fn run_stages(&self, run: &AlbumRun<'_>, record: ProcessingRecord) -> Result<AlbumOutcome> {
        let started = Instant::now();
        self.audit.log_started(&record, HistoryOperation::Prepare);
        let (record, reused) = match self.prepare(run, record).await {
            Ok(prepared) => prepared,
            Err(e) => return self.fail_run(run, e.into(), started).await,
        };
        self.audit.log_succeeded(
            &record,
            HistoryOperation::Prepare,
            started.elapsed(),
            Some(serde_json::json!({ "reused_staging": reused })),
        );

        let started = Instant::now();
        let record = match self.convert(run).await {
            Ok(record) => record,
            Err(e) => return self.fail_run(run, e.into(), started).await,
        };
        let converted = record
            .tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Converted)
            .count();
        self.audit.log_succeeded(
            &record,
            HistoryOperation::Convert,
            started.elapsed(),
            Some(serde_json::json!({ "converted_tracks": converted })),
        );

        let started = Instant::now();
        let record = match self.archive(run).await {
            Ok(record) => record,
            Err(e) => return self.fail_run(run, e.into(), started).await,
        };
        self.audit.log_succeeded(
            &record,
            HistoryOperation::Archive,
            started.elapsed(),
            None,
        );

        let started = Instant::now();
        let record = match self.finalize(run).await {
            Ok(record) => record,
            Err(e) => return self.fail_run(run, e.into(), started).await,
        };
        let record = match self.complete(run.album, record, Some(&run.pair)).await {
            Ok(record) => record,
            Err(e) => return self.fail_run(run, e.into(), started).await,
        };
        self.audit.log_succeeded(
            &record,
            HistoryOperation::Finalize,
            started.elapsed(),
            None,
        );

        info!("Completed {} -> {:?}", run.album.name, run.output_path);
        Ok(AlbumOutcome::Completed {
            record_id: record.id,
            output_path: run.output_path.clone(),
        })
    }

    // === PREPARING ===

    /// Set up the staging pair. Returns the record and whether existing staging was reused.
    async fn prepare(
        &self,
        run: &AlbumRun<'_>,
        mut record: ProcessingRecord,
    ) -> Result<(ProcessingRecord, bool), PrepareError> {
        let album = run.album;
        if !album.path().is_dir() {
            return Err(PrepareError::SourceMissing(album.path().to_path_buf()));
        }
        if let Some(collision) = output_collision(album, self.output_extension) {
            return Err(collision);
        }

        let recorded = recorded_pair(&record);
        let reused = self.settings.resume_from_working
            && recorded.as_ref() == Some(&run.pair)
            && self.staging.source_matches(album, &run.pair).await;

        if reused {
            info!("Reusing staging {} for {}", run.pair.source, album.name);
        } else {
            if record.has_working_paths() {
                self.ledger.upsert(&run.update().clear_working_paths())?;
            }
            if let Some(stale) = recorded.filter(|p| p != &run.pair) {
                self.staging.cleanup_pair(&stale).await?;
            }
            if run.pair.exists() {
                debug!("Discarding unreferenced staging {}", run.pair.source);
                self.staging.cleanup_pair(&run.pair).await?;
            }

            self.staging.check_space(album)?;
            self.staging.create_pair(&run.pair).await?;
            record = self.ledger.upsert(&run.update().with_working_paths(
                run.pair.source.as_path().to_path_buf(),
                run.pair.processed.as_path().to_path_buf(),
            ))?;
            self.staging.copy_to_source(album, &run.pair).await?;
        }

        self.staging.create_processed_structure(album, &run.pair).await?;
        let tracks = self.initial_tracks(run, &record, reused);
        let record = self.ledger.upsert(&run.update().with_tracks(tracks))?;
        Ok((record, reused))
    }

    fn initial_tracks(
        &self,
        run: &AlbumRun<'_>,
        record: &ProcessingRecord,
        reused: bool,
    ) -> Vec<TrackRecord> {
        let processed = run.pair.processed.as_path();
        run.album
            .tracks()
            .map(|file| {
                let previous = record.track(&file.relative_path);
                if file.class == FileClass::Disabled {
                    return TrackRecord {
                        source_path: file.relative_path.clone(),
                        output_path: Some(processed.join(&file.relative_path)),
                        status: TrackStatus::Skipped,
                        attempts: 0,
                        message: Some(self.policy.disabled_reason(&file.relative_path)),
                    };
                }
                match previous {
                    Some(track)
                        if reused
                            && track.status == TrackStatus::Converted
                            && track.output_path.as_deref().is_some_and(Path::exists) =>
                    {
                        track.clone()
                    }
                    Some(track) => TrackRecord {
                        attempts: track.attempts,
                        ..TrackRecord::pending(&file.relative_path)
                    },
                    None => TrackRecord::pending(&file.relative_path),
                }
            })
            .collect()
    }

    // === CONVERTING ===

    async fn convert(&self, run: &AlbumRun<'_>) -> Result<ProcessingRecord, ConvertError> {
        let record = self
            .ledger
            .upsert(&run.update().with_stage(ProcessingStage::Converting))?;
        self.audit.log_started(&record, HistoryOperation::Convert);

        let processed = run.pair.processed.as_path();
        if !processed.is_dir() || !run.pair.source.as_path().is_dir() {
            return Err(ConvertError::MissingStaging(processed.to_path_buf()));
        }
        let extract_root = processed.join(EXTRACT_DIR);
        Self::remove_scratch(&extract_root).await?;

        let mut failed = 0;
        let mut total = 0;
        for file in run.album.files.iter().filter(|f| f.class.needs_conversion()) {
            total += 1;
            let track = record
                .track(&file.relative_path)
                .cloned()
                .unwrap_or_else(|| TrackRecord::pending(&file.relative_path));
            if track.status == TrackStatus::Converted {
                debug!("{:?} already converted", file.relative_path);
                continue;
            }

            let result = match file.class {
                FileClass::Extract => self.convert_container(run, &record, file, track).await,
                _ => self.convert_track(run, &record, file, track).await,
            };
            match result {
                Ok(()) => {}
                Err(e @ ConvertError::Ledger(_)) => return Err(e),
                Err(e) if self.settings.skip_album_on_error => {
                    Self::remove_scratch(&extract_root).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!("{}: {}", run.album.name, e);
                    failed += 1;
                }
            }
        }
        Self::remove_scratch(&extract_root).await?;

        if failed > 0 {
            return Err(ConvertError::TracksFailed { failed, total });
        }
        self.ledger
            .record(&run.session.id, run.album.path())?
            .ok_or_else(|| ConvertError::Ledger(anyhow::anyhow!("record vanished during conversion")))
    }

    async fn remove_scratch(path: &Path) -> Result<(), ConvertError> {
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    /// Run `op` until it succeeds or the retry policy gives up.
    /// Returns the final result and the number of attempts made.
    async fn with_retries<T, F, Fut>(&self, what: &Path, mut op: F) -> (Result<T, ConvertError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConvertError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return (Ok(value), attempts),
                Err(e) if self.retry.should_retry(&e, attempts) => {
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        "{:?} failed on attempt {}, retrying in {:?}: {}",
                        what, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempts),
            }
        }
    }

    async fn transcode_once(
        transcoder: &dyn Transcoder,
        track: &Path,
        input: &Path,
        output: &Path,
    ) -> Result<TranscodeOutcome, ConvertError> {
        let outcome = transcoder.transcode(input, output).await?;
        if outcome.success {
            Ok(outcome)
        } else {
            Err(ConvertError::TrackFailed {
                track: track.to_path_buf(),
                message: outcome
                    .message
                    .unwrap_or_else(|| "transcoder reported failure".to_string()),
            })
        }
    }

    /// Persist the final state of a track and log it.
    fn finish_track(
        &self,
        run: &AlbumRun<'_>,
        record: &ProcessingRecord,
        mut track: TrackRecord,
        result: Result<(PathBuf, Option<String>), &ConvertError>,
        attempts: u32,
        started: Instant,
    ) -> Result<(), ConvertError> {
        track.attempts += attempts;
        let success = result.is_ok();
        match result {
            Ok((output, message)) => {
                track.status = TrackStatus::Converted;
                track.output_path = Some(output);
                track.message = message;
            }
            Err(e) => {
                track.status = TrackStatus::Failed;
                track.output_path = None;
                track.message = Some(e.to_string());
            }
        }
        self.audit.log_track(
            record,
            &track.source_path,
            success,
            started.elapsed(),
            track.message.as_deref(),
        );
        self.ledger.upsert(&run.update().with_track(track))?;
        Ok(())
    }

    async fn convert_track(
        &self,
        run: &AlbumRun<'_>,
        record: &ProcessingRecord,
        file: &MediaFile,
        track: TrackRecord,
    ) -> Result<(), ConvertError> {
        let started = Instant::now();
        let input = run.pair.source.as_path().join(&file.relative_path);
        let output = run
            .pair
            .processed
            .as_path()
            .join(&file.relative_path)
            .with_extension(self.output_extension);
        let transcoder = self.transcoder.as_ref();
        let (relative, input_ref, output_ref) = (&file.relative_path, &input, &output);

        let (result, attempts) = self
            .with_retries(relative, || async move {
                Self::transcode_once(transcoder, relative, input_ref, output_ref).await
            })
            .await;
        match result {
            Ok(outcome) => {
                debug!("Converted {:?} in {:?}", relative, outcome.elapsed);
                self.finish_track(
                    run,
                    record,
                    track,
                    Ok((output, outcome.message)),
                    attempts,
                    started,
                )
            }
            Err(e) => {
                self.finish_track(run, record, track, Err(&e), attempts, started)?;
                Err(e)
            }
        }
    }

    /// Extract a disc image and convert every track it yields into
    /// `<image parent>/<image stem>/` in the processed staging dir.
    async fn convert_container(
        &self,
        run: &AlbumRun<'_>,
        record: &ProcessingRecord,
        file: &MediaFile,
        track: TrackRecord,
    ) -> Result<(), ConvertError> {
        let started = Instant::now();
        let relative = &file.relative_path;
        let image = run.pair.source.as_path().join(relative);
        let processed = run.pair.processed.as_path();
        let extract_dir = processed.join(EXTRACT_DIR).join(relative);
        let dest_dir = processed.join(relative.with_extension(""));

        let extractor = self.extractor.as_ref();
        let (image_ref, extract_ref) = (&image, &extract_dir);
        let (extracted, mut attempts) = self
            .with_retries(relative, || async move {
                Self::remove_scratch(extract_ref).await?;
                extractor
                    .extract(image_ref, extract_ref)
                    .await
                    .map_err(ConvertError::from)
            })
            .await;
        let extracted = match extracted {
            Ok(extracted) => extracted,
            Err(e) => {
                self.finish_track(run, record, track, Err(&e), attempts, started)?;
                return Err(e);
            }
        };
        info!(
            "Extracted {} tracks from {:?}",
            extracted.len(),
            relative
        );

        let transcoder = self.transcoder.as_ref();
        for raw in &extracted {
            let Some(stem) = raw.file_stem() else {
                continue;
            };
            let output = dest_dir
                .join(stem)
                .with_extension(self.output_extension);
            let output_ref = &output;
            let (result, tries) = self
                .with_retries(raw, || async move {
                    Self::transcode_once(transcoder, relative, raw, output_ref).await
                })
                .await;
            attempts += tries;
            if let Err(e) = result {
                self.finish_track(run, record, track, Err(&e), attempts, started)?;
                return Err(e);
            }
        }

        Self::remove_scratch(&extract_dir).await?;
        self.finish_track(
            run,
            record,
            track,
            Ok((dest_dir, Some(format!("{} tracks extracted", extracted.len())))),
            attempts,
            started,
        )
    }

    // === ARCHIVING ===

    /// A stamp whose archive name is not already taken on disk.
    fn new_archive_stamp(&self, album_name: &str) -> String {
        let base = Local::now().format(ARCHIVE_STAMP_FORMAT).to_string();
        let mut stamp = base.clone();
        let mut n = 1;
        while self.staging.archive_name_taken(album_name, &stamp) {
            stamp = format!("{}_{}", base, n);
            n += 1;
        }
        stamp
    }

    async fn archive(&self, run: &AlbumRun<'_>) -> Result<ProcessingRecord, ArchiveError> {
        let record = self
            .ledger
            .upsert(&run.update().with_stage(ProcessingStage::Archiving))?;
        self.audit.log_started(&record, HistoryOperation::Archive);

        let source = &run.pair.source;
        if !source.as_path().is_dir() {
            return Err(ArchiveError::MissingStaging(source.as_path().to_path_buf()));
        }

        let stamp = match record.archive_stamp.clone() {
            Some(stamp) => stamp,
            None => {
                let stamp = self.new_archive_stamp(&run.album.name);
                self.ledger
                    .upsert(&run.update().with_archive_stamp(&stamp))?;
                stamp
            }
        };
        let archive_path = self.staging.archive_path_for(&run.album.name, &stamp);
        self.staging.promote_to_archive(source, &archive_path).await?;

        Ok(self
            .ledger
            .upsert(&run.update().with_archive_path(archive_path))?)
    }

    // === FINALIZING ===

    async fn finalize(&self, run: &AlbumRun<'_>) -> Result<ProcessingRecord, FinalizeError> {
        let record = self
            .ledger
            .upsert(&run.update().with_stage(ProcessingStage::Finalizing))?;
        self.audit.log_started(&record, HistoryOperation::Finalize);

        let archive_path = record
            .archive_path
            .clone()
            .filter(|p| p.is_dir())
            .ok_or_else(|| FinalizeError::ArchiveMissing(run.album.path().to_path_buf()))?;
        let processed = &run.pair.processed;
        if !processed.as_path().is_dir() {
            return Err(FinalizeError::MissingStaging(processed.as_path().to_path_buf()));
        }
        let scratch = processed.as_path().join(EXTRACT_DIR);
        if scratch.exists() {
            tokio::fs::remove_dir_all(&scratch)
                .await
                .map_err(StagingError::from)?;
        }

        let displace_first = run.in_place()
            || (self.settings.remove_source_after_conversion
                && !self.settings.require_output_before_source_removal);
        if displace_first {
            self.ledger
                .upsert(&run.update().with_source_displaced(true))?;
            if let Err(e) = self.staging.remove_original(&run.album.root).await {
                return Err(self
                    .restore_after_failure(run, &archive_path, e.into())
                    .await);
            }
        }

        if let Err(e) = self
            .staging
            .promote_to_output(processed, &run.output_path)
            .await
        {
            let cause = match e {
                StagingError::DestinationExists(path) => FinalizeError::OutputExists(path),
                other => FinalizeError::Staging(other),
            };
            if displace_first {
                return Err(self.restore_after_failure(run, &archive_path, cause).await);
            }
            return Err(cause);
        }

        let mut update = run.update().with_output_path(run.output_path.clone());
        if displace_first {
            update = update.with_source_displaced(false);
        }
        Ok(self.ledger.upsert(&update)?)
    }

    /// Put the original back after a failure that followed its removal.
    async fn restore_after_failure(
        &self,
        run: &AlbumRun<'_>,
        archive_path: &Path,
        cause: FinalizeError,
    ) -> FinalizeError {
        match self.restore_original(&run.album.root, archive_path).await {
            Ok(()) => {
                if let Err(e) = self
                    .ledger
                    .upsert(&run.update().with_source_displaced(false))
                {
                    return FinalizeError::Ledger(e);
                }
                FinalizeError::Restored {
                    cause: Box::new(cause),
                }
            }
            Err(restore) => {
                error!(
                    "Could not restore {} from {:?}: {}",
                    run.album.root, archive_path, restore
                );
                FinalizeError::RestoreFailed {
                    cause: Box::new(cause),
                    archive: archive_path.to_path_buf(),
                    restore,
                }
            }
        }
    }

    /// Restore `original` from the archive, replacing a partially removed copy.
    async fn restore_original(
        &self,
        original: &OriginalPath,
        archive_path: &Path,
    ) -> Result<(), StagingError> {
        match self.staging.restore_from_archive(archive_path, original).await {
            Ok(_) => Ok(()),
            Err(StagingError::DestinationExists(_)) => {
                warn!("{} is incomplete, replacing it from the archive", original);
                self.staging.remove_original(original).await?;
                self.staging
                    .restore_from_archive(archive_path, original)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    // === COMPLETED ===

    /// Remove the original and the staging pair as configured, then mark COMPLETED.
    async fn complete(
        &self,
        album: &AlbumUnit,
        record: ProcessingRecord,
        pair: Option<&StagingPair>,
    ) -> Result<ProcessingRecord, FinalizeError> {
        let in_place = record.output_path.as_deref() == Some(album.path());

        if self.settings.remove_source_after_conversion
            && !in_place
            && album.path().exists()
        {
            if record.archive_path.is_none() || record.output_path.is_none() {
                return Err(FinalizeError::ArchiveMissing(album.path().to_path_buf()));
            }
            self.staging.remove_original(&album.root).await?;
        }

        if self.settings.cleanup_working_on_success {
            if let Err(e) = self.cleanup_staging(&record, pair).await {
                warn!("Cleanup after {} failed: {}", album.name, e);
            }
        }

        let completed = self.ledger.upsert(
            &update_for(&record)
                .with_stage(ProcessingStage::Completed)
                .clear_error(),
        )?;
        Ok(completed)
    }

    /// Clear the working paths in the ledger, then delete the directories.
    async fn cleanup_staging(
        &self,
        record: &ProcessingRecord,
        pair: Option<&StagingPair>,
    ) -> Result<(), CleanupError> {
        let started = Instant::now();
        let mut pairs: Vec<StagingPair> = pair.into_iter().cloned().collect();
        if let Some(recorded) = recorded_pair(record) {
            if !pairs.contains(&recorded) {
                pairs.push(recorded);
            }
        }
        if record.has_working_paths() {
            self.ledger
                .upsert(&update_for(record).clear_working_paths())?;
        }
        for pair in &pairs {
            self.staging.cleanup_pair(pair).await?;
        }
        self.audit.log_succeeded(
            record,
            HistoryOperation::Cleanup,
            started.elapsed(),
            Some(serde_json::json!({ "removed_pairs": pairs.len() })),
        );
        Ok(())
    }

    /// Finish an album whose output was already promoted by an earlier run.
    async fn resume_to_completion(
        &self,
        session: &Session,
        album: &AlbumUnit,
        record: &ProcessingRecord,
        from_other_session: bool,
    ) -> Result<AlbumOutcome> {
        info!(
            "Output of {} already promoted, finishing record {}",
            album.name, record.id
        );
        let mut update = RecordUpdate::new(&session.id, album.path(), &album.name)
            .with_stage(ProcessingStage::Finalizing)
            .clear_error();
        if from_other_session {
            update = update.superseding(&record.id);
            if let Some(album_id) = &record.album_id {
                update = update.with_album_id(album_id);
            }
            if let Some(fingerprint) = &record.content_fingerprint {
                update = update.with_fingerprint(fingerprint);
            }
            if let (Some(source), Some(processed)) =
                (&record.working_source_path, &record.working_processed_path)
            {
                update = update.with_working_paths(source.clone(), processed.clone());
            }
            if let Some(stamp) = &record.archive_stamp {
                update = update.with_archive_stamp(stamp);
            }
            if let Some(archive) = &record.archive_path {
                update = update.with_archive_path(archive.clone());
            }
            if let Some(output) = &record.output_path {
                update = update.with_output_path(output.clone());
            }
            update = update.with_tracks(record.tracks.iter().cloned());
        }
        let current = self.ledger.upsert(&update)?;
        let output_path = current
            .output_path
            .clone()
            .unwrap_or_else(|| album.path().to_path_buf());

        let started = Instant::now();
        let pair = recorded_pair(&current);
        match self.complete(album, current, pair.as_ref()).await {
            Ok(record) => {
                self.audit.log_succeeded(
                    &record,
                    HistoryOperation::Finalize,
                    started.elapsed(),
                    Some(serde_json::json!({ "resumed": true })),
                );
                Ok(AlbumOutcome::Completed {
                    record_id: record.id,
                    output_path,
                })
            }
            Err(e) => {
                self.fail(session, album, pair.as_ref(), e.into(), started)
                    .await
            }
        }
    }

    // === FAILURE ===

    async fn fail_run(
        &self,
        run: &AlbumRun<'_>,
        err: StageError,
        started: Instant,
    ) -> Result<AlbumOutcome> {
        self.fail(run.session, run.album, Some(&run.pair), err, started)
            .await
    }

    /// Record a stage failure and clean up as configured.
    async fn fail(
        &self,
        session: &Session,
        album: &AlbumUnit,
        pair: Option<&StagingPair>,
        err: StageError,
        started: Instant,
    ) -> Result<AlbumOutcome> {
        let reason = err.to_string();
        let record = self.ledger.record(&session.id, album.path())?;
        let Some(record) = record else {
            anyhow::bail!("No record for {} while recording: {}", album.name, reason);
        };
        let stage = record.stage.failure().unwrap_or_else(|| err.stage());
        error!("{} failed at {}: {}", album.name, stage.label(), reason);

        let clean = (stage == ProcessingStage::FailedPrepare
            || self.settings.cleanup_working_on_failure)
            && !record.source_displaced;
        let mut update = update_for(&record).with_stage(stage).with_error(&reason);
        if clean {
            update = update.clear_working_paths();
        }
        let failed = self.ledger.upsert(&update)?;
        self.audit
            .log_failed(&failed, operation_for(stage), started.elapsed(), &reason);

        if clean {
            let mut pairs: Vec<StagingPair> = pair.into_iter().cloned().collect();
            if let Some(recorded) = recorded_pair(&record) {
                if !pairs.contains(&recorded) {
                    pairs.push(recorded);
                }
            }
            for pair in &pairs {
                if let Err(e) = self.staging.cleanup_pair(pair).await {
                    warn!("Failed to remove staging {}: {}", pair.source, e);
                }
            }
        } else if record.source_displaced {
            warn!(
                "Keeping staging of {}: original is not back in place",
                album.name
            );
        }

        Ok(AlbumOutcome::Failed { stage, reason })
    }

    // === RECOVERY ===

    /// Repair albums whose original was removed ahead of a promotion that never
    /// finished. Returns the number of records brought back to a safe state.
    pub async fn recover_displaced(&self) -> Result<usize> {
        let records = self.ledger.displaced_records()?;
        if self.settings.dry_run {
            for record in &records {
                warn!(
                    "[dry run] Original of {} was removed by an earlier run, a real run restores it",
                    record.album_name
                );
            }
            return Ok(0);
        }

        let mut recovered = 0;
        for record in records {
            match self.recover_record(&record).await? {
                Recovery::Promoted | Recovery::Restored => recovered += 1,
                Recovery::Unrecoverable(_) => {}
            }
        }
        Ok(recovered)
    }

    /// Settle one displaced record: keep a promoted output, or restore the
    /// original from its archive.
    async fn recover_record(&self, record: &ProcessingRecord) -> Result<Recovery> {
        let original = OriginalPath::new(&record.album_path);
        let update = update_for(record).with_source_displaced(false);

        if let Some(output) = self.promoted_output(record).await? {
            info!(
                "Output of {} was promoted before the interruption",
                record.album_name
            );
            self.ledger.upsert(&update.with_output_path(output))?;
            return Ok(Recovery::Promoted);
        }

        let Some(archive) = record.archive_path.clone().filter(|p| p.is_dir()) else {
            error!(
                "Cannot recover {}: original displaced and no archive on disk",
                original
            );
            return Ok(Recovery::Unrecoverable("no archive on disk".to_string()));
        };
        match self.restore_original(&original, &archive).await {
            Ok(()) => {
                info!("Restored {} from {:?}", original, archive);
                self.ledger.upsert(&update)?;
                Ok(Recovery::Restored)
            }
            Err(e) => {
                error!("Failed to restore {} from {:?}: {}", original, archive, e);
                Ok(Recovery::Unrecoverable(format!(
                    "restoring from {:?} failed: {}",
                    archive, e
                )))
            }
        }
    }

    /// The output location of a displaced record, if it holds a verified copy
    /// of the processed staging dir.
    async fn promoted_output(&self, record: &ProcessingRecord) -> Result<Option<PathBuf>> {
        let Some(pair) = recorded_pair(record) else {
            return Ok(None);
        };
        if !pair.processed.as_path().is_dir() {
            return Ok(None);
        }
        let Some(session) = self.ledger.get_session(&record.session_id)? else {
            return Ok(None);
        };
        let output = output_location(&session, &record.album_path, &record.album_name);
        if !output.exists() {
            return Ok(None);
        }
        match self.staging.verify_copy(pair.processed.as_path(), &output).await {
            Ok(_) => Ok(Some(output)),
            Err(e) => {
                debug!("{:?} is not the promoted output: {}", output, e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SessionStatus;

    fn session(input: &str, output: &str) -> Session {
        Session {
            id: "s1".to_string(),
            input_dir: PathBuf::from(input),
            output_dir: PathBuf::from(output),
            archive_dir: PathBuf::from("/archive"),
            status: SessionStatus::Running,
            started_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn test_output_location_mirrors_relative_path() {
        let session = session("/music", "/converted");
        assert_eq!(
            output_location(&session, Path::new("/music/Artist/Album"), "Album"),
            PathBuf::from("/converted/Artist/Album")
        );
    }

    #[test]
    fn test_output_location_in_place() {
        let session = session("/music", "/music");
        assert_eq!(
            output_location(&session, Path::new("/music/Album"), "Album"),
            PathBuf::from("/music/Album")
        );
        assert_eq!(
            output_location(&session, Path::new("/music"), "music"),
            PathBuf::from("/music")
        );
    }

    #[test]
    fn test_output_location_for_album_outside_input() {
        let session = session("/music", "/converted");
        assert_eq!(
            output_location(&session, Path::new("/elsewhere/Album"), "Album"),
            PathBuf::from("/converted/Album")
        );
    }

    fn file(path: &str, class: FileClass) -> MediaFile {
        MediaFile {
            relative_path: PathBuf::from(path),
            size: 1,
            class,
        }
    }

    fn album(files: Vec<MediaFile>) -> AlbumUnit {
        AlbumUnit {
            root: OriginalPath::new("/music/Album"),
            name: "Album".to_string(),
            files,
        }
    }

    #[test]
    fn test_output_collision_with_passthrough_track() {
        let album = album(vec![
            file("01.dsf", FileClass::Convert),
            file("01.flac", FileClass::Disabled),
            file("cover.jpg", FileClass::Passthrough),
        ]);
        match output_collision(&album, "flac") {
            Some(PrepareError::OutputCollision {
                first,
                second,
                output,
            }) => {
                assert_eq!(first, PathBuf::from("01.dsf"));
                assert_eq!(second, PathBuf::from("01.flac"));
                assert_eq!(output, PathBuf::from("01.flac"));
            }
            other => panic!("Expected a collision, got {:?}", other),
        }
        assert!(output_collision(&album, "dsf").is_none());
    }

    #[test]
    fn test_output_collision_between_converted_tracks() {
        let album = album(vec![
            file("01.dff", FileClass::Convert),
            file("01.dsf", FileClass::Convert),
        ]);
        assert!(output_collision(&album, "flac").is_some());
    }

    #[test]
    fn test_output_collision_with_extraction_directory() {
        let album = album(vec![
            file("disc.iso", FileClass::Extract),
            file("disc/booklet.pdf", FileClass::Passthrough),
        ]);
        assert!(output_collision(&album, "flac").is_some());
    }

    #[test]
    fn test_no_collision_across_discs() {
        let discs = album(vec![
            file("CD1/01.dsf", FileClass::Convert),
            file("CD2/01.dsf", FileClass::Convert),
            file("disc.cue", FileClass::Passthrough),
            file("disc.iso", FileClass::Extract),
        ]);
        assert!(output_collision(&discs, "flac").is_none());
    }

    #[test]
    fn test_outcome_display() {
        let failed = AlbumOutcome::Failed {
            stage: ProcessingStage::FailedConvert,
            reason: "converting: 1 of 3 tracks failed".to_string(),
        };
        assert_eq!(
            failed.to_string(),
            "failed at converting: converting: 1 of 3 tracks failed"
        );
        assert!(failed.is_failure());
        assert_eq!(
            AlbumOutcome::SkippedNoConvertible.to_string(),
            "skipped (no convertible content)"
        );
        assert!(AlbumOutcome::SkippedNoConvertible.is_skipped());

        let planned = AlbumOutcome::Planned {
            output_path: PathBuf::from("/converted/Album"),
            conversions: 2,
        };
        assert_eq!(
            planned.to_string(),
            "dry run, 2 files to convert into /converted/Album"
        );
        assert!(!planned.is_completed() && !planned.is_failure() && !planned.is_skipped());
    }
}
