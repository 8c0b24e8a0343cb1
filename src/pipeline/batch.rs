//! Batch runs over an input directory.
//!
//! Albums are processed one at a time in path order. Cancellation is only
//! honoured between albums: through the shutdown token (Ctrl+C) or the
//! pause control file in the working directory.

use super::orchestrator::{AlbumOutcome, AlbumPipeline};
use crate::album::AlbumScanner;
use crate::audit::AuditTrail;
use crate::config::ProcessingSettings;
use crate::ledger::{Session, SessionStatus};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of one batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub session_id: String,
    /// Per-album outcome, in processing order.
    pub outcomes: Vec<(PathBuf, AlbumOutcome)>,
    /// Displaced originals put back before the run started.
    pub recovered: usize,
    pub paused: bool,
    pub stopped_on_failure: bool,
}

impl BatchReport {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_completed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).count()
    }

    pub fn planned(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, AlbumOutcome::Planned { .. }))
            .count()
    }

    pub fn outcome_for(&self, album_path: &Path) -> Option<&AlbumOutcome> {
        self.outcomes
            .iter()
            .find(|(path, _)| path == album_path)
            .map(|(_, outcome)| outcome)
    }
}

pub struct BatchRunner {
    pipeline: AlbumPipeline,
    scanner: AlbumScanner,
    audit: Arc<AuditTrail>,
    pause_file: PathBuf,
    stop_on_failure: bool,
}

impl BatchRunner {
    pub fn new(
        pipeline: AlbumPipeline,
        scanner: AlbumScanner,
        audit: Arc<AuditTrail>,
        pause_file: PathBuf,
        settings: &ProcessingSettings,
    ) -> Self {
        Self {
            pipeline,
            scanner,
            audit,
            pause_file,
            stop_on_failure: settings.stop_batch_on_failure,
        }
    }

    pub fn pipeline(&self) -> &AlbumPipeline {
        &self.pipeline
    }

    /// Session to run in: the latest unfinished one over the same roots when
    /// resuming, otherwise a new one.
    pub fn open_session(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        archive_dir: &Path,
        resume: bool,
    ) -> Result<Session> {
        let ledger = self.pipeline.ledger();
        if resume {
            match ledger.latest_resumable_session()? {
                Some(session)
                    if session.input_dir == input_dir
                        && session.output_dir == output_dir
                        && session.archive_dir == archive_dir =>
                {
                    info!("Resuming session {}", session.id);
                    return Ok(session);
                }
                Some(session) => warn!(
                    "Latest unfinished session {} ran over {:?}, starting a new session",
                    session.id, session.input_dir
                ),
                None => info!("No unfinished session to resume"),
            }
        }
        let session = ledger.create_session(input_dir, output_dir, archive_dir)?;
        info!("Started session {}", session.id);
        Ok(session)
    }

    fn flush_audit(&self) {
        if let Err(e) = self.audit.flush() {
            warn!(
                "Failed to write {} audit entries: {}",
                self.audit.pending(),
                e
            );
        }
    }

    /// Process every album of the session's input directory, or the input
    /// directory itself as one album when `single_album` is set.
    pub async fn run(
        &self,
        session: &Session,
        single_album: bool,
        shutdown: &CancellationToken,
    ) -> Result<BatchReport> {
        let ledger = self.pipeline.ledger();
        ledger.set_session_status(&session.id, SessionStatus::Running)?;
        let mut report = BatchReport::new(&session.id);

        report.recovered = self.pipeline.recover_displaced().await?;
        if report.recovered > 0 {
            info!("Recovered {} displaced albums", report.recovered);
        }

        let albums = if single_album {
            vec![self.scanner.load_album(&session.input_dir)?]
        } else {
            self.scanner.scan(&session.input_dir)?
        };
        info!(
            "Found {} albums under {:?}",
            albums.len(),
            session.input_dir
        );

        let mut paused_by_file = false;
        for (index, album) in albums.iter().enumerate() {
            if shutdown.is_cancelled() {
                info!("Interrupted, pausing before {}", album.name);
                report.paused = true;
                break;
            }
            if self.pause_file.exists() {
                info!("Pause requested, stopping before {}", album.name);
                report.paused = true;
                paused_by_file = true;
                break;
            }

            info!("[{}/{}] {}", index + 1, albums.len(), album.name);
            let outcome = self.pipeline.process_album(session, album).await;
            self.flush_audit();
            let outcome = outcome?;
            info!("{}: {}", album.name, outcome);

            let failed = outcome.is_failure();
            report.outcomes.push((album.path().to_path_buf(), outcome));
            if failed && self.stop_on_failure {
                warn!("Stopping batch after failure of {}", album.name);
                report.stopped_on_failure = true;
                break;
            }
        }

        let status = if report.paused || report.stopped_on_failure {
            SessionStatus::Paused
        } else {
            SessionStatus::Completed
        };
        ledger.set_session_status(&session.id, status)?;

        if paused_by_file {
            if let Err(e) = std::fs::remove_file(&self.pause_file) {
                warn!("Failed to remove pause file {:?}: {}", self.pause_file, e);
            }
        }
        self.flush_audit();

        info!(
            "Session {} {}: {} completed, {} skipped, {} failed",
            session.id,
            status.as_str().to_lowercase(),
            report.completed(),
            report.skipped(),
            report.failed()
        );
        Ok(report)
    }
}
