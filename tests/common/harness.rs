//! Pipeline wired over a temporary directory tree.

use super::fakes::{FixedSpace, ScriptedExtractor, ScriptedTranscoder};
use super::fixtures::AlbumFixture;
use album_converter::album::{AlbumScanner, AlbumUnit, FormatPolicy};
use album_converter::audit::{AuditStore, AuditTrail, HistoryEntry, SqliteAuditStore};
use album_converter::config::{pause_file_path, ConversionSettings, ProcessingSettings};
use album_converter::ledger::{ProcessingRecord, ProgressLedger, Session, SqliteProgressLedger};
use album_converter::pipeline::{AlbumOutcome, AlbumPipeline, BatchRunner};
use album_converter::staging::{looks_like_staging, verify, WorkingDirectoryManager};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Plenty of room for every fixture.
const AMPLE_SPACE: u64 = 1 << 40;

pub struct TestHarness {
    _temp: TempDir,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub working_dir: PathBuf,
    /// Untouched copies of every album added through `add_album`.
    pub pristine_dir: PathBuf,
    pub db_path: PathBuf,
    pub ledger: Arc<SqliteProgressLedger>,
    pub audit_store: Arc<SqliteAuditStore>,
    pub audit: Arc<AuditTrail>,
    pub transcoder: Arc<ScriptedTranscoder>,
    pub extractor: Arc<ScriptedExtractor>,
    pub space: Arc<FixedSpace>,
    pub settings: ProcessingSettings,
    pub conversion: ConversionSettings,
    pub session: Session,
}

impl TestHarness {
    /// Output goes to a separate directory.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Output replaces the album at its original location.
    pub fn in_place() -> Self {
        Self::build(true)
    }

    fn build(in_place: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let input_dir = root.join("music");
        let output_dir = if in_place {
            input_dir.clone()
        } else {
            root.join("converted")
        };
        let archive_dir = root.join("archive");
        let working_dir = root.join("working");
        let pristine_dir = root.join("pristine");
        for dir in [&input_dir, &output_dir, &archive_dir, &working_dir, &pristine_dir] {
            fs::create_dir_all(dir).unwrap();
        }

        let db_path = working_dir.join("ledger.db");
        let ledger = Arc::new(SqliteProgressLedger::open(&db_path).unwrap());
        let audit_store = Arc::new(SqliteAuditStore::new(&ledger));
        let audit = Arc::new(AuditTrail::new(audit_store.clone()));
        let session = ledger
            .create_session(&input_dir, &output_dir, &archive_dir)
            .unwrap();

        Self {
            _temp: temp,
            input_dir,
            output_dir,
            archive_dir,
            working_dir,
            pristine_dir,
            db_path,
            ledger,
            audit_store,
            audit,
            transcoder: Arc::new(ScriptedTranscoder::new()),
            extractor: Arc::new(ScriptedExtractor::new(&["01.dsf", "02.dsf"])),
            space: Arc::new(FixedSpace::new(AMPLE_SPACE)),
            settings: ProcessingSettings {
                retry_backoff_ms: 0,
                max_retry_backoff_ms: 0,
                space_safety_margin_bytes: 0,
                ..Default::default()
            },
            conversion: ConversionSettings::default(),
            session,
        }
    }

    /// Write an album into the input dir and a pristine copy next to it.
    pub fn add_album(&self, fixture: AlbumFixture) -> PathBuf {
        fixture.write(&self.pristine_dir);
        fixture.write(&self.input_dir)
    }

    pub fn pristine(&self, name: &str) -> PathBuf {
        self.pristine_dir.join(name)
    }

    pub fn album_path(&self, name: &str) -> PathBuf {
        self.input_dir.join(name)
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Simulate a restart: reopen the database and start a new session.
    pub fn restart(&mut self, resume: bool) {
        self.ledger = Arc::new(SqliteProgressLedger::open(&self.db_path).unwrap());
        self.audit_store = Arc::new(SqliteAuditStore::new(&self.ledger));
        self.audit = Arc::new(AuditTrail::new(self.audit_store.clone()));
        self.transcoder.clear_hangs();
        self.session = self
            .runner()
            .open_session(&self.input_dir, &self.output_dir, &self.archive_dir, resume)
            .unwrap();
    }

    pub fn staging_manager(&self) -> WorkingDirectoryManager {
        WorkingDirectoryManager::new(
            &self.working_dir,
            &self.archive_dir,
            &self.settings,
            self.space.clone(),
        )
    }

    pub fn pipeline(&self) -> AlbumPipeline {
        AlbumPipeline::new(
            self.ledger.clone(),
            self.staging_manager(),
            self.transcoder.clone(),
            self.extractor.clone(),
            self.audit.clone(),
            &self.settings,
            &self.conversion,
        )
    }

    pub fn scanner(&self) -> AlbumScanner {
        let mut excluded = vec![self.working_dir.clone(), self.archive_dir.clone()];
        if self.output_dir != self.input_dir {
            excluded.push(self.output_dir.clone());
        }
        AlbumScanner::new(FormatPolicy::new(&self.conversion), excluded)
    }

    pub fn runner(&self) -> BatchRunner {
        BatchRunner::new(
            self.pipeline(),
            self.scanner(),
            self.audit.clone(),
            pause_file_path(&self.working_dir),
            &self.settings,
        )
    }

    pub fn album(&self, name: &str) -> AlbumUnit {
        self.scanner().load_album(&self.album_path(name)).unwrap()
    }

    pub async fn process(&self, name: &str) -> AlbumOutcome {
        let album = self.album(name);
        self.pipeline()
            .process_album(&self.session, &album)
            .await
            .unwrap()
    }

    pub fn record(&self, name: &str) -> Option<ProcessingRecord> {
        self.ledger
            .record(&self.session.id, &self.album_path(name))
            .unwrap()
    }

    /// Staging directories currently under the working dir.
    pub fn staging_dirs(&self) -> Vec<PathBuf> {
        Self::entries(&self.working_dir)
            .into_iter()
            .filter(|p| p.is_dir() && looks_like_staging(p))
            .collect()
    }

    pub fn archives(&self) -> Vec<PathBuf> {
        Self::entries(&self.archive_dir)
    }

    fn entries(dir: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }

    /// Whether `copy` holds exactly the files of `original`.
    pub fn same_tree(&self, original: &Path, copy: &Path) -> bool {
        verify::verify_tree(original, copy, u64::MAX).is_ok()
    }

    pub fn history(&self, name: &str) -> Vec<HistoryEntry> {
        self.audit.flush().unwrap();
        self.audit_store
            .entries_for_album(&self.album_path(name))
            .unwrap()
    }
}
