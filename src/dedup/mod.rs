//! Duplicate detection across runs and locations.

mod fingerprint;

pub use fingerprint::{
    file_fingerprint, fingerprint_album, ContentFingerprint, LARGE_FILE_HEAD_BYTES,
};

use crate::album::AlbumUnit;
use crate::ledger::ProgressLedger;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Namespace for album ids derived from content fingerprints.
const ALBUM_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_9a4d_4e57_b0a1_2f8c_5d7e_9b13);

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

/// Identity of an album that already completed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumIdentity {
    pub album_id: String,
    pub record_id: String,
    pub session_id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
}

impl AlbumIdentity {
    /// Whether the prior output is still on disk.
    pub fn output_present(&self) -> bool {
        self.output_path.exists()
    }
}

pub struct Deduplicator {
    ledger: Arc<dyn ProgressLedger>,
    digest_limit: u64,
}

impl Deduplicator {
    pub fn new(ledger: Arc<dyn ProgressLedger>, digest_limit: u64) -> Self {
        Self {
            ledger,
            digest_limit,
        }
    }

    pub async fn fingerprint(&self, album: &AlbumUnit) -> Result<ContentFingerprint, DedupError> {
        let album = album.clone();
        let limit = self.digest_limit;
        let fingerprint =
            tokio::task::spawn_blocking(move || fingerprint_album(&album, limit)).await??;
        Ok(fingerprint)
    }

    /// A prior identity, only from a record that reached COMPLETED with an output path.
    pub fn find_prior(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<AlbumIdentity>, DedupError> {
        let Some(record) = self
            .ledger
            .find_completed_by_fingerprint(fingerprint.as_str())?
        else {
            return Ok(None);
        };
        let (Some(album_id), Some(output_path)) = (record.album_id, record.output_path) else {
            debug!(
                "Completed record {} lacks an album id or output, not reusing it",
                record.id
            );
            return Ok(None);
        };
        Ok(Some(AlbumIdentity {
            album_id,
            record_id: record.id,
            session_id: record.session_id,
            source_path: record.album_path,
            output_path,
        }))
    }

    /// Album id for a run: the id already on the record, else the verified prior's,
    /// else one derived from the fingerprint.
    pub fn album_id_for(
        fingerprint: &ContentFingerprint,
        prior: Option<&AlbumIdentity>,
        existing: Option<&str>,
    ) -> String {
        if let Some(existing) = existing {
            return existing.to_string();
        }
        if let Some(prior) = prior {
            return prior.album_id.clone();
        }
        Uuid::new_v5(&ALBUM_ID_NAMESPACE, fingerprint.as_str().as_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ProcessingStage, RecordUpdate, SqliteProgressLedger};
    use std::path::Path;

    fn complete(ledger: &SqliteProgressLedger, update: RecordUpdate) {
        ledger.upsert(&update).unwrap();
        for stage in [
            ProcessingStage::Converting,
            ProcessingStage::Archiving,
            ProcessingStage::Finalizing,
        ] {
            ledger.upsert(&update.clone().with_stage(stage)).unwrap();
        }
        ledger
            .upsert(
                &update
                    .with_stage(ProcessingStage::Completed)
                    .with_output_path(PathBuf::from("/out/Album")),
            )
            .unwrap();
    }

    #[test]
    fn test_album_id_is_deterministic() {
        let fp = ContentFingerprint::from("abc".to_string());
        let a = Deduplicator::album_id_for(&fp, None, None);
        let b = Deduplicator::album_id_for(&fp, None, None);
        assert_eq!(a, b);
        assert_eq!(Deduplicator::album_id_for(&fp, None, Some("kept")), "kept");
    }

    #[test]
    fn test_find_prior_only_returns_completed_records() {
        let ledger = Arc::new(SqliteProgressLedger::in_memory().unwrap());
        let session = ledger
            .create_session(Path::new("/in"), Path::new("/out"), Path::new("/arch"))
            .unwrap();
        let dedup = Deduplicator::new(ledger.clone(), u64::MAX);
        let fp = ContentFingerprint::from("f".repeat(64));

        // A failed run with the same content is never reused
        ledger
            .upsert(
                &RecordUpdate::new(&session.id, "/in/Failed", "Failed")
                    .with_fingerprint(fp.as_str())
                    .with_album_id("failed-id"),
            )
            .unwrap();
        ledger
            .upsert(
                &RecordUpdate::new(&session.id, "/in/Failed", "Failed")
                    .with_stage(ProcessingStage::FailedPrepare),
            )
            .unwrap();
        assert!(dedup.find_prior(&fp).unwrap().is_none());

        complete(
            &ledger,
            RecordUpdate::new(&session.id, "/in/Album", "Album")
                .with_fingerprint(fp.as_str())
                .with_album_id("done-id"),
        );
        let prior = dedup.find_prior(&fp).unwrap().unwrap();
        assert_eq!(prior.album_id, "done-id");
        assert_eq!(prior.output_path, PathBuf::from("/out/Album"));
        assert_eq!(
            Deduplicator::album_id_for(&fp, Some(&prior), None),
            "done-id"
        );
    }
}
