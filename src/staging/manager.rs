//! All filesystem mutation around staging, archive and output locations.
//!
//! Every copy is verified before it is reported as done. Promotions copy into
//! a `.partial` sibling, verify it and then rename it into place, so the
//! destination is either complete or absent.

use super::paths::{
    looks_like_staging, OriginalPath, StagingKind, StagingPair, StagingPath, PARTIAL_SUFFIX,
    RESTORE_SUFFIX,
};
use super::space::{estimate_required_space, SpaceMeter};
use super::verify::{self, VerifySummary};
use super::StagingError;
use crate::album::{AlbumUnit, FileClass};
use crate::config::ProcessingSettings;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct WorkingDirectoryManager {
    working_root: PathBuf,
    archive_root: PathBuf,
    space: Arc<dyn SpaceMeter>,
    digest_limit: u64,
    safety_margin: u64,
}

impl WorkingDirectoryManager {
    pub fn new(
        working_root: impl Into<PathBuf>,
        archive_root: impl Into<PathBuf>,
        settings: &ProcessingSettings,
        space: Arc<dyn SpaceMeter>,
    ) -> Self {
        Self {
            working_root: working_root.into(),
            archive_root: archive_root.into(),
            space,
            digest_limit: settings.max_file_size_for_expensive_analysis,
            safety_margin: settings.space_safety_margin_bytes,
        }
    }

    pub fn working_root(&self) -> &Path {
        &self.working_root
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Create the working and archive roots.
    pub async fn init(&self) -> Result<(), StagingError> {
        fs::create_dir_all(&self.working_root).await?;
        fs::create_dir_all(&self.archive_root).await?;
        Ok(())
    }

    pub fn derive_pair(&self, album_name: &str, fingerprint: &str) -> StagingPair {
        StagingPair::derive(&self.working_root, album_name, fingerprint)
    }

    /// Archive directory for an album, named after the persisted stamp.
    pub fn archive_path_for(&self, album_name: &str, stamp: &str) -> PathBuf {
        self.archive_root
            .join(format!("{}_{}", super::paths::sanitize_name(album_name), stamp))
    }

    /// Whether an archive directory (or its in-progress copy) already uses this name.
    pub fn archive_name_taken(&self, album_name: &str, stamp: &str) -> bool {
        let path = self.archive_path_for(album_name, stamp);
        path.exists()
            || Self::sibling(&path, PARTIAL_SUFFIX)
                .map(|p| p.exists())
                .unwrap_or(false)
    }

    /// Fail with `InsufficientSpace` unless the working root can hold the album.
    /// Returns the required byte count.
    pub fn check_space(&self, album: &AlbumUnit) -> Result<u64, StagingError> {
        let required = estimate_required_space(album.total_size(), album.has_container())
            .saturating_add(self.safety_margin);
        let available = self.space.available_space(&self.working_root)?;
        debug!(
            "Space check for {}: required {:#}, available {:#}",
            album.name,
            byte_unit::Byte::from(required),
            byte_unit::Byte::from(available)
        );
        if available < required {
            return Err(StagingError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(required)
    }

    /// Create both staging directories.
    pub async fn create_pair(&self, pair: &StagingPair) -> Result<(), StagingError> {
        fs::create_dir_all(pair.source.as_path()).await?;
        fs::create_dir_all(pair.processed.as_path()).await?;
        debug!("Created staging pair {}", pair.source);
        Ok(())
    }

    fn album_listing(album: &AlbumUnit) -> Vec<(PathBuf, u64)> {
        album
            .files
            .iter()
            .map(|f| (f.relative_path.clone(), f.size))
            .collect()
    }

    async fn copy_listing(
        source_root: &Path,
        listing: &[(PathBuf, u64)],
        dest_root: &Path,
    ) -> Result<(), StagingError> {
        fs::create_dir_all(dest_root).await?;
        for (relative, _) in listing {
            let dest = dest_root.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(source_root.join(relative), &dest).await?;
        }
        Ok(())
    }

    async fn verify_listing(
        &self,
        source_root: &Path,
        listing: Vec<(PathBuf, u64)>,
        dest_root: &Path,
    ) -> Result<VerifySummary, StagingError> {
        let source_root = source_root.to_path_buf();
        let dest_root = dest_root.to_path_buf();
        let digest_limit = self.digest_limit;
        tokio::task::spawn_blocking(move || {
            verify::verify_files(&source_root, &listing, &dest_root, digest_limit)
        })
        .await?
    }

    async fn list_tree(root: &Path) -> Result<Vec<(PathBuf, u64)>, StagingError> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || verify::list_files(&root)).await?
    }

    /// Check that `dest` is a faithful copy of the tree at `source`.
    pub async fn verify_copy(&self, source: &Path, dest: &Path) -> Result<VerifySummary, StagingError> {
        let listing = Self::list_tree(source).await?;
        self.verify_listing(source, listing, dest).await
    }

    /// Copy every album file into the source staging dir and verify the copy.
    pub async fn copy_to_source(
        &self,
        album: &AlbumUnit,
        pair: &StagingPair,
    ) -> Result<VerifySummary, StagingError> {
        let listing = Self::album_listing(album);
        Self::copy_listing(album.path(), &listing, pair.source.as_path()).await?;
        let summary = self
            .verify_listing(album.path(), listing, pair.source.as_path())
            .await?;
        info!(
            "Copied {} files ({:#}) of {} to staging",
            summary.files,
            byte_unit::Byte::from(summary.bytes),
            album.name
        );
        Ok(summary)
    }

    /// Whether an existing staging pair can be reused: both directories exist
    /// and the source copy still matches the album.
    pub async fn source_matches(&self, album: &AlbumUnit, pair: &StagingPair) -> bool {
        if !pair.source.as_path().is_dir() || !pair.processed.as_path().is_dir() {
            return false;
        }
        let listing = Self::album_listing(album);
        match self
            .verify_listing(album.path(), listing, pair.source.as_path())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Staging {} is stale: {}", pair.source, e);
                false
            }
        }
    }

    /// Mirror the album's directory tree in the processed staging dir and copy
    /// over everything that is not converted. Returns the number of copied files.
    pub async fn create_processed_structure(
        &self,
        album: &AlbumUnit,
        pair: &StagingPair,
    ) -> Result<usize, StagingError> {
        let processed = pair.processed.as_path();
        fs::create_dir_all(processed).await?;

        let mut directories: Vec<PathBuf> = album
            .files
            .iter()
            .filter_map(|f| f.relative_path.parent().map(Path::to_path_buf))
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        directories.sort();
        directories.dedup();
        for dir in &directories {
            fs::create_dir_all(processed.join(dir)).await?;
        }

        let passthrough: Vec<(PathBuf, u64)> = album
            .files
            .iter()
            .filter(|f| matches!(f.class, FileClass::Passthrough | FileClass::Disabled))
            .map(|f| (f.relative_path.clone(), f.size))
            .collect();
        let count = passthrough.len();
        for (relative, size) in &passthrough {
            let source = pair.source.as_path().join(relative);
            let dest = processed.join(relative);
            fs::copy(&source, &dest).await?;
            let copied = fs::metadata(&dest).await?.len();
            if copied != *size {
                return Err(StagingError::VerificationFailed(format!(
                    "Size mismatch for {:?}: expected {}, found {}",
                    relative, size, copied
                )));
            }
        }
        debug!(
            "Mirrored {} directories and copied {} files into {}",
            directories.len(),
            count,
            pair.processed
        );
        Ok(count)
    }

    fn sibling(path: &Path, suffix: &str) -> Result<PathBuf, StagingError> {
        let name = path
            .file_name()
            .ok_or_else(|| StagingError::InvalidPath(path.to_path_buf()))?;
        let mut sibling = name.to_os_string();
        sibling.push(suffix);
        Ok(path.with_file_name(sibling))
    }

    /// Copy `source` to `dest` through a verified sibling named with `suffix`.
    async fn promote(
        &self,
        source: &Path,
        dest: &Path,
        suffix: &str,
    ) -> Result<VerifySummary, StagingError> {
        let partial = Self::sibling(dest, suffix)?;
        if partial.exists() {
            debug!("Removing leftover {:?}", partial);
            fs::remove_dir_all(&partial).await?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let listing = Self::list_tree(source).await?;
        let result: Result<VerifySummary, StagingError> = async {
            Self::copy_listing(source, &listing, &partial).await?;
            let summary = self.verify_listing(source, listing, &partial).await?;
            fs::rename(&partial, dest).await?;
            Ok(summary)
        }
        .await;

        if result.is_err() && partial.exists() {
            if let Err(e) = fs::remove_dir_all(&partial).await {
                warn!("Failed to remove partial copy {:?}: {}", partial, e);
            }
        }
        result
    }

    /// Copy the source staging dir to `archive_path` and verify it.
    ///
    /// An archive already at that path is trusted only if it verifies;
    /// otherwise it is removed and rebuilt.
    pub async fn promote_to_archive(
        &self,
        source: &StagingPath,
        archive_path: &Path,
    ) -> Result<VerifySummary, StagingError> {
        if source.kind() != StagingKind::Source {
            return Err(StagingError::InvalidPath(source.as_path().to_path_buf()));
        }
        if archive_path.exists() {
            match self.verify_copy(source.as_path(), archive_path).await {
                Ok(summary) => {
                    info!("Reusing verified archive {:?}", archive_path);
                    return Ok(summary);
                }
                Err(e) => {
                    warn!("Removing stale archive {:?}: {}", archive_path, e);
                    fs::remove_dir_all(archive_path).await?;
                }
            }
        }
        let summary = self
            .promote(source.as_path(), archive_path, PARTIAL_SUFFIX)
            .await?;
        info!(
            "Archived {} files ({:#}) to {:?}",
            summary.files,
            byte_unit::Byte::from(summary.bytes),
            archive_path
        );
        Ok(summary)
    }

    /// Copy the processed staging dir to `output_path` and verify it.
    ///
    /// An existing output that matches the processed dir is accepted as
    /// already promoted. Any other existing output is left untouched.
    pub async fn promote_to_output(
        &self,
        processed: &StagingPath,
        output_path: &Path,
    ) -> Result<VerifySummary, StagingError> {
        if processed.kind() != StagingKind::Processed {
            return Err(StagingError::InvalidPath(processed.as_path().to_path_buf()));
        }
        if output_path.exists() {
            return match self.verify_copy(processed.as_path(), output_path).await {
                Ok(summary) => {
                    info!("Output {:?} already in place", output_path);
                    Ok(summary)
                }
                Err(_) => Err(StagingError::DestinationExists(output_path.to_path_buf())),
            };
        }
        let summary = self
            .promote(processed.as_path(), output_path, PARTIAL_SUFFIX)
            .await?;
        info!("Promoted {} files to {:?}", summary.files, output_path);
        Ok(summary)
    }

    /// Put an album back at its original location from a verified archive.
    pub async fn restore_from_archive(
        &self,
        archive_path: &Path,
        original: &OriginalPath,
    ) -> Result<VerifySummary, StagingError> {
        if !archive_path.is_dir() {
            return Err(StagingError::MissingSource(archive_path.to_path_buf()));
        }
        if original.as_path().exists() {
            return match self.verify_copy(archive_path, original.as_path()).await {
                Ok(summary) => Ok(summary),
                Err(_) => Err(StagingError::DestinationExists(
                    original.as_path().to_path_buf(),
                )),
            };
        }
        let summary = self
            .promote(archive_path, original.as_path(), RESTORE_SUFFIX)
            .await?;
        info!("Restored {} from archive {:?}", original, archive_path);
        Ok(summary)
    }

    fn guard_removal(&self, path: &Path) -> Result<(), StagingError> {
        let refuse = looks_like_staging(path)
            || path.starts_with(&self.working_root)
            || path.starts_with(&self.archive_root)
            || self.working_root.starts_with(path)
            || self.archive_root.starts_with(path)
            || path.parent().is_none();
        if refuse {
            return Err(StagingError::RefusedRemoval(path.to_path_buf()));
        }
        Ok(())
    }

    /// Delete an album from its original location.
    pub async fn remove_original(&self, original: &OriginalPath) -> Result<(), StagingError> {
        self.guard_removal(original.as_path())?;
        if !original.as_path().exists() {
            return Ok(());
        }
        fs::remove_dir_all(original.as_path()).await?;
        info!("Removed original album {}", original);
        Ok(())
    }

    /// Delete a staging directory. Returns false when it was already gone.
    pub async fn cleanup(&self, path: &StagingPath) -> Result<bool, StagingError> {
        if path.as_path().parent() != Some(self.working_root.as_path()) {
            return Err(StagingError::RefusedRemoval(path.as_path().to_path_buf()));
        }
        if !path.as_path().exists() {
            return Ok(false);
        }
        fs::remove_dir_all(path.as_path()).await?;
        debug!("Removed staging directory {}", path);
        Ok(true)
    }

    /// Delete both directories of a pair, attempting both even if one fails.
    pub async fn cleanup_pair(&self, pair: &StagingPair) -> Result<(), StagingError> {
        let source = self.cleanup(&pair.source).await;
        let processed = self.cleanup(&pair.processed).await;
        source?;
        processed?;
        Ok(())
    }

    /// Staging pairs present under the working root, re-derived from their names.
    pub fn list_staging_pairs(&self) -> Result<Vec<StagingPair>, StagingError> {
        if !self.working_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut bases = BTreeSet::new();
        for entry in std::fs::read_dir(&self.working_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(path) = StagingPath::parse(entry.path()) else {
                continue;
            };
            let Some(base) = path.base_name() else {
                continue;
            };
            bases.insert(base);
        }

        Ok(bases
            .into_iter()
            .map(|base| StagingPair::from_base(&self.working_root, &base))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::{FormatPolicy, MediaFile};
    use crate::config::ConversionSettings;
    use std::fs as stdfs;
    use tempfile::TempDir;

    const FP: &str = "feedfacecafebeef00112233445566778899aabbccddeeff0011223344556677";

    struct FixedSpace(u64);

    impl SpaceMeter for FixedSpace {
        fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        manager: WorkingDirectoryManager,
        album: AlbumUnit,
    }

    fn fixture(space: u64) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let album_dir = root.join("music/Album");
        let files = [
            ("01.dsf", b"dsd one".as_slice()),
            ("CD2/02.dsf", b"dsd two".as_slice()),
            ("cover.jpg", b"jpeg".as_slice()),
            ("bonus.flac", b"flac".as_slice()),
        ];
        for (relative, content) in files {
            let path = album_dir.join(relative);
            stdfs::create_dir_all(path.parent().unwrap()).unwrap();
            stdfs::write(path, content).unwrap();
        }
        let policy = FormatPolicy::new(&ConversionSettings::default());
        let album = AlbumUnit {
            root: OriginalPath::new(&album_dir),
            name: "Album".to_string(),
            files: files
                .iter()
                .map(|(relative, content)| MediaFile {
                    relative_path: PathBuf::from(relative),
                    size: content.len() as u64,
                    class: policy.classify(Path::new(relative)),
                })
                .collect(),
        };
        let settings = ProcessingSettings {
            space_safety_margin_bytes: 0,
            ..Default::default()
        };
        let manager = WorkingDirectoryManager::new(
            root.join("working"),
            root.join("archive"),
            &settings,
            Arc::new(FixedSpace(space)),
        );
        Fixture {
            _temp: temp,
            root,
            manager,
            album,
        }
    }

    async fn staged(fx: &Fixture) -> StagingPair {
        fx.manager.init().await.unwrap();
        let pair = fx.manager.derive_pair(&fx.album.name, FP);
        fx.manager.create_pair(&pair).await.unwrap();
        fx.manager.copy_to_source(&fx.album, &pair).await.unwrap();
        pair
    }

    #[test]
    fn test_check_space() {
        let fx = fixture(1000);
        // 22 bytes * 3
        assert_eq!(fx.manager.check_space(&fx.album).unwrap(), 66);

        let fx = fixture(10);
        let err = fx.manager.check_space(&fx.album).unwrap_err();
        assert!(matches!(
            err,
            StagingError::InsufficientSpace {
                required: 66,
                available: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_copy_to_source_and_processed_structure() {
        let fx = fixture(u64::MAX);
        let pair = staged(&fx).await;
        assert!(pair.source.as_path().join("CD2/02.dsf").exists());

        let copied = fx
            .manager
            .create_processed_structure(&fx.album, &pair)
            .await
            .unwrap();
        assert_eq!(copied, 2);
        let processed = pair.processed.as_path();
        assert!(processed.join("CD2").is_dir());
        assert!(processed.join("cover.jpg").exists());
        assert!(processed.join("bonus.flac").exists());
        assert!(!processed.join("01.dsf").exists());

        assert!(fx.manager.source_matches(&fx.album, &pair).await);
        stdfs::write(pair.source.as_path().join("01.dsf"), b"corrupt").unwrap();
        assert!(!fx.manager.source_matches(&fx.album, &pair).await);
    }

    #[tokio::test]
    async fn test_promote_to_archive_replaces_stale_archive() {
        let fx = fixture(u64::MAX);
        let pair = staged(&fx).await;
        let archive = fx.manager.archive_path_for("Album", "20240102_030405");
        assert_eq!(archive, fx.root.join("archive/Album_20240102_030405"));

        stdfs::create_dir_all(&archive).unwrap();
        stdfs::write(archive.join("01.dsf"), b"partial").unwrap();

        let summary = fx
            .manager
            .promote_to_archive(&pair.source, &archive)
            .await
            .unwrap();
        assert_eq!(summary.files, 4);
        assert_eq!(stdfs::read(archive.join("01.dsf")).unwrap(), b"dsd one");
        assert!(!fx.root.join("archive/Album_20240102_030405.partial").exists());

        // A second promotion trusts the verified archive
        fx.manager
            .promote_to_archive(&pair.source, &archive)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_promote_to_output_never_overwrites_foreign_content() {
        let fx = fixture(u64::MAX);
        let pair = staged(&fx).await;
        fx.manager
            .create_processed_structure(&fx.album, &pair)
            .await
            .unwrap();

        let output = fx.root.join("out/Album");
        stdfs::create_dir_all(&output).unwrap();
        stdfs::write(output.join("mine.txt"), b"user data").unwrap();
        let err = fx
            .manager
            .promote_to_output(&pair.processed, &output)
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::DestinationExists(_)));
        assert!(output.join("mine.txt").exists());

        stdfs::remove_dir_all(&output).unwrap();
        fx.manager
            .promote_to_output(&pair.processed, &output)
            .await
            .unwrap();
        assert!(output.join("cover.jpg").exists());
        // Promoting again is a verified no-op
        fx.manager
            .promote_to_output(&pair.processed, &output)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_original_refuses_staging_paths() {
        let fx = fixture(u64::MAX);
        let pair = staged(&fx).await;

        let disguised = OriginalPath::new(pair.source.as_path());
        let err = fx.manager.remove_original(&disguised).await.unwrap_err();
        assert!(matches!(err, StagingError::RefusedRemoval(_)));
        let err = fx
            .manager
            .remove_original(&OriginalPath::new(fx.manager.working_root()))
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::RefusedRemoval(_)));
        assert!(pair.source.as_path().exists());

        fx.manager.remove_original(&fx.album.root).await.unwrap();
        assert!(!fx.album.path().exists());
    }

    #[tokio::test]
    async fn test_restore_from_archive() {
        let fx = fixture(u64::MAX);
        let pair = staged(&fx).await;
        let archive = fx.manager.archive_path_for("Album", "20240102_030405");
        fx.manager
            .promote_to_archive(&pair.source, &archive)
            .await
            .unwrap();
        fx.manager.remove_original(&fx.album.root).await.unwrap();

        fx.manager
            .restore_from_archive(&archive, &fx.album.root)
            .await
            .unwrap();
        assert_eq!(
            stdfs::read(fx.album.path().join("CD2/02.dsf")).unwrap(),
            b"dsd two"
        );
    }

    #[tokio::test]
    async fn test_cleanup_and_listing() {
        let fx = fixture(u64::MAX);
        let pair = staged(&fx).await;
        stdfs::create_dir_all(fx.manager.working_root().join("not-staging")).unwrap();

        let pairs = fx.manager.list_staging_pairs().unwrap();
        assert_eq!(pairs, vec![pair.clone()]);

        fx.manager.cleanup_pair(&pair).await.unwrap();
        assert!(!pair.exists());
        assert!(fx.manager.list_staging_pairs().unwrap().is_empty());
        assert!(!fx.manager.cleanup(&pair.source).await.unwrap());

        let outside = StagingPath::parse(fx.root.join("Album_0123456789ab_source")).unwrap();
        assert!(matches!(
            fx.manager.cleanup(&outside).await,
            Err(StagingError::RefusedRemoval(_))
        ));
    }
}
