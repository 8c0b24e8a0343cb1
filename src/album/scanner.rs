//! Album discovery.
//!
//! A directory that directly contains music files is an album root and
//! owns its whole subtree. Disc folders (`CD1`, `Disc 2`, ...) roll up
//! into their parent.

use super::models::{AlbumUnit, FormatPolicy, MediaFile};
use crate::staging::{is_transient_copy, looks_like_staging, OriginalPath};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

lazy_static! {
    static ref DISC_FOLDER_REGEX: Regex =
        Regex::new(r"(?i)^(cd|disc|disk)\s*\d+$").expect("Invalid disc folder regex");
}

#[derive(Debug, Error)]
pub enum AlbumScanError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub struct AlbumScanner {
    policy: FormatPolicy,
    /// Roots owned by the pipeline (staging, archive) that are never scanned.
    excluded_roots: Vec<PathBuf>,
}

impl AlbumScanner {
    pub fn new(policy: FormatPolicy, excluded_roots: Vec<PathBuf>) -> Self {
        Self {
            policy,
            excluded_roots,
        }
    }

    pub fn policy(&self) -> &FormatPolicy {
        &self.policy
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.excluded_roots.iter().any(|root| path.starts_with(root)) {
            return true;
        }
        looks_like_staging(path) || is_transient_copy(path)
    }

    fn is_disc_folder(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| DISC_FOLDER_REGEX.is_match(n.trim()))
            .unwrap_or(false)
    }

    fn directly_contains_music(&self, dir: &Path) -> Result<bool, AlbumScanError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && self.policy.is_music(&entry.path()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_album_root(&self, dir: &Path) -> Result<bool, AlbumScanError> {
        if self.directly_contains_music(dir)? {
            return Ok(true);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir()
                && Self::is_disc_folder(&path)
                && self.directly_contains_music(&path)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn check_dir(path: &Path) -> Result<(), AlbumScanError> {
        if !path.exists() {
            return Err(AlbumScanError::PathNotFound(path.to_path_buf()));
        }
        if !path.is_dir() {
            return Err(AlbumScanError::NotADirectory(path.to_path_buf()));
        }
        Ok(())
    }

    /// Find every album under `input_dir`, sorted by path.
    pub fn scan(&self, input_dir: &Path) -> Result<Vec<AlbumUnit>, AlbumScanError> {
        Self::check_dir(input_dir)?;

        let mut roots = Vec::new();
        let mut walker = WalkDir::new(input_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if entry.depth() > 0 && self.is_excluded(path) {
                debug!("Skipping pipeline-owned directory {:?}", path);
                walker.skip_current_dir();
                continue;
            }
            if self.is_album_root(path)? {
                roots.push(path.to_path_buf());
                walker.skip_current_dir();
            }
        }

        let mut albums = Vec::with_capacity(roots.len());
        for root in roots {
            albums.push(self.load_album(&root)?);
        }
        debug!("Discovered {} albums under {:?}", albums.len(), input_dir);
        Ok(albums)
    }

    /// Load `root` as a single album.
    pub fn load_album(&self, root: &Path) -> Result<AlbumUnit, AlbumScanError> {
        Self::check_dir(root)?;

        let mut files = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_excluded(e.path()));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative_path = entry
                .path()
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(entry.file_name()));
            files.push(MediaFile {
                class: self.policy.classify(entry.path()),
                size: entry.metadata()?.len(),
                relative_path,
            });
        }
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let root = OriginalPath::new(root);
        Ok(AlbumUnit {
            name: root.name(),
            root,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::FileClass;
    use crate::config::ConversionSettings;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn scanner(excluded: Vec<PathBuf>) -> AlbumScanner {
        AlbumScanner::new(FormatPolicy::new(&ConversionSettings::default()), excluded)
    }

    #[test]
    fn test_scan_finds_album_roots() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("Artist/Album A/01.dsf"), b"aa");
        touch(&root.join("Artist/Album A/cover.jpg"), b"img");
        touch(&root.join("Artist/Album A/scans/back.jpg"), b"img");
        touch(&root.join("Album B/01.dff"), b"bb");
        touch(&root.join("Notes/readme.txt"), b"txt");

        let albums = scanner(vec![]).scan(root).unwrap();
        let names: Vec<_> = albums.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Album B", "Album A"]);

        let album_a = &albums[1];
        assert_eq!(album_a.files.len(), 3);
        assert_eq!(album_a.files_of(FileClass::Convert).count(), 1);
        assert!(album_a
            .files
            .iter()
            .any(|f| f.relative_path == Path::new("scans/back.jpg")));
    }

    #[test]
    fn test_disc_folders_roll_up_to_parent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("Box Set/CD1/01.dsf"), b"1");
        touch(&root.join("Box Set/Disc 2/01.dsf"), b"2");
        touch(&root.join("Box Set/booklet.pdf"), b"pdf");

        let albums = scanner(vec![]).scan(root).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].name, "Box Set");
        assert_eq!(albums[0].tracks().count(), 2);
    }

    #[test]
    fn test_scan_skips_pipeline_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(&root.join("Album/01.dsf"), b"1");
        touch(&root.join("working/Album_0123456789ab_source/01.dsf"), b"1");
        touch(&root.join("Album_0123456789ab_processed/01.flac"), b"1");
        touch(&root.join("archive/Album_20240101_000000/01.dsf"), b"1");
        touch(&root.join("Other.partial/01.flac"), b"1");

        let albums = scanner(vec![root.join("working"), root.join("archive")])
            .scan(root)
            .unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].name, "Album");
    }

    #[test]
    fn test_input_dir_with_music_is_single_album() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("01.dsf"), b"1");
        touch(&temp.path().join("Bonus/02.dsf"), b"2");
        let albums = scanner(vec![]).scan(temp.path()).unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].tracks().count(), 2);
    }

    #[test]
    fn test_scan_missing_dir_fails() {
        let temp = TempDir::new().unwrap();
        let result = scanner(vec![]).scan(&temp.path().join("missing"));
        assert!(matches!(result, Err(AlbumScanError::PathNotFound(_))));
    }
}
