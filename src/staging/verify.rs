//! Copy verification.
//!
//! File count and per-file size are always compared. Files at or below the
//! expensive-analysis limit are also compared by SHA-256 digest, unless the
//! crate is built with the `no_checks` feature.

use super::StagingError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const DIGEST_BUFFER_SIZE: usize = 1024 * 1024;

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub files: usize,
    pub bytes: u64,
    /// Files whose contents were compared by digest.
    pub digested: usize,
}

/// Relative path and size of every file under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<(PathBuf, u64)>, StagingError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| StagingError::VerificationFailed(format!(
                "{:?} escaped root {:?}",
                entry.path(),
                root
            )))?;
        files.push((relative, entry.metadata()?.len()));
    }
    files.sort();
    Ok(files)
}

/// Hex SHA-256 of a whole file, read in chunks.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    digest_prefix(path, u64::MAX)
}

/// Hex SHA-256 of at most the first `limit` bytes of a file.
pub fn digest_prefix(path: &Path, limit: u64) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = file.take(limit);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn content_checks_enabled() -> bool {
    !cfg!(feature = "no_checks")
}

/// Check that `dest_root` holds exactly `expected` (relative paths and sizes
/// of files under `source_root`), with matching contents where affordable.
pub fn verify_files(
    source_root: &Path,
    expected: &[(PathBuf, u64)],
    dest_root: &Path,
    digest_limit: u64,
) -> Result<VerifySummary, StagingError> {
    if !dest_root.is_dir() {
        return Err(StagingError::VerificationFailed(format!(
            "Destination {:?} does not exist",
            dest_root
        )));
    }

    let actual: BTreeMap<PathBuf, u64> = list_files(dest_root)?.into_iter().collect();
    if actual.len() != expected.len() {
        return Err(StagingError::VerificationFailed(format!(
            "File count mismatch for {:?}: expected {}, found {}",
            dest_root,
            expected.len(),
            actual.len()
        )));
    }

    let mut summary = VerifySummary::default();
    for (relative, size) in expected {
        let dest_size = actual.get(relative).ok_or_else(|| {
            StagingError::VerificationFailed(format!(
                "Missing file in {:?}: {:?}",
                dest_root, relative
            ))
        })?;
        if dest_size != size {
            return Err(StagingError::VerificationFailed(format!(
                "Size mismatch for {:?}: expected {}, found {}",
                relative, size, dest_size
            )));
        }
        if content_checks_enabled() && *size <= digest_limit {
            let source_digest = file_digest(&source_root.join(relative))?;
            let dest_digest = file_digest(&dest_root.join(relative))?;
            if source_digest != dest_digest {
                return Err(StagingError::VerificationFailed(format!(
                    "Content mismatch for {:?}",
                    relative
                )));
            }
            summary.digested += 1;
        }
        summary.files += 1;
        summary.bytes += size;
    }

    debug!(
        "Verified {} files ({} digested) in {:?}",
        summary.files, summary.digested, dest_root
    );
    Ok(summary)
}

/// Check that `dest_root` is a faithful copy of the whole tree at `source_root`.
pub fn verify_tree(
    source_root: &Path,
    dest_root: &Path,
    digest_limit: u64,
) -> Result<VerifySummary, StagingError> {
    let expected = list_files(source_root)?;
    verify_files(source_root, &expected, dest_root, digest_limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn trees() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        for root in [&source, &dest] {
            write(root, "01.dsf", b"track one");
            write(root, "art/cover.jpg", b"jpeg");
        }
        (temp, source, dest)
    }

    #[test]
    fn test_identical_trees_verify() {
        let (_temp, source, dest) = trees();
        let summary = verify_tree(&source, &dest, 1024).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 13);
    }

    #[test]
    fn test_missing_file_fails() {
        let (_temp, source, dest) = trees();
        fs::remove_file(dest.join("art/cover.jpg")).unwrap();
        write(&dest, "extra.txt", b"jpeg");
        let err = verify_tree(&source, &dest, 1024).unwrap_err();
        assert!(err.to_string().contains("Missing file"));
    }

    #[test]
    fn test_size_mismatch_fails() {
        let (_temp, source, dest) = trees();
        write(&dest, "01.dsf", b"track");
        let err = verify_tree(&source, &dest, 1024).unwrap_err();
        assert!(err.to_string().contains("Size mismatch"));
    }

    #[cfg(not(feature = "no_checks"))]
    #[test]
    fn test_content_mismatch_fails_below_limit_only() {
        let (_temp, source, dest) = trees();
        write(&dest, "01.dsf", b"track ONE");
        assert!(verify_tree(&source, &dest, 1024).is_err());
        // Above the limit only sizes are compared
        let summary = verify_tree(&source, &dest, 4).unwrap();
        assert_eq!(summary.digested, 0);
    }

    #[test]
    fn test_digest_prefix() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a", b"abcdef");
        write(temp.path(), "b", b"abcxyz");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        assert_eq!(digest_prefix(&a, 3).unwrap(), digest_prefix(&b, 3).unwrap());
        assert_ne!(file_digest(&a).unwrap(), file_digest(&b).unwrap());
    }
}
