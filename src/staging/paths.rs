//! Tagged paths and the staging naming convention.
//!
//! Staging directories are named `<sanitized album>_<fp12>_source` and
//! `<sanitized album>_<fp12>_processed` directly under the working root,
//! so a pair can always be re-derived from an album name and fingerprint.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

const SOURCE_SUFFIX: &str = "_source";
const PROCESSED_SUFFIX: &str = "_processed";
const FINGERPRINT_PREFIX_LEN: usize = 12;
const MAX_SANITIZED_NAME_LEN: usize = 200;

/// Suffix of in-progress archive and output copies.
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix of in-progress restores of an original album.
pub(crate) const RESTORE_SUFFIX: &str = ".restore";

lazy_static! {
    static ref STAGING_NAME_REGEX: Regex = Regex::new(r"^(.+)_([0-9a-f]{12})_(source|processed)$")
        .expect("Invalid staging name regex");
}

/// Location of an album as the user stored it. Only these may be deleted as sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginalPath(PathBuf);

impl OriginalPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Last path component, used as the album name.
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.0.to_string_lossy().to_string())
    }
}

impl AsRef<Path> for OriginalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for OriginalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingKind {
    Source,
    Processed,
}

/// A directory that follows the staging naming convention.
///
/// Can only be built from a conforming name, so cleanup never receives an
/// arbitrary path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagingPath {
    path: PathBuf,
    kind: StagingKind,
}

impl StagingPath {
    /// Tag `path` as a staging directory if its name follows the convention.
    pub fn parse(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?;
        let captures = STAGING_NAME_REGEX.captures(name)?;
        let kind = match &captures[3] {
            "source" => StagingKind::Source,
            _ => StagingKind::Processed,
        };
        Some(Self { path, kind })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> StagingKind {
        self.kind
    }

    /// `<sanitized album>_<fp12>` part of the name.
    pub fn base_name(&self) -> Option<String> {
        let name = self.path.file_name()?.to_str()?;
        let captures = STAGING_NAME_REGEX.captures(name)?;
        Some(format!("{}_{}", &captures[1], &captures[2]))
    }
}

impl AsRef<Path> for StagingPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for StagingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// The source/processed staging directories of one album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPair {
    pub source: StagingPath,
    pub processed: StagingPath,
}

impl StagingPair {
    /// Derive the pair for an album under `working_root`.
    pub fn derive(working_root: &Path, album_name: &str, fingerprint: &str) -> Self {
        Self::from_base(working_root, &staging_base_name(album_name, fingerprint))
    }

    /// Pair for a `<sanitized album>_<fp12>` base name.
    pub(crate) fn from_base(working_root: &Path, base: &str) -> Self {
        Self {
            source: StagingPath {
                path: working_root.join(format!("{}{}", base, SOURCE_SUFFIX)),
                kind: StagingKind::Source,
            },
            processed: StagingPath {
                path: working_root.join(format!("{}{}", base, PROCESSED_SUFFIX)),
                kind: StagingKind::Processed,
            },
        }
    }

    /// Rebuild a pair from paths stored in the ledger.
    pub fn from_paths(source: &Path, processed: &Path) -> Option<Self> {
        let source = StagingPath::parse(source)?;
        let processed = StagingPath::parse(processed)?;
        if source.kind != StagingKind::Source || processed.kind != StagingKind::Processed {
            return None;
        }
        Some(Self { source, processed })
    }

    pub fn exists(&self) -> bool {
        self.source.as_path().is_dir() || self.processed.as_path().is_dir()
    }
}

/// Replace characters that are unsafe in directory names and cap the length.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        return "album".to_string();
    }
    trimmed.chars().take(MAX_SANITIZED_NAME_LEN).collect()
}

pub fn staging_base_name(album_name: &str, fingerprint: &str) -> String {
    let prefix: String = fingerprint
        .chars()
        .take(FINGERPRINT_PREFIX_LEN)
        .collect::<String>()
        .to_lowercase();
    format!("{}_{}", sanitize_name(album_name), prefix)
}

/// True when the final component of `path` follows the staging naming convention.
pub fn looks_like_staging(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| STAGING_NAME_REGEX.is_match(n))
        .unwrap_or(false)
}

/// True for the temporary siblings used while promoting or restoring a directory.
pub fn is_transient_copy(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(PARTIAL_SUFFIX) || n.ends_with(RESTORE_SUFFIX))
        .unwrap_or(false)
}
