use crate::config::{ConversionMode, ConversionSettings};
use crate::staging::OriginalPath;
use std::path::{Path, PathBuf};

/// How a file inside an album is handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileClass {
    /// Transcoded into the output format.
    Convert,
    /// Disc image whose tracks are extracted before conversion.
    Extract,
    /// Audio format whose conversion is disabled; copied through unchanged.
    Disabled,
    /// Artwork, documents and anything else; copied through unchanged.
    Passthrough,
}

impl FileClass {
    /// Files tracked per-track in the ledger.
    pub fn is_track(&self) -> bool {
        !matches!(self, FileClass::Passthrough)
    }

    pub fn needs_conversion(&self) -> bool {
        matches!(self, FileClass::Convert | FileClass::Extract)
    }
}

/// Extension based classification of album files.
#[derive(Debug, Clone)]
pub struct FormatPolicy {
    convertible: Vec<String>,
    containers: Vec<String>,
    standardizable: Vec<String>,
    standardization_enabled: bool,
    mode: ConversionMode,
}

impl FormatPolicy {
    pub fn new(settings: &ConversionSettings) -> Self {
        Self {
            convertible: settings.convertible_extensions.clone(),
            containers: settings.container_extensions.clone(),
            standardizable: settings.standardizable_extensions.clone(),
            standardization_enabled: settings.standardization_enabled,
            mode: settings.mode,
        }
    }

    fn extension(path: &Path) -> Option<String> {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }

    pub fn classify(&self, path: &Path) -> FileClass {
        let Some(ext) = Self::extension(path) else {
            return FileClass::Passthrough;
        };
        if self.containers.contains(&ext) {
            FileClass::Extract
        } else if self.convertible.contains(&ext) {
            if self.mode.converts_loose_tracks() {
                FileClass::Convert
            } else {
                FileClass::Disabled
            }
        } else if self.standardizable.contains(&ext) {
            if self.standardization_enabled && self.mode.converts_loose_tracks() {
                FileClass::Convert
            } else {
                FileClass::Disabled
            }
        } else {
            FileClass::Passthrough
        }
    }

    /// Why a `Disabled` track is copied through instead of converted.
    pub fn disabled_reason(&self, path: &Path) -> String {
        let standardizable =
            Self::extension(path).is_some_and(|e| self.standardizable.contains(&e));
        if standardizable && !self.standardization_enabled {
            "standardization disabled".to_string()
        } else {
            format!("not converted in {} mode", self.mode.as_str())
        }
    }

    /// Whether a file marks its directory as holding music, regardless of policy.
    pub fn is_music(&self, path: &Path) -> bool {
        self.classify(path).is_track()
    }
}

/// A file belonging to an album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    /// Path relative to the album root.
    pub relative_path: PathBuf,
    pub size: u64,
    pub class: FileClass,
}

/// A directory subtree discovered as one album. Never mutated by the pipeline.
#[derive(Debug, Clone)]
pub struct AlbumUnit {
    pub root: OriginalPath,
    pub name: String,
    /// All files in the subtree, sorted by relative path.
    pub files: Vec<MediaFile>,
}

impl AlbumUnit {
    pub fn path(&self) -> &Path {
        self.root.as_path()
    }

    pub fn absolute(&self, file: &MediaFile) -> PathBuf {
        self.root.as_path().join(&file.relative_path)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaFile> {
        self.files.iter().filter(|f| f.class.is_track())
    }

    pub fn files_of(&self, class: FileClass) -> impl Iterator<Item = &MediaFile> {
        self.files.iter().filter(move |f| f.class == class)
    }

    /// False when nothing in the album would be converted under the current policy.
    pub fn has_convertible_content(&self) -> bool {
        self.files.iter().any(|f| f.class.needs_conversion())
    }

    pub fn has_container(&self) -> bool {
        self.files.iter().any(|f| f.class == FileClass::Extract)
    }
}
