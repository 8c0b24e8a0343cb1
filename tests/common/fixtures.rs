//! Album fixtures written to disk.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// An album directory to create under some root.
pub struct AlbumFixture {
    name: String,
    files: Vec<(PathBuf, Vec<u8>)>,
}

impl AlbumFixture {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            files: Vec::new(),
        }
    }

    /// A DSD track with content unique to this album and path.
    pub fn track(self, relative: &str) -> Self {
        let content = format!("dsd {} {}", self.name, relative).into_bytes();
        self.file(relative, &content)
    }

    pub fn file(mut self, relative: &str, content: &[u8]) -> Self {
        self.files.push((PathBuf::from(relative), content.to_vec()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write the album as `<root>/<name>` and return its path.
    pub fn write(&self, root: &Path) -> PathBuf {
        let album_dir = root.join(&self.name);
        for (relative, content) in &self.files {
            let path = album_dir.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        album_dir
    }
}

/// Number of regular files under `root`, zero if it does not exist.
pub fn count_files(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}
