//! Scripted stand-ins for the external tools and the free space meter.

use album_converter::staging::SpaceMeter;
use album_converter::transcoder::{
    check_paths, ContainerExtractor, TranscodeError, TranscodeOutcome, Transcoder,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Writes `FLAC:` followed by the input bytes.
///
/// Failures and hangs are scripted per input file name.
#[derive(Default)]
pub struct ScriptedTranscoder {
    failures: Mutex<HashMap<String, u32>>,
    hangs: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` conversions of `name`.
    pub fn fail(&self, name: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), times);
    }

    /// Never finish converting `name`, like a process killed mid-track.
    pub fn hang_on(&self, name: &str) {
        self.hangs.lock().unwrap().insert(name.to_string());
    }

    pub fn clear_hangs(&self) {
        self.hangs.lock().unwrap().clear();
    }

    /// Input file names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        check_paths(input, output)?;
        let name = file_name(input);
        self.calls.lock().unwrap().push(name.clone());

        let hang = self.hangs.lock().unwrap().contains(&name);
        if hang {
            std::future::pending::<()>().await;
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(TranscodeOutcome::failed(
                        "scripted failure",
                        Duration::ZERO,
                    ));
                }
            }
        }

        let mut content = b"FLAC:".to_vec();
        content.extend(tokio::fs::read(input).await?);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, content).await?;
        Ok(TranscodeOutcome::succeeded(Duration::from_millis(1)))
    }
}

/// Extracts a fixed list of `.dsf` tracks from any disc image.
pub struct ScriptedExtractor {
    tracks: Vec<String>,
    failures: Mutex<u32>,
    calls: Mutex<usize>,
}

impl ScriptedExtractor {
    pub fn new(tracks: &[&str]) -> Self {
        Self {
            tracks: tracks.iter().map(|t| t.to_string()).collect(),
            failures: Mutex::new(0),
            calls: Mutex::new(0),
        }
    }

    /// Fail the next `times` extractions.
    pub fn fail(&self, times: u32) {
        *self.failures.lock().unwrap() = times;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ContainerExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, TranscodeError> {
        check_paths(input, output_dir)?;
        *self.calls.lock().unwrap() += 1;
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TranscodeError::ToolFailed {
                    tool: "scripted-extractor".to_string(),
                    message: "scripted failure".to_string(),
                });
            }
        }

        let image = tokio::fs::read(input).await?;
        tokio::fs::create_dir_all(output_dir).await?;
        let mut extracted = Vec::new();
        for track in &self.tracks {
            let path = output_dir.join(track);
            let mut content = image.clone();
            content.extend_from_slice(track.as_bytes());
            tokio::fs::write(&path, content).await?;
            extracted.push(path);
        }
        Ok(extracted)
    }
}

/// Reports a configurable amount of free space.
pub struct FixedSpace(AtomicU64);

impl FixedSpace {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl SpaceMeter for FixedSpace {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}
