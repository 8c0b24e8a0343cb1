//! Transcoding and extraction through external command line tools.

use super::{check_paths, ContainerExtractor, TranscodeError, TranscodeOutcome, Transcoder};
use crate::config::{ConversionMode, ConversionSettings};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// Maximum stderr characters kept in failure messages.
const MAX_MESSAGE_LEN: usize = 2000;

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(MAX_MESSAGE_LEN);
    text.chars().skip(skip).collect()
}

/// Converts tracks to FLAC or DSF with ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    mode: ConversionMode,
    sample_rate: u32,
    bit_depth: u32,
    compression_level: u32,
}

impl FfmpegTranscoder {
    pub fn new(settings: &ConversionSettings) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            mode: settings.mode,
            sample_rate: settings.sample_rate,
            bit_depth: settings.bit_depth,
            compression_level: settings.compression_level,
        }
    }

    fn codec_args(&self) -> Vec<String> {
        match self.mode {
            ConversionMode::IsoDsfToFlac => vec![
                "-sample_fmt".to_string(),
                format!("s{}", if self.bit_depth > 16 { 32 } else { 16 }),
                "-bits_per_raw_sample".to_string(),
                self.bit_depth.to_string(),
                "-ar".to_string(),
                self.sample_rate.to_string(),
                "-c:a".to_string(),
                "flac".to_string(),
                "-compression_level".to_string(),
                self.compression_level.to_string(),
            ],
            ConversionMode::IsoToDsf => vec!["-c:a".to_string(), "dsd_lsbf_planar".to_string()],
        }
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
        ];
        args.extend(self.codec_args());
        args.extend([
            "-map_metadata".to_string(),
            "0".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        check_paths(input, output)?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        debug!("ffmpeg {:?} -> {:?}", input, output);
        let result = Command::new(&self.ffmpeg_path)
            .args(self.args(input, output))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            return Ok(TranscodeOutcome::failed(
                format!("ffmpeg exited with {}: {}", result.status, tail(&result.stderr)),
                started.elapsed(),
            ));
        }
        if !output.exists() {
            return Ok(TranscodeOutcome::failed(
                "ffmpeg reported success but produced no output",
                started.elapsed(),
            ));
        }
        Ok(TranscodeOutcome::succeeded(started.elapsed()))
    }
}

/// Extracts DSD tracks from SACD images with an external extractor.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    extractor_path: String,
    track_extensions: Vec<String>,
}

impl CommandExtractor {
    pub fn new(settings: &ConversionSettings) -> Self {
        Self {
            extractor_path: settings.extractor_path.clone(),
            track_extensions: settings.convertible_extensions.clone(),
        }
    }

    fn collect_tracks(&self, output_dir: &Path) -> Result<Vec<PathBuf>, TranscodeError> {
        let mut tracks = Vec::new();
        for entry in walkdir::WalkDir::new(output_dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            if ext.is_some_and(|ext| self.track_extensions.contains(&ext)) {
                tracks.push(entry.into_path());
            }
        }
        Ok(tracks)
    }
}

#[async_trait]
impl ContainerExtractor for CommandExtractor {
    async fn extract(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, TranscodeError> {
        check_paths(input, output_dir)?;
        tokio::fs::create_dir_all(output_dir).await?;

        debug!("Extracting {:?} into {:?}", input, output_dir);
        let result = Command::new(&self.extractor_path)
            .arg("-2")
            .arg("-s")
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            return Err(TranscodeError::ToolFailed {
                tool: self.extractor_path.clone(),
                message: tail(&result.stderr),
            });
        }
        let tracks = self.collect_tracks(output_dir)?;
        if tracks.is_empty() {
            return Err(TranscodeError::ToolFailed {
                tool: self.extractor_path.clone(),
                message: format!("no tracks extracted from {:?}", input),
            });
        }
        Ok(tracks)
    }
}

/// Check that a tool can be spawned.
pub async fn check_tool_available(tool: &str) -> Result<(), TranscodeError> {
    let status = Command::new(tool)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(TranscodeError::ToolFailed {
            tool: tool.to_string(),
            message: format!("exited with {}", status),
        }),
        Err(e) => Err(TranscodeError::ToolFailed {
            tool: tool.to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_args() {
        let transcoder = FfmpegTranscoder::new(&ConversionSettings::default());
        let args = transcoder.args(Path::new("/in/01.dsf"), Path::new("/out/01.flac"));
        assert_eq!(args[2], "/in/01.dsf");
        assert_eq!(args.last().unwrap(), "/out/01.flac");
        let joined = args.join(" ");
        assert!(joined.contains("-ar 88200"));
        assert!(joined.contains("-sample_fmt s32 -bits_per_raw_sample 24"));
        assert!(joined.contains("-compression_level 8"));
        assert!(joined.contains("-c:a flac"));
    }

    #[test]
    fn test_ffmpeg_args_for_dsf_output() {
        let transcoder = FfmpegTranscoder::new(&ConversionSettings {
            mode: ConversionMode::IsoToDsf,
            ..Default::default()
        });
        let args = transcoder.args(Path::new("/in/01.dsf"), Path::new("/out/01.dsf"));
        let joined = args.join(" ");
        assert!(joined.contains("-c:a dsd_lsbf_planar"));
        assert!(!joined.contains("-ar "));
        assert!(!joined.contains("flac"));
        assert_eq!(args.last().unwrap(), "/out/01.dsf");
    }

    #[test]
    fn test_tail_keeps_end_of_output() {
        let long = "x".repeat(MAX_MESSAGE_LEN) + "the real error";
        assert!(tail(long.as_bytes()).ends_with("the real error"));
        assert_eq!(tail(long.as_bytes()).chars().count(), MAX_MESSAGE_LEN);
    }

    #[tokio::test]
    async fn test_relative_paths_never_reach_the_tool() {
        let transcoder = FfmpegTranscoder::new(&ConversionSettings {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ..Default::default()
        });
        let err = transcoder
            .transcode(Path::new("in.dsf"), Path::new("/tmp/out.flac"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::NonAbsolutePath(_)));
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let result = check_tool_available("/nonexistent/ffmpeg").await;
        assert!(matches!(result, Err(TranscodeError::ToolFailed { .. })));
    }
}
