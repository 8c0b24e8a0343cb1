use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub logging_level: Option<String>,
    pub log_file: Option<String>,
    pub error_log_file: Option<String>,

    // Feature configs
    pub paths: Option<PathsConfig>,
    pub processing: Option<ProcessingConfig>,
    pub conversion: Option<ConversionConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: Option<String>,
    pub output_dir: Option<String>,
    pub archive_dir: Option<String>,
    pub working_dir: Option<String>,
    pub db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    pub cleanup_working_on_success: Option<bool>,
    pub cleanup_working_on_failure: Option<bool>,
    pub resume_from_working: Option<bool>,
    pub remove_source_after_conversion: Option<bool>,
    pub require_output_before_source_removal: Option<bool>,
    pub skip_album_on_error: Option<bool>,
    pub stop_batch_on_failure: Option<bool>,
    pub skip_already_processed: Option<bool>,
    pub max_retries_per_track: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_retry_backoff_ms: Option<u64>,
    pub retry_backoff_multiplier: Option<f64>,
    pub max_file_size_for_expensive_analysis: Option<u64>,
    pub space_safety_margin_bytes: Option<u64>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ConversionConfig {
    pub convertible_extensions: Option<Vec<String>>,
    pub container_extensions: Option<Vec<String>>,
    pub standardizable_extensions: Option<Vec<String>>,
    pub standardization_enabled: Option<bool>,
    /// `iso_dsf_to_flac` or `iso_to_dsf`.
    pub mode: Option<String>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u32>,
    pub compression_level: Option<u32>,
    pub ffmpeg_path: Option<String>,
    pub extractor_path: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
logging_level = "debug"
error_log_file = "/var/log/album-converter/errors.log"

[paths]
archive_dir = "/mnt/archive"
working_dir = "/mnt/scratch"

[processing]
remove_source_after_conversion = true
max_retries_per_track = 5
max_file_size_for_expensive_analysis = 1048576

[conversion]
standardization_enabled = true
convertible_extensions = ["dsf"]
sample_rate = 96000
mode = "iso_to_dsf"
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.logging_level.as_deref(), Some("debug"));
        assert_eq!(
            config.error_log_file.as_deref(),
            Some("/var/log/album-converter/errors.log")
        );
        assert!(config.log_file.is_none());

        let paths = config.paths.unwrap();
        assert_eq!(paths.archive_dir.as_deref(), Some("/mnt/archive"));
        assert!(paths.output_dir.is_none());

        let processing = config.processing.unwrap();
        assert_eq!(processing.remove_source_after_conversion, Some(true));
        assert_eq!(processing.max_retries_per_track, Some(5));
        assert_eq!(processing.max_file_size_for_expensive_analysis, Some(1048576));
        assert!(processing.skip_album_on_error.is_none());

        let conversion = config.conversion.unwrap();
        assert_eq!(conversion.standardization_enabled, Some(true));
        assert_eq!(conversion.convertible_extensions, Some(vec!["dsf".to_string()]));
        assert_eq!(conversion.sample_rate, Some(96000));
        assert_eq!(conversion.mode.as_deref(), Some("iso_to_dsf"));
    }

    #[test]
    fn test_load_empty_config() {
        let file = NamedTempFile::new().unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert!(config.paths.is_none());
        assert!(config.processing.is_none());
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[processing\nmax_retries_per_track = ").unwrap();
        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = FileConfig::load(Path::new("/nonexistent/album-converter.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
