mod file_config;

pub use file_config::{ConversionConfig, FileConfig, PathsConfig, ProcessingConfig};

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Name of the control file that pauses a running batch at the next album boundary.
pub const PAUSE_FILE_NAME: &str = "PAUSE";

/// Default ledger database file name, placed in the working directory.
pub const DEFAULT_DB_FILE_NAME: &str = "album_converter.db";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub logging_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub error_log_file: Option<PathBuf>,
    pub mode: Option<ConversionMode>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u32>,
    pub single_album: bool,
    pub resume: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub working_dir: PathBuf,
    pub db_path: PathBuf,
    pub logging_level: LevelFilter,
    /// Every log line is appended here as well.
    pub log_file: Option<PathBuf>,
    /// Errors only.
    pub error_log_file: Option<PathBuf>,
    pub single_album: bool,
    pub resume: bool,

    // Feature configs (with defaults)
    pub processing: ProcessingSettings,
    pub conversion: ConversionSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();
        let paths = file.paths.unwrap_or_default();

        let input_dir = paths
            .input_dir
            .map(PathBuf::from)
            .or_else(|| cli.input_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("input_dir must be specified on the command line or in config file")
            })?;
        if !input_dir.exists() {
            bail!("Input directory does not exist: {:?}", input_dir);
        }
        if !input_dir.is_dir() {
            bail!("input_dir is not a directory: {:?}", input_dir);
        }

        let archive_dir = paths
            .archive_dir
            .map(PathBuf::from)
            .or_else(|| cli.archive_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("archive_dir must be specified via --archive-dir or in config file")
            })?;

        // Converted albums replace the originals in place unless told otherwise
        let output_dir = paths
            .output_dir
            .map(PathBuf::from)
            .or_else(|| cli.output_dir.clone())
            .unwrap_or_else(|| input_dir.clone());

        let working_dir = paths
            .working_dir
            .map(PathBuf::from)
            .or_else(|| cli.working_dir.clone())
            .map(Ok)
            .unwrap_or_else(|| std::env::current_dir().map(|cwd| cwd.join("working")))?;

        let db_path = paths
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .unwrap_or_else(|| working_dir.join(DEFAULT_DB_FILE_NAME));

        for (name, path) in [
            ("output_dir", &output_dir),
            ("archive_dir", &archive_dir),
            ("working_dir", &working_dir),
            ("db_path", &db_path),
        ] {
            if !path.is_absolute() {
                bail!("{} must be an absolute path, got {:?}", name, path);
            }
        }
        if !input_dir.is_absolute() {
            bail!("input_dir must be an absolute path, got {:?}", input_dir);
        }

        if archive_dir.starts_with(&working_dir) {
            bail!(
                "archive_dir {:?} must not live inside working_dir {:?}",
                archive_dir,
                working_dir
            );
        }
        if output_dir.starts_with(&working_dir) {
            bail!(
                "output_dir {:?} must not live inside working_dir {:?}",
                output_dir,
                working_dir
            );
        }
        if archive_dir == input_dir || archive_dir == output_dir {
            bail!("archive_dir must differ from input_dir and output_dir");
        }

        let logging_level = match file.logging_level.or_else(|| cli.logging_level.clone()) {
            Some(level) => parse_logging_level(&level)
                .ok_or_else(|| anyhow::anyhow!("Invalid logging level: {}", level))?,
            None => LevelFilter::INFO,
        };
        let log_file = file
            .log_file
            .map(PathBuf::from)
            .or_else(|| cli.log_file.clone());
        let error_log_file = file
            .error_log_file
            .map(PathBuf::from)
            .or_else(|| cli.error_log_file.clone());

        let defaults = ProcessingSettings::default();
        let pf = file.processing.unwrap_or_default();
        let processing = ProcessingSettings {
            cleanup_working_on_success: pf
                .cleanup_working_on_success
                .unwrap_or(defaults.cleanup_working_on_success),
            cleanup_working_on_failure: pf
                .cleanup_working_on_failure
                .unwrap_or(defaults.cleanup_working_on_failure),
            resume_from_working: pf
                .resume_from_working
                .unwrap_or(defaults.resume_from_working),
            remove_source_after_conversion: pf
                .remove_source_after_conversion
                .unwrap_or(defaults.remove_source_after_conversion),
            require_output_before_source_removal: pf
                .require_output_before_source_removal
                .unwrap_or(defaults.require_output_before_source_removal),
            skip_album_on_error: pf
                .skip_album_on_error
                .unwrap_or(defaults.skip_album_on_error),
            stop_batch_on_failure: pf
                .stop_batch_on_failure
                .unwrap_or(defaults.stop_batch_on_failure),
            skip_already_processed: pf
                .skip_already_processed
                .unwrap_or(defaults.skip_already_processed),
            max_retries_per_track: pf
                .max_retries_per_track
                .unwrap_or(defaults.max_retries_per_track),
            retry_backoff_ms: pf.retry_backoff_ms.unwrap_or(defaults.retry_backoff_ms),
            max_retry_backoff_ms: pf
                .max_retry_backoff_ms
                .unwrap_or(defaults.max_retry_backoff_ms),
            retry_backoff_multiplier: pf
                .retry_backoff_multiplier
                .unwrap_or(defaults.retry_backoff_multiplier),
            max_file_size_for_expensive_analysis: pf
                .max_file_size_for_expensive_analysis
                .unwrap_or(defaults.max_file_size_for_expensive_analysis),
            space_safety_margin_bytes: pf
                .space_safety_margin_bytes
                .unwrap_or(defaults.space_safety_margin_bytes),
            dry_run: pf.dry_run.unwrap_or(cli.dry_run),
        };
        if processing.max_retries_per_track == 0 {
            bail!("max_retries_per_track must be at least 1");
        }
        if processing.retry_backoff_multiplier < 1.0 {
            bail!("retry_backoff_multiplier must be >= 1.0");
        }

        let defaults = ConversionSettings::default();
        let cf = file.conversion.unwrap_or_default();
        let mode = match cf.mode {
            Some(mode) => ConversionMode::from_str(&mode).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid conversion mode: {}. Must be one of iso_dsf_to_flac, iso_to_dsf",
                    mode
                )
            })?,
            None => cli.mode.unwrap_or(defaults.mode),
        };
        let conversion = ConversionSettings {
            convertible_extensions: cf
                .convertible_extensions
                .map(normalize_extensions)
                .unwrap_or(defaults.convertible_extensions),
            container_extensions: cf
                .container_extensions
                .map(normalize_extensions)
                .unwrap_or(defaults.container_extensions),
            standardizable_extensions: cf
                .standardizable_extensions
                .map(normalize_extensions)
                .unwrap_or(defaults.standardizable_extensions),
            standardization_enabled: cf
                .standardization_enabled
                .unwrap_or(defaults.standardization_enabled),
            mode,
            sample_rate: cf
                .sample_rate
                .or(cli.sample_rate)
                .unwrap_or(defaults.sample_rate),
            bit_depth: cf.bit_depth.or(cli.bit_depth).unwrap_or(defaults.bit_depth),
            compression_level: cf.compression_level.unwrap_or(defaults.compression_level),
            ffmpeg_path: cf.ffmpeg_path.unwrap_or(defaults.ffmpeg_path),
            extractor_path: cf.extractor_path.unwrap_or(defaults.extractor_path),
        };
        if ![16, 24, 32].contains(&conversion.bit_depth) {
            bail!(
                "Invalid bit depth: {}. Must be one of 16, 24, 32",
                conversion.bit_depth
            );
        }
        if !SAMPLE_RATES.contains(&conversion.sample_rate) {
            bail!(
                "Invalid sample rate: {}. Must be one of {:?}",
                conversion.sample_rate,
                SAMPLE_RATES
            );
        }

        Ok(AppConfig {
            input_dir,
            output_dir,
            archive_dir,
            working_dir,
            db_path,
            logging_level,
            log_file,
            error_log_file,
            single_album: cli.single_album,
            resume: cli.resume,
            processing,
            conversion,
        })
    }

    /// Control file checked between albums.
    pub fn pause_file_path(&self) -> PathBuf {
        pause_file_path(&self.working_dir)
    }
}

pub fn pause_file_path(working_dir: &Path) -> PathBuf {
    working_dir.join(PAUSE_FILE_NAME)
}

/// Behavior of the album pipeline.
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub cleanup_working_on_success: bool,
    pub cleanup_working_on_failure: bool,
    pub resume_from_working: bool,
    pub remove_source_after_conversion: bool,
    /// Source removal waits for a verified output unless this is false.
    pub require_output_before_source_removal: bool,
    /// Abort an album at its first permanently failed track.
    pub skip_album_on_error: bool,
    /// Stop the whole batch after the first failed album.
    pub stop_batch_on_failure: bool,
    pub skip_already_processed: bool,
    pub max_retries_per_track: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub retry_backoff_multiplier: f64,
    /// Files above this size are fingerprinted partially and verified by size only.
    pub max_file_size_for_expensive_analysis: u64,
    pub space_safety_margin_bytes: u64,
    /// Log the stages each album would go through without touching any file.
    pub dry_run: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            cleanup_working_on_success: true,
            cleanup_working_on_failure: false,
            resume_from_working: true,
            remove_source_after_conversion: false,
            require_output_before_source_removal: true,
            skip_album_on_error: true,
            stop_batch_on_failure: false,
            skip_already_processed: true,
            max_retries_per_track: 3,
            retry_backoff_ms: 500,
            max_retry_backoff_ms: 10_000,
            retry_backoff_multiplier: 2.0,
            max_file_size_for_expensive_analysis: 100 * 1024 * 1024, // 100 MiB
            space_safety_margin_bytes: 5 * 1024 * 1024 * 1024,      // 5 GiB
            dry_run: false,
        }
    }
}

/// Format policy and external tool settings.
#[derive(Debug, Clone)]
pub struct ConversionSettings {
    /// Lowercase extensions without the dot.
    pub convertible_extensions: Vec<String>,
    pub container_extensions: Vec<String>,
    /// Formats that are only re-encoded when standardization is enabled.
    pub standardizable_extensions: Vec<String>,
    pub standardization_enabled: bool,
    pub mode: ConversionMode,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub compression_level: u32,
    pub ffmpeg_path: String,
    pub extractor_path: String,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            convertible_extensions: vec!["dsf".to_string(), "dff".to_string()],
            container_extensions: vec!["iso".to_string()],
            standardizable_extensions: vec!["flac".to_string(), "wav".to_string()],
            standardization_enabled: false,
            mode: ConversionMode::default(),
            sample_rate: 88200,
            bit_depth: 24,
            compression_level: 8,
            ffmpeg_path: "ffmpeg".to_string(),
            extractor_path: "sacd_extract".to_string(),
        }
    }
}

impl ConversionSettings {
    /// Extension of converted tracks, without the dot.
    pub fn output_extension(&self) -> &'static str {
        self.mode.output_extension()
    }
}

/// Sample rates accepted for PCM output, in Hz.
pub const SAMPLE_RATES: [u32; 4] = [88200, 96000, 176400, 192000];

/// Target format of a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversionMode {
    /// Disc images and DSD tracks become FLAC.
    #[default]
    IsoDsfToFlac,
    /// Disc images are split into DSF tracks. Loose DSD tracks are kept as they are.
    IsoToDsf,
}

impl ConversionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionMode::IsoDsfToFlac => "iso_dsf_to_flac",
            ConversionMode::IsoToDsf => "iso_to_dsf",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "iso_dsf_to_flac" => Some(ConversionMode::IsoDsfToFlac),
            "iso_to_dsf" => Some(ConversionMode::IsoToDsf),
            _ => None,
        }
    }

    pub fn output_extension(&self) -> &'static str {
        match self {
            ConversionMode::IsoDsfToFlac => "flac",
            ConversionMode::IsoToDsf => "dsf",
        }
    }

    /// Whether loose tracks in the convertible formats are transcoded.
    pub fn converts_loose_tracks(&self) -> bool {
        matches!(self, ConversionMode::IsoDsfToFlac)
    }
}

fn normalize_extensions(extensions: Vec<String>) -> Vec<String> {
    extensions
        .into_iter()
        .map(|ext| ext.trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

/// Parses a logging level string ("info", "DEBUG", "warn", ...).
fn parse_logging_level(s: &str) -> Option<LevelFilter> {
    let s = match s.to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    };
    LevelFilter::from_str(&s).ok()
}
