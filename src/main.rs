use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use album_converter::album::{AlbumScanner, FormatPolicy};
use album_converter::audit::{AuditTrail, SqliteAuditStore};
use album_converter::config::{self, AppConfig, ConversionMode};
use album_converter::ledger::{ProcessingStage, ProgressLedger, SqliteProgressLedger, TrackStatus};
use album_converter::pipeline::{AlbumPipeline, BatchRunner};
use album_converter::staging::{FsSpaceMeter, WorkingDirectoryManager};
use album_converter::transcoder::{check_tool_available, CommandExtractor, FfmpegTranscoder};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_mode(s: &str) -> Result<ConversionMode, String> {
    ConversionMode::from_str(s)
        .ok_or_else(|| format!("Unknown mode '{}', expected iso_dsf_to_flac or iso_to_dsf", s))
}

#[derive(Parser, Debug)]
#[clap(version, about = "Convert album collections through a crash-safe staging pipeline")]
struct CliArgs {
    /// Directory holding the albums to convert. Can also be specified in config file.
    #[clap(value_parser = parse_path)]
    pub input_dir: Option<PathBuf>,

    /// Where converted albums are written. Defaults to the input directory (in place).
    #[clap(long, value_parser = parse_path)]
    pub output_dir: Option<PathBuf>,

    /// Where verified copies of the original albums are kept.
    #[clap(long, value_parser = parse_path)]
    pub archive_dir: Option<PathBuf>,

    /// Directory for staging areas and the pause file. Defaults to ./working.
    #[clap(long, value_parser = parse_path)]
    pub working_dir: Option<PathBuf>,

    /// Path to the SQLite progress database. Defaults to <working_dir>/album_converter.db.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Conversion mode: iso_dsf_to_flac (default) or iso_to_dsf.
    #[clap(long, value_parser = parse_mode)]
    pub mode: Option<ConversionMode>,

    /// Output sample rate in Hz for FLAC (88200, 96000, 176400, 192000).
    #[clap(long)]
    pub sample_rate: Option<u32>,

    /// Output bit depth for FLAC (16, 24, 32).
    #[clap(long)]
    pub bit_depth: Option<u32>,

    /// Log the stages each album would go through without touching any album.
    #[clap(long)]
    pub dry_run: bool,

    /// Continue the most recent unfinished session instead of starting a new one.
    #[clap(long)]
    pub resume: bool,

    /// Treat the input directory as a single album.
    #[clap(long)]
    pub single_album: bool,

    /// Ask a running batch to stop after its current album, then exit.
    #[clap(long)]
    pub pause: bool,

    /// Print statistics of the latest session, then exit.
    #[clap(long)]
    pub status: bool,

    /// Log level (trace, debug, info, warn, error). LOG_LEVEL takes precedence.
    #[clap(long)]
    pub logging_level: Option<String>,

    /// Append all log output to this file as well.
    #[clap(long, value_parser = parse_path)]
    pub log_file: Option<PathBuf>,

    /// Append errors to this file as well.
    #[clap(long, value_parser = parse_path)]
    pub error_log_file: Option<PathBuf>,
}

impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            input_dir: args.input_dir.clone(),
            output_dir: args.output_dir.clone(),
            archive_dir: args.archive_dir.clone(),
            working_dir: args.working_dir.clone(),
            db_path: args.db_path.clone(),
            logging_level: args.logging_level.clone(),
            log_file: args.log_file.clone(),
            error_log_file: args.error_log_file.clone(),
            mode: args.mode,
            sample_rate: args.sample_rate,
            bit_depth: args.bit_depth,
            single_album: args.single_album,
            resume: args.resume,
            dry_run: args.dry_run,
        }
    }
}

fn open_log_file(path: &Path) -> Result<Arc<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;
    Ok(Arc::new(file))
}

fn print_status(app_config: &AppConfig) -> Result<()> {
    if !app_config.db_path.exists() {
        println!("No progress database at {:?}", app_config.db_path);
        return Ok(());
    }
    let ledger = SqliteProgressLedger::open(&app_config.db_path)?;
    let Some(session) = ledger.latest_session()? else {
        println!("No sessions recorded yet");
        return Ok(());
    };
    let stats = ledger.session_stats(&session.id)?;

    println!("Session {} ({})", session.id, session.status.as_str());
    println!("  input:   {:?}", session.input_dir);
    println!("  output:  {:?}", session.output_dir);
    println!("  archive: {:?}", session.archive_dir);
    println!("Albums: {}", stats.total_albums);
    for stage in ProcessingStage::ALL {
        let count = stats.albums_in(stage);
        if count > 0 {
            println!("  {:<16} {}", stage.as_str(), count);
        }
    }
    println!("Tracks:");
    for status in [
        TrackStatus::Pending,
        TrackStatus::Converted,
        TrackStatus::Skipped,
        TrackStatus::Failed,
    ] {
        println!("  {:<16} {}", status.as_str(), stats.tracks_in(status));
    }

    let failed: Vec<_> = ledger
        .records_for_session(&session.id)?
        .into_iter()
        .filter(|r| r.stage.is_failure())
        .collect();
    if !failed.is_empty() {
        println!("Failed albums:");
        for record in failed {
            println!(
                "  {:?}: {}",
                record.album_path,
                record.error_message.as_deref().unwrap_or(record.stage.label())
            );
        }
    }

    let staging = WorkingDirectoryManager::new(
        &app_config.working_dir,
        &app_config.archive_dir,
        &app_config.processing,
        Arc::new(FsSpaceMeter),
    );
    let referenced: HashSet<PathBuf> = ledger.referenced_working_paths()?.into_iter().collect();
    let pairs = staging.list_staging_pairs()?;
    println!("Staging pairs on disk: {}", pairs.len());
    for pair in pairs {
        let orphaned = !referenced.contains(pair.source.as_path())
            && !referenced.contains(pair.processed.as_path());
        if orphaned {
            println!("  {} (not referenced by any record)", pair.source);
        } else {
            println!("  {}", pair.source);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let file_config = match &cli_args.config {
        Some(path) => Some(config::FileConfig::load(path)?),
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    let log_file_layer = match &app_config.log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(open_log_file(path)?),
        ),
        None => None,
    };
    let error_log_layer = match &app_config.error_log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(open_log_file(path)?)
                .with_filter(LevelFilter::ERROR),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(log_file_layer)
        .with(error_log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(app_config.logging_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    if cli_args.pause {
        std::fs::create_dir_all(&app_config.working_dir)?;
        std::fs::write(app_config.pause_file_path(), b"")
            .context("Failed to write pause file")?;
        info!(
            "Pause requested via {:?}, the running batch stops after its current album",
            app_config.pause_file_path()
        );
        return Ok(());
    }
    if cli_args.status {
        return print_status(&app_config);
    }

    info!("Configuration loaded:");
    info!("  input_dir: {:?}", app_config.input_dir);
    info!("  output_dir: {:?}", app_config.output_dir);
    info!("  archive_dir: {:?}", app_config.archive_dir);
    info!("  working_dir: {:?}", app_config.working_dir);
    info!("  db_path: {:?}", app_config.db_path);
    info!("  mode: {}", app_config.conversion.mode.as_str());
    if app_config.processing.dry_run {
        info!("Dry run: albums, archive and output are left untouched");
    }

    let conversion = &app_config.conversion;
    let transcoder_check = check_tool_available(&conversion.ffmpeg_path).await;
    match transcoder_check {
        Err(e) if app_config.processing.dry_run => warn!("Transcoder is not usable: {}", e),
        other => other
            .with_context(|| format!("Transcoder {:?} is not usable", conversion.ffmpeg_path))?,
    }
    if let Err(e) = check_tool_available(&conversion.extractor_path).await {
        warn!("Disc images cannot be extracted: {}", e);
    }

    let ledger = Arc::new(SqliteProgressLedger::open(&app_config.db_path)?);
    let audit = Arc::new(AuditTrail::new(Arc::new(SqliteAuditStore::new(&ledger))));

    let staging = WorkingDirectoryManager::new(
        &app_config.working_dir,
        &app_config.archive_dir,
        &app_config.processing,
        Arc::new(FsSpaceMeter),
    );
    staging.init().await?;

    let pipeline = AlbumPipeline::new(
        ledger.clone() as Arc<dyn ProgressLedger>,
        staging,
        Arc::new(FfmpegTranscoder::new(conversion)),
        Arc::new(CommandExtractor::new(conversion)),
        audit.clone(),
        &app_config.processing,
        conversion,
    );

    let mut excluded_roots = vec![
        app_config.working_dir.clone(),
        app_config.archive_dir.clone(),
    ];
    if app_config.output_dir != app_config.input_dir {
        excluded_roots.push(app_config.output_dir.clone());
    }
    let scanner = AlbumScanner::new(FormatPolicy::new(conversion), excluded_roots);

    let runner = BatchRunner::new(
        pipeline,
        scanner,
        audit.clone(),
        app_config.pause_file_path(),
        &app_config.processing,
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping after the current album");
            signal_token.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received second Ctrl+C, exiting now");
            std::process::exit(130);
        }
    });

    let session = runner.open_session(
        &app_config.input_dir,
        &app_config.output_dir,
        &app_config.archive_dir,
        app_config.resume,
    )?;
    let report = runner
        .run(&session, app_config.single_album, &shutdown_token)
        .await?;

    for (path, outcome) in &report.outcomes {
        println!("{}: {}", path.display(), outcome);
    }
    if report.planned() > 0 {
        println!("Dry run: {} albums would be converted", report.planned());
    }
    if report.paused {
        println!(
            "Paused. Run again with --resume to continue session {}",
            report.session_id
        );
    }
    audit.flush()?;
    Ok(())
}
