use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, Local};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

utils::configurable_constants! {

    /// Where logs go.  Unset or empty logs to the console.
    ///
    /// If this path exists as a directory or ends with a /, a new log file is created in that
    /// directory for each process; otherwise it is used as the log file itself.
    ref LOG_DEST : Option<String> = None;

    /// "json" to log json blobs, anything else for human-readable text.  By default, files get
    /// json and the console gets text.
    ref LOG_FORMAT : Option<String> = None;

    /// The base name for log files created in a log directory.  The timestamp and pid are appended.
    ref LOG_PREFIX : String = "media_upload".to_owned();
}

/// Default log levels; override with `RUST_LOG`.
const DEFAULT_LOG_LEVEL_FILE: &str = "info";
const DEFAULT_LOG_LEVEL_CONSOLE: &str = "warn";

#[derive(Clone, Debug, PartialEq)]
pub enum LoggingMode {
    Directory(PathBuf),
    File(PathBuf),
    Console,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub logging_mode: LoggingMode,
    pub use_json: bool,
    pub version: String,
}

impl LoggingConfig {
    /// Builds the config from the `MEDIA_UPLOAD_LOG_*` environment variables.
    pub fn new(version: impl Into<String>) -> Self {
        Self::from_settings(version, LOG_DEST.as_deref(), LOG_FORMAT.as_deref())
    }

    pub fn from_settings(version: impl Into<String>, log_dest: Option<&str>, log_format: Option<&str>) -> Self {
        let logging_mode = match log_dest {
            None | Some("") => LoggingMode::Console,
            Some(dest) => {
                let path = PathBuf::from(dest);

                if dest.ends_with('/') || (cfg!(windows) && dest.ends_with('\\')) || path.is_dir() {
                    LoggingMode::Directory(path)
                } else {
                    LoggingMode::File(path)
                }
            },
        };

        let use_json = match log_format {
            Some(format) => format.trim().eq_ignore_ascii_case("json"),
            None => logging_mode != LoggingMode::Console,
        };

        Self {
            logging_mode,
            use_json,
            version: version.into(),
        }
    }
}

/// Sets up the global tracing subscriber.  Call once, at startup.
pub fn init_logging(cfg: LoggingConfig) {
    let maybe_log_file = match &cfg.logging_mode {
        LoggingMode::Directory(log_dir) => Some(log_file_in_dir(log_dir)),
        LoggingMode::File(path) => Some(path.clone()),
        LoggingMode::Console => None,
    };

    if let Some(log_file) = maybe_log_file {
        // Fall back to the console if the file can't be used.
        if let Err(e) = init_logging_to_file(&log_file, cfg.use_json) {
            init_logging_to_console(cfg.use_json);
            error!("Error logging to file {log_file:?} ({e}); falling back to console logging.");
        }
    } else {
        init_logging_to_console(cfg.use_json);
    }

    info!("{}, media upload progress", cfg.version);
}

fn init_logging_to_console(use_json: bool) {
    let fmt_layer_base = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_file(true)
        .with_target(false);
    let fmt_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL_CONSOLE))
        .unwrap_or_default();

    let registry = tracing_subscriber::registry();

    if use_json {
        registry.with(fmt_layer_base.json().with_filter(fmt_filter)).init();
    } else {
        registry.with(fmt_layer_base.pretty().with_filter(fmt_filter)).init();
    }
}

fn init_logging_to_file(path: &Path, use_json: bool) -> Result<(), std::io::Error> {
    use tracing_appender::{non_blocking, rolling};

    let (path, file_name) = match path.file_name() {
        Some(name) => (path.to_path_buf(), name.to_owned()),
        None => (path.join("media_upload.log"), OsStr::new("media_upload.log").to_owned()),
    };

    let log_directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            parent.to_path_buf()
        },
        _ => PathBuf::from("."),
    };

    // Fail early here, while we can still fall back to the console.
    std::fs::OpenOptions::new().create(true).append(true).open(&path)?;

    let (writer, guard) = non_blocking(rolling::never(log_directory, file_name));

    // The guard flushes on drop; keep it for the life of the process.
    static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
    let _ = FILE_GUARD.set(guard);

    let fmt_layer_base = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_file(true)
        .with_target(false)
        .with_writer(writer);
    let fmt_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL_FILE))
        .unwrap_or_default();

    let registry = tracing_subscriber::registry();

    if use_json {
        registry.with(fmt_layer_base.json().with_filter(fmt_filter)).init();
    } else {
        registry.with(fmt_layer_base.pretty().with_filter(fmt_filter)).init();
    }

    Ok(())
}

/// `<prefix>_<YYYYMMDD>T<HHMMSS><mmm><+/-HHMM>_<pid>.log` in `dir`, in local time.
pub fn log_file_in_dir(dir: impl AsRef<Path>) -> PathBuf {
    let now_local: DateTime<Local> = Local::now();
    let now_fixed: DateTime<FixedOffset> = now_local.with_timezone(now_local.offset());

    let ts = now_fixed.format("%Y%m%dT%H%M%S%3f%z");

    let filename = format!("{}_{}_{}.log", LOG_PREFIX.as_str(), ts, std::process::id());
    dir.as_ref().join(filename)
}

/// Splits a name produced by `log_file_in_dir` into (prefix, timestamp, pid).
pub fn parse_log_file_name(path: impl AsRef<Path>) -> Option<(String, DateTime<FixedOffset>, u32)> {
    let file_name = path.as_ref().file_name()?.to_str()?;
    let file_name = file_name.strip_suffix(".log")?;

    // Split from the right so the prefix may contain underscores.
    let mut parts = file_name.rsplitn(3, '_');
    let pid: u32 = parts.next()?.parse().ok()?;
    let ts = DateTime::parse_from_str(parts.next()?, "%Y%m%dT%H%M%S%3f%z").ok()?;
    let prefix = parts.next()?;

    Some((prefix.to_owned(), ts, pid))
}
