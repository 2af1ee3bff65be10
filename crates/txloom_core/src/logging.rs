//! Process-wide logging bootstrap.
//!
//! # Responsibility
//! - Start the `flexi_logger` backend once per process, writing rotated
//!   files into a directory or plain lines to stderr.
//! - Capture panics as metadata-only log events.
//!
//! # Invariants
//! - Initialization is idempotent for an identical level and target.
//! - A different level or target after initialization is rejected.
//! - Initialization never panics.
//! - Events carry metadata (`key=value`) only; record contents and
//!   encryption keys are never logged.

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LOG_FILE_BASENAME: &str = "txloom";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();
static PANIC_HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Rotating files under an absolute directory.
    Directory(PathBuf),
    Stderr,
}

impl std::fmt::Display for LogTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogTarget::Directory(dir) => write!(f, "{}", dir.display()),
            LogTarget::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unsupported log level `{0}`; expected trace|debug|info|warn|error")]
    UnsupportedLevel(String),
    #[error("log_dir cannot be empty")]
    EmptyDirectory,
    #[error("log_dir must be an absolute path, got `{0}`")]
    RelativeDirectory(String),
    #[error("failed to create log directory `{path}`: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to start logger: {0}")]
    Backend(#[from] flexi_logger::FlexiLoggerError),
    #[error("logging already initialized with {active}; refusing to switch to {requested}")]
    Conflict { active: String, requested: String },
}

struct LoggingState {
    level: &'static str,
    target: LogTarget,
    _logger: LoggerHandle,
}

/// Starts file logging under `log_dir` (absolute).
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), LoggingError> {
    let target = LogTarget::Directory(normalize_log_dir(log_dir)?);
    init_with_target(level, target)
}

/// Starts logging to stderr.
pub fn init_stderr_logging(level: &str) -> Result<(), LoggingError> {
    init_with_target(level, LogTarget::Stderr)
}

fn init_with_target(level: &str, target: LogTarget) -> Result<(), LoggingError> {
    let level = normalize_level(level)?;
    let state = LOGGING_STATE.get_or_try_init(|| start_backend(level, target.clone()))?;
    if state.level != level || state.target != target {
        return Err(LoggingError::Conflict {
            active: format!("level `{}` at `{}`", state.level, state.target),
            requested: format!("level `{level}` at `{target}`"),
        });
    }
    Ok(())
}

fn start_backend(level: &'static str, target: LogTarget) -> Result<LoggingState, LoggingError> {
    let logger = Logger::try_with_str(level)?;
    let logger = match &target {
        LogTarget::Directory(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir.as_path())
                        .basename(LOG_FILE_BASENAME),
                )
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .format_for_files(flexi_logger::detailed_format)
                .start()?
        }
        LogTarget::Stderr => logger
            .log_to_stderr()
            .format(flexi_logger::detailed_format)
            .start()?,
    };

    install_panic_hook_once();
    info!(
        "event=logging_init module=core status=ok level={} target={} version={}",
        level,
        target,
        env!("CARGO_PKG_VERSION")
    );

    Ok(LoggingState {
        level,
        target,
        _logger: logger,
    })
}

/// Active `(level, target)`, or `None` before initialization.
pub fn logging_status() -> Option<(&'static str, LogTarget)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.level, state.target.clone()))
}

/// `debug` in debug builds, `info` in release builds.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn normalize_level(level: &str) -> Result<&'static str, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(LoggingError::UnsupportedLevel(other.to_string())),
    }
}

fn normalize_log_dir(log_dir: &str) -> Result<PathBuf, LoggingError> {
    let trimmed = log_dir.trim();
    if trimmed.is_empty() {
        return Err(LoggingError::EmptyDirectory);
    }
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return Err(LoggingError::RelativeDirectory(trimmed.to_string()));
    }
    Ok(path.to_path_buf())
}

fn install_panic_hook_once() {
    if PANIC_HOOK_INSTALLED.set(()).is_err() {
        return;
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(
            "event=panic_captured module=core status=error location={} payload={}",
            location,
            sanitize_message(&payload, MAX_PANIC_PAYLOAD_CHARS)
        );
        previous_hook(panic_info);
    }));
}

/// Flattens newlines and caps length.
fn sanitize_message(value: &str, max_chars: usize) -> String {
    let normalized = value.replace(['\n', '\r'], " ");
    let mut truncated = normalized.chars().take(max_chars).collect::<String>();
    if normalized.chars().count() > max_chars {
        truncated.push_str("...");
    }
    truncated
}
