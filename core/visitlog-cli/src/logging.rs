//! File logging for the CLI. Stdout carries command output, so logs go to
//! `~/.visitlog/logs/visitlog.log.<date>` instead.

use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEBUG_LOG_ENV: &str = "VISITLOG_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "visitlog.log";

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".visitlog").join("logs"))
}

/// Returns the guard that flushes buffered lines on drop; hold it for the
/// life of the process. Logging is best-effort and silently skipped when the
/// directory cannot be created.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    fs_err::create_dir_all(&dir).ok()?;

    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
