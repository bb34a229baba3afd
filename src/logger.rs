use dirs::home_dir;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter,
};

pub fn setup_logging(verbose: bool) -> Result<WorkerGuard, io::Error> {
    setup_logging_with_options(verbose, false, None)
}

/// Install the global subscriber.
///
/// Logs always go to the log file. The console layer writes to stderr and is
/// left out entirely in JSON output mode.
pub fn setup_logging_with_options(
    verbose: bool,
    json_output: bool,
    log_file: Option<PathBuf>,
) -> Result<WorkerGuard, io::Error> {
    let log_file = match log_file {
        Some(path) => path,
        None => get_log_file_path()?,
    };

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = build_filter(log_level);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(ChronoLocalTimer)
        .with_filter(env_filter.clone());

    let installed = if json_output {
        let registry = tracing_subscriber::registry().with(file_layer);
        tracing::subscriber::set_global_default(registry).is_ok()
    } else {
        let console_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(true)
            .with_timer(ChronoLocalTimer)
            .with_filter(env_filter);

        let registry = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer);
        tracing::subscriber::set_global_default(registry).is_ok()
    };

    // A subscriber may already be installed (tests, embedding); keep it
    if installed {
        tracing::debug!(log_file = %log_file.display(), "Logging initialized");
    }

    Ok(guard)
}

fn build_filter(level: Level) -> EnvFilter {
    EnvFilter::new(format!(
        "session_sync={},warn",
        level.as_str().to_lowercase()
    ))
}

fn get_log_file_path() -> Result<PathBuf, io::Error> {
    let mut path = home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Could not find home directory"))?;

    path.push(".session-sync.log");
    Ok(path)
}

struct ChronoLocalTimer;

impl FormatTime for ChronoLocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}
