//! Logging and observability helpers.

pub mod sensitive;

pub use sensitive::Sensitive;

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "quarry.log";

/// Installs the global subscriber. A second call is a no-op.
pub fn init_tracing(config: &LogConfig) {
    let writer = match &config.directory {
        Some(dir) => {
            let _ = fs::create_dir_all(dir);
            if let Err(e) = cleanup_old_logs(dir, config.retention_days) {
                eprintln!("Failed to clean up old logs: {}", e);
            }
            BoxMakeWriter::new(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let ansi = config.directory.is_none() && !config.json;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_span_events(FmtSpan::CLOSE);

    let installed = if config.json {
        builder
            .json()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_current_span(true)
            .with_span_list(true)
            .try_init()
            .is_ok()
    } else {
        builder.with_target(true).try_init().is_ok()
    };

    if installed {
        tracing::info!(directory = ?config.directory, json = config.json, "Tracing initialized");
    }
}

/// Removes rolled log files older than the retention window.
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > retention) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}
