use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::APP_DIR_NAME;

const LOG_FILE: &str = "presence-for-plex.log";
const KEEP_DAYS: u64 = 7;

/// Filter directives for a configured level; `RUST_LOG` wins when set.
fn filter_directives(level: &str) -> String {
    let level = if level.trim().is_empty() { "info" } else { level.trim() };
    format!("{level},hyper=warn,reqwest=warn")
}

pub fn init_logging(level: &str) -> WorkerGuard {
    let log_dir = get_log_directory();

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(level)))
        .unwrap_or_else(|_| EnvFilter::new(filter_directives("info")));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Logging initialized, log directory: {}", log_dir.display());
    tracing::info!("Presence for Plex version: {}", env!("CARGO_PKG_VERSION"));

    cleanup_old_logs(&log_dir, KEEP_DAYS, SystemTime::now());

    guard
}

fn get_log_directory() -> PathBuf {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("logs");

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Failed to create log directory: {}", e);
    }

    log_dir
}

/// Removes rotated log files older than `keep_days`; the live file is never touched.
fn cleanup_old_logs(log_dir: &Path, keep_days: u64, now: SystemTime) -> usize {
    let cutoff = now - Duration::from_secs(keep_days * 24 * 60 * 60);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to read log directory for cleanup: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();

        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.starts_with(LOG_FILE) && name != LOG_FILE => {}
            _ => continue,
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        if modified < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove old log file {:?}: {}", path, e);
            } else {
                tracing::debug!("Removed old log file: {:?}", path);
                removed += 1;
            }
        }
    }
    removed
}
