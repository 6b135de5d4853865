//! provides logging helpers

use std::path::Path;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const DEFAULT_LOG_FILE: &str = "npu-scheduler.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Split a log path into the directory and file prefix the rolling appender wants.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, prefix)
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When `log_path` is given a second, non-ANSI
/// layer writes to a daily rolling file next to it; keep the returned guard
/// alive for as long as logs should be flushed.
pub fn init(log_path: Option<PathBuf>) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_path {
        Some(path) => {
            let (dir, prefix) = split_log_path(&path);
            match RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(&dir)
            {
                Ok(appender) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    let file_layer = layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(env_filter());
                    (Some(file_layer), Some(guard))
                }
                Err(e) => {
                    eprintln!("failed to open log file in {}: {e}", dir.display());
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    registry().with(stderr_layer).with(file_layer).init();
    guard
}
