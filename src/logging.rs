//! Subscriber setup: human-readable stderr plus a size-rotated JSON file
//! under the data directory.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const LOG_FILE_NAME: &str = "waterfall.log";
pub const ENV_MAX_SIZE_BYTES: &str = "WATERFALL_LOG_MAX_SIZE_BYTES";
pub const ENV_MAX_FILES: &str = "WATERFALL_LOG_MAX_FILES";

const DEFAULT_FILTER: &str = "waterfall=info,sqlx=warn";
const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;
const MIN_MAX_SIZE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_size_bytes: usize,
    pub max_files: usize,
}

impl RotationConfig {
    pub fn from_env() -> Self {
        let max_size_bytes = env::var(ENV_MAX_SIZE_BYTES)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .map(|value| value.max(MIN_MAX_SIZE_BYTES))
            .unwrap_or(DEFAULT_MAX_SIZE_BYTES);
        let max_files = env::var(ENV_MAX_FILES)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FILES);
        Self {
            max_size_bytes,
            max_files,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Keep the returned guard alive for the life
/// of the process; dropping it flushes and stops the file writer.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;
    let rotation = RotationConfig::from_env();
    let writer = FileRotate::new(
        log_dir.join(LOG_FILE_NAME),
        AppendCount::new(rotation.max_files),
        ContentLimit::Bytes(rotation.max_size_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let subscriber = Registry::default()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_target(true)
                .with_current_span(false)
                .with_writer(non_blocking),
        );
    tracing::subscriber::set_global_default(subscriber)
        .context("install global tracing subscriber")?;
    // sqlx reports through `log`.
    let _ = tracing_log::LogTracer::init();
    Ok(guard)
}
