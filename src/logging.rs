use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use once_cell::sync::Lazy;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "ledgerbox.log";
const LOG_FILTER_ENV: &str = "LEDGERBOX_LOG";
const DEFAULT_FILTER: &str = "ledgerbox=info";
const MAX_SIZE_ENV: &str = "LEDGERBOX_LOG_MAX_SIZE_BYTES";
const MAX_FILES_ENV: &str = "LEDGERBOX_LOG_MAX_FILES";
const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;

static FILE_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Install the global subscriber: JSON lines on stderr and, when `logs_dir`
/// is given, a size-rotated JSON file sink in that directory.
pub fn init_logging(logs_dir: Option<&Path>) -> anyhow::Result<()> {
    let _ = tracing_log::LogTracer::init();

    let console = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(io::stderr)
        .with_filter(env_filter());

    let file = match logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("create logs directory {}", dir.display()))?;
            let rotating = FileRotate::new(
                dir.join(LOG_FILE_NAME),
                AppendCount::new(env_usize(MAX_FILES_ENV, DEFAULT_MAX_FILES)),
                ContentLimit::Bytes(env_usize(MAX_SIZE_ENV, DEFAULT_MAX_SIZE_BYTES)),
                Compression::None,
                #[cfg(unix)]
                None,
            );
            let (writer, guard) = tracing_appender::non_blocking(rotating);
            *FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_ansi(false)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(writer)
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}

/// Flush and close the file sink. Later events only reach stderr.
pub fn flush_file_logs() {
    let guard = FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_usize_ignores_zero_and_garbage() {
        env::set_var("LEDGERBOX_TEST_USIZE_ZERO", "0");
        env::set_var("LEDGERBOX_TEST_USIZE_BAD", "lots");
        env::set_var("LEDGERBOX_TEST_USIZE_OK", "42");
        assert_eq!(env_usize("LEDGERBOX_TEST_USIZE_ZERO", 7), 7);
        assert_eq!(env_usize("LEDGERBOX_TEST_USIZE_BAD", 7), 7);
        assert_eq!(env_usize("LEDGERBOX_TEST_USIZE_OK", 7), 42);
        assert_eq!(env_usize("LEDGERBOX_TEST_USIZE_UNSET", 7), 7);
    }
}
