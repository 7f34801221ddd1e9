//! Console and rolling-file tracing for the long-running `listen` command.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Flushes the file writer on drop, so it lives for the whole process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const DEFAULT_RETENTION_DAYS: u64 = 30;
const FILE_PREFIX: &str = "tagstream";
const QUIET_TARGETS: [&str; 3] = ["tokio_tungstenite", "tungstenite", "mio"];

/// Install the global subscriber and return the log directory.
///
/// stdout carries rendered messages, so the console layer writes to stderr.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<PathBuf> {
    let dir = config.log_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let retention_days = config.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
    let pruned = prune(&dir, retention_days, SystemTime::now());

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, FILE_PREFIX));
    let _ = FILE_GUARD.set(guard);

    let level = level_override.or(config.level.as_deref());
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    if pruned > 0 {
        tracing::debug!("Removed {} expired log file(s) from {}", pruned, dir.display());
    }
    Ok(dir)
}

/// An explicit level wins over `RUST_LOG`.
fn filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(directives(level)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives("info"))),
    }
}

fn directives(level: &str) -> String {
    std::iter::once(format!("tagstream={level}"))
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Remove our own log files older than `retention_days` as of `now`.
fn prune(dir: &Path, retention_days: u64, now: SystemTime) -> usize {
    let max_age = Duration::from_secs(retention_days * 24 * 60 * 60);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(FILE_PREFIX))
        })
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .filter(|meta| meta.is_file())
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age)
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}
