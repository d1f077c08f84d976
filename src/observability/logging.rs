//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the process-wide subscriber (supervisor diagnostics)
//! - Open per-server access and error sinks
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Server sinks are owned values, never globals: each wraps its own
//!   `Dispatch` over a non-blocking file writer
//! - Log level configurable via config and `RUST_LOG`

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the process-wide subscriber.
///
/// `RUST_LOG` wins over `default_level`. Safe to call more than once; later
/// calls are ignored.
pub fn init(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("roost={default_level},tower_http={default_level}").into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(io::stderr),
        )
        .try_init();
}

/// Parse a configured level, falling back to `error`.
pub fn level_filter(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::ERROR)
}

/// Append-only log file with its own subscriber.
///
/// Concurrent writers are serialized by the non-blocking worker. Dropping the
/// sink flushes and closes the file.
pub struct LogSink {
    path: PathBuf,
    dispatch: Dispatch,
    _guard: WorkerGuard,
}

impl LogSink {
    /// Sink for error records at or above `level`.
    pub fn error_log(path: &Path, level: &str) -> io::Result<Self> {
        Self::open(path, level_filter(level), true)
    }

    /// Sink for access records: one message line per request.
    pub fn access_log(path: &Path) -> io::Result<Self> {
        Self::open(path, LevelFilter::INFO, false)
    }

    fn open(path: &Path, level: LevelFilter, with_metadata: bool) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .with_max_level(level)
            .with_target(with_metadata)
            .with_level(with_metadata)
            .finish();

        Ok(Self {
            path: path.to_path_buf(),
            dispatch: Dispatch::new(subscriber),
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with this sink as the default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_error() {
        assert_eq!(level_filter("debug"), LevelFilter::DEBUG);
        assert_eq!(level_filter("chatty"), LevelFilter::ERROR);
    }

    #[test]
    fn sink_writes_and_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/error.log");

        let sink = LogSink::error_log(&path, "warn").unwrap();
        sink.in_scope(|| {
            tracing::info!("filtered out");
            tracing::error!(code = 7, "kept");
        });
        drop(sink);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("kept"));
        assert!(content.contains("code=7"));
        assert!(!content.contains("filtered out"));
    }

    #[test]
    fn access_sink_omits_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        let sink = LogSink::access_log(&path).unwrap();
        sink.in_scope(|| tracing::info!("127.0.0.1 GET / HTTP/1.1 200"));
        drop(sink);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("127.0.0.1 GET / HTTP/1.1 200"));
        assert!(!content.contains("INFO"));
    }
}
