use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const MAX_LOG_FILES: usize = 10;

pub struct LoggerGuard {
    _stdio_guard: WorkerGuard,
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber: stdout always, plus a non-blocking
/// rolling file appender when `log_file` is set.
pub fn init(log_directives: &str, log_file: Option<&Utf8Path>) -> anyhow::Result<LoggerGuard> {
    let env_filter = EnvFilter::try_new(log_directives).context("invalid log filtering directives")?;

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let (folder, prefix) = match path.parent() {
                Some(parent) if !parent.as_str().is_empty() => {
                    (parent, path.file_name().context("invalid log path (file_name)")?)
                }
                _ => (Utf8Path::new("."), path.as_str()),
            };

            let file_appender = rolling::Builder::new()
                .rotation(rolling::Rotation::DAILY)
                .filename_prefix(prefix)
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(folder.as_std_path())
                .context("couldn’t create file appender")?;

            let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

            (Some(file_layer), Some(file_guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdio_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install the tracing subscriber")?;

    Ok(LoggerGuard {
        _stdio_guard: stdio_guard,
        _file_guard: file_guard,
    })
}
