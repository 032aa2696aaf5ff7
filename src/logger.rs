use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Where log lines land. Workers must use [`LogTarget::Stderr`] so stdout
/// stays a clean IPC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Install the global tracing subscriber. `level` is an `EnvFilter`
/// directive (`info`, `faaslet=debug`, ...); `RUST_LOG` overrides it.
/// When `log_dir` is given, a daily-rolling file layer is added alongside
/// the console layer; hold the returned guard for the process lifetime so
/// buffered lines are flushed on exit.
pub fn init(level: &str, target: LogTarget, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = match target {
        LogTarget::Stdout => fmt::layer().with_writer(std::io::stdout).boxed(),
        LogTarget::Stderr => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "faaslet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
