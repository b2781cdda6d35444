//! Logging setup.
//!
//! Stdout carries the protocol, so log lines go to stderr, and optionally
//! also to a daily-rolling file under `--log-dir`. The filter comes from
//! `AI_ENGINE_LOG`, then `RUST_LOG`, then the configured level.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE_PREFIX: &str = "ai-engine.log";

/// Keeps the file writer alive; dropping it flushes buffered lines.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Resolve the filter directive: `AI_ENGINE_LOG`, then `RUST_LOG`, then
/// `default_level`.
pub fn filter_directive(default_level: &str) -> String {
    ["AI_ENGINE_LOG", "RUST_LOG"]
        .iter()
        .find_map(|var| dotenvy::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| default_level.to_string())
}

pub fn init(default_level: &str, log_dir: Option<&Path>) -> Result<LoggingGuard> {
    let directive = filter_directive(default_level);
    let env_filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter {directive:?}"))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(true);

    let (file_layer, file_guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
