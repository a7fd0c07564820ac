//! Tracing initialization.
//!
//! Diagnostics always go to stderr; stdout belongs to the stdio
//! transport's protocol stream. Daemon mode can additionally tee into a
//! daily-rotated file under the configured log directory.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::domain::models::config::LoggingConfig;

/// Guard keeping the non-blocking file writer alive for the process
/// lifetime. Dropping it flushes pending log lines.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize tracing from config. Returns a guard the caller must hold.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false);

    let (file_layer, file_guard) = match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vibeflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer);

    if config.format == "json" {
        registry.with(stderr_layer.json()).try_init()?;
    } else {
        registry.with(stderr_layer).try_init()?;
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
