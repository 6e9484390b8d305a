// Standard library imports
use std::path::PathBuf;

// Third party imports
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set
    pub level: String,
    /// Directory for the daily rolling log file, stderr only when unset
    pub file_dir: Option<PathBuf>,
    /// File name prefix inside `file_dir`
    pub file_name: String,
    /// Colored stderr output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_name: "floodbot.log".to_string(),
            ansi: true,
        }
    }
}

/// Installs the global tracing subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for the
/// lifetime of the process.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("invalid log filter")?;

    let (file_layer, guard) = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi),
        )
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(guard)
}
