//! Logging initialization for the agent
//!
//! Console output is always on (human-readable or JSON). When a log
//! directory is configured, the same events also go to a daily rolling file.
//! `RUST_LOG` takes precedence over the configured level.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LogSection;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::from(&LogSection::default())
    }
}

impl From<&LogSection> for LoggingConfig {
    fn from(section: &LogSection) -> Self {
        Self {
            level: section.level.clone(),
            json: section.json,
            log_dir: section.dir.as_ref().map(PathBuf::from),
            file_name: section.file_name.clone(),
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Keeps the file writer alive; buffered output is flushed on drop.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = fmt::layer().with_target(true).with_writer(std::io::stderr);
    if config.json {
        layers.push(Box::new(console.json().with_filter(config.filter())));
    } else {
        layers.push(Box::new(console.with_filter(config.filter())));
    }

    let mut file_guard = None;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false);
        if config.json {
            layers.push(Box::new(file.json().with_filter(config.filter())));
        } else {
            layers.push(Box::new(file.with_filter(config.filter())));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if let Some(dir) = &config.log_dir {
        tracing::info!(
            log_dir = %dir.display(),
            file = %config.file_name,
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
