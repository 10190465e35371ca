//! Logging initialization
//!
//! Logs always go to stderr. Setting `directory` adds a rolling file; the
//! returned [`LoggingGuard`] must then be held until exit so buffered lines
//! are flushed.
//!
//! `RUST_LOG` overrides the configured level when set.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::{self, MakeWriter, writer::MakeWriterExt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// File rotation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl LogRotation {
    fn appender(self, dir: &Path, prefix: &str) -> RollingFileAppender {
        match self {
            Self::Hourly => tracing_appender::rolling::hourly(dir, prefix),
            Self::Daily => tracing_appender::rolling::daily(dir, prefix),
            Self::Never => tracing_appender::rolling::never(dir, prefix),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `authgate=debug,tower_http=info`
    pub level: String,
    pub format: LogFormat,
    /// Also write to rolling files in this directory
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            directory: None,
            file_prefix: "authgate".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

/// Flushes file logs on drop
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

impl LoggingConfig {
    /// Apply `-v`/`-q` from the command line
    ///
    /// One `-v` means debug, two or more trace. `quiet` wins.
    #[must_use]
    pub fn with_verbosity(mut self, verbose: u8, quiet: bool) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => "error",
            (false, 0) => return self,
            (false, 1) => "debug",
            (false, _) => "trace",
        };
        self.level = level.to_string();
        self
    }

    /// Filter from `RUST_LOG`, falling back to `level`
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install the global subscriber
    ///
    /// Returns a guard when file logging is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be created or a global
    /// subscriber is already installed.
    pub fn init(&self) -> io::Result<Option<LoggingGuard>> {
        let Some(dir) = &self.directory else {
            self.install(io::stderr)?;
            return Ok(None);
        };

        std::fs::create_dir_all(dir)?;
        let (file, guard) =
            tracing_appender::non_blocking(self.rotation.appender(dir, &self.file_prefix));
        self.install(file.and(io::stderr))?;

        Ok(Some(LoggingGuard { _file_guard: guard }))
    }

    fn install<W>(&self, writer: W) -> io::Result<()>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::registry().with(self.filter());
        let result = match self.format {
            LogFormat::Json => subscriber
                .with(fmt::layer().json().with_writer(writer))
                .try_init(),
            LogFormat::Pretty => subscriber.with(fmt::layer().with_writer(writer)).try_init(),
        };
        result.map_err(|e| io::Error::other(e.to_string()))
    }
}
