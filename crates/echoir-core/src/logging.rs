//! Structured logging for hosts embedding the download core.
//!
//! [`init`] installs two layers on a global `tracing` registry: a readable
//! console layer (overridable through `RUST_LOG`) and a JSON layer writing to
//! rolling files. The settings live in [`AppConfig`](crate::config::AppConfig)
//! under `logging`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Crate target used in filter directives.
const CRATE_TARGET: &str = "echoir_core";

/// Verbosity of this crate's events. Dependencies always log at `warn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-part progress.
    Trace,
    /// Stage detail.
    Debug,
    /// Job lifecycle.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// `EnvFilter` directives: dependencies at `warn`, this crate at `self`.
    #[must_use]
    pub fn filter_directives(self) -> String {
        format!("warn,{CRATE_TARGET}={}", self.as_directive())
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log rotation frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// Create a new log file every hour.
    Hourly,
    /// Create a new log file every day.
    Daily,
    /// Never rotate (single log file).
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for log files. `None` uses the platform data folder.
    pub directory: Option<PathBuf>,
    /// Log file name prefix (`echoir` -> `echoir.2024-01-15.log`).
    pub file_prefix: String,
    /// Console verbosity; `RUST_LOG` takes precedence when set.
    pub console_level: LogLevel,
    /// File verbosity.
    pub file_level: LogLevel,
    /// How often to start a new file.
    pub rotation: LogRotation,
    /// Rotated files to keep (0 = keep all).
    pub max_log_files: usize,
    /// Colour codes on the console.
    pub console_ansi: bool,
    /// Log span open/close, which times each download.
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "echoir".to_string(),
            console_level: LogLevel::Info,
            file_level: LogLevel::Debug,
            rotation: LogRotation::Daily,
            max_log_files: 7,
            console_ansi: true,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    /// Verbose settings for debug builds, the defaults otherwise.
    #[must_use]
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            Self {
                console_level: LogLevel::Debug,
                file_level: LogLevel::Trace,
                rotation: LogRotation::Hourly,
                max_log_files: 24,
                span_events: true,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    /// Write log files to `directory`.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Directory log files go to.
    #[must_use]
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_log_directory)
    }

    const fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn file_writer(&self) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
        let directory = self.resolved_directory();
        std::fs::create_dir_all(&directory).map_err(|e| {
            LoggingError::DirectoryCreationFailed {
                path: directory.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut builder = RollingFileAppender::builder()
            .rotation(self.rotation.into())
            .filename_prefix(&self.file_prefix)
            .filename_suffix("log");
        if self.max_log_files > 0 {
            builder = builder.max_log_files(self.max_log_files);
        }
        let appender = builder
            .build(&directory)
            .map_err(|e| LoggingError::AppenderFailed(e.to_string()))?;
        Ok(tracing_appender::non_blocking(appender))
    }

    fn file_layer<S>(&self, writer: NonBlocking) -> impl Layer<S> + Send + Sync + 'static
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(self.span_events())
            .json()
            .with_filter(EnvFilter::new(self.file_level.filter_directives()))
    }

    fn console_layer<S>(&self) -> impl Layer<S> + Send + Sync + 'static
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.console_level.filter_directives()));
        fmt::layer()
            .with_ansi(self.console_ansi)
            .with_target(false)
            .with_span_events(self.span_events())
            .with_filter(filter)
    }
}

/// Keeps the file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

/// Install the global subscriber described by `config`.
///
/// Keep the returned guard for the life of the process.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let (writer, file_guard) = config.file_writer()?;

    tracing_subscriber::registry()
        .with(config.console_layer())
        .with(config.file_layer(writer))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        directory = %config.resolved_directory().display(),
        level = config.file_level.as_directive(),
        "Logging initialized"
    );
    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// [`init`] with [`LoggingConfig::for_build`].
pub fn init_auto() -> Result<LoggingGuard, LoggingError> {
    init(&LoggingConfig::for_build())
}

/// `<data dir>/echoir/logs`.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("echoir")
        .join("logs")
}

/// Errors that can occur during logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Failed to create the log directory.
    #[error("Failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed {
        /// The path that could not be created.
        path: PathBuf,
        /// The reason for the failure.
        reason: String,
    },

    /// The rolling file appender could not be built.
    #[error("Failed to create log file appender: {0}")]
    AppenderFailed(String),

    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}
