//! Logging infrastructure for ptyrelay
//!
//! Provides unified logging setup using the tracing ecosystem. The relay
//! owns the local terminal while a session runs, so the default preset
//! writes to a file instead of stderr.

use std::fs::File;
use std::path::PathBuf;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{paths, RelayError, Result};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "PTYRELAY_LOG";

/// Default log file name inside [`paths::log_dir`]
pub const DEFAULT_LOG_FILE: &str = "ptyrelay.log";

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stderr
    Stderr,
    /// Log to file
    File,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output destination
    pub output: LogOutput,
    /// Log level filter (e.g., "info", "ptyrelay_core=trace")
    pub filter: String,
    /// Include file/line in logs
    pub file_line: bool,
    /// Optional custom log file name (defaults to "ptyrelay.log")
    pub file_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "info".into(),
            file_line: false,
            file_name: None,
        }
    }
}

impl LogConfig {
    /// Config for a relay session (file logging, the session owns the terminal)
    pub fn relay() -> Self {
        Self {
            output: LogOutput::File,
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "warn".into()),
            file_line: false,
            file_name: None,
        }
    }

    /// Log to stderr instead of the file, for sessions in cooked mode
    pub fn stderr_output(mut self) -> Self {
        self.output = LogOutput::Stderr;
        self.file_line = true;
        self
    }

    /// Override the filter, keeping everything else
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Full path of the log file this config writes to
    pub fn log_path(&self) -> PathBuf {
        paths::log_dir().join(self.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE))
    }
}

/// Initialize logging with custom configuration
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| RelayError::config(format!("Invalid log filter: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let fmt_layer = if config.file_line {
        fmt_layer.with_file(true).with_line_number(true)
    } else {
        fmt_layer.with_file(false).with_line_number(false)
    };

    match config.output {
        LogOutput::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| RelayError::internal(format!("Failed to init logging: {}", e)))?;
        }
        LogOutput::File => {
            let file = open_log_file(&config)?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(file).with_ansi(false))
                .try_init()
                .map_err(|e| RelayError::internal(format!("Failed to init logging: {}", e)))?;
        }
    }

    Ok(())
}

fn open_log_file(config: &LogConfig) -> Result<File> {
    let log_dir = paths::log_dir();
    paths::ensure_dir(&log_dir).map_err(|e| RelayError::FileWrite {
        path: log_dir.clone(),
        source: e,
    })?;

    let log_path = config.log_path();
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| RelayError::FileWrite {
            path: log_path,
            source: e,
        })
}
