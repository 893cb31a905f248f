//! Relay configuration
//!
//! Read from `~/.config/ptyrelay/config.toml` or an explicit path. Every
//! field is optional.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use ptyrelay_utils::{config_file, RelayError, Result};

use crate::stream::DEFAULT_CHUNK_SIZE;

/// Tunables for a relay session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Bytes moved per read
    pub chunk_size: usize,
    /// Upper bound on one readiness wait; 0 polls without sleeping
    pub poll_interval_ms: u64,
    /// Fail the session when a destination queues more than this
    pub max_pending_bytes: Option<usize>,
    /// Treat larger frames from a multiplexed remote as end-of-stream
    pub max_frame_len: Option<u32>,
    /// Put the local terminal in raw mode
    pub raw: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval_ms: 100,
            max_pending_bytes: None,
            max_frame_len: None,
            raw: true,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| RelayError::config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file; any problem with it is an error
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| RelayError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| RelayError::ConfigInvalid {
            path: path.to_path_buf(),
            message: match e {
                RelayError::Config(message) => message,
                other => other.to_string(),
            },
        })?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from the default location
    ///
    /// Returns defaults if the file doesn't exist or can't be used.
    pub fn load() -> Self {
        let path = config_file();
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RelayError::config("chunk_size must be greater than zero"));
        }
        if self.max_pending_bytes == Some(0) {
            return Err(RelayError::config("max_pending_bytes must be greater than zero"));
        }
        Ok(())
    }
}
