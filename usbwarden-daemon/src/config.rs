//! Daemon configuration persisted as JSON in the state directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lower bound on the authorization timeout, seconds.
pub const MIN_TIMEOUT_SECS: u64 = 10;
/// Upper bound on the authorization timeout, seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk shape of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Whether new devices are blocked until authorized.
    pub enabled: bool,
    /// Seconds a pending device waits before auto-deny.
    pub timeout_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Configuration with its backing file.
///
/// Mutations persist immediately. Writes go to a sibling temp file followed
/// by a rename, so a crash mid-write leaves the previous file intact.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: DaemonConfig,
}

impl ConfigStore {
    /// Load from `path`, falling back to defaults if the file is missing.
    /// An unreadable or unparsable file is an error, not a silent reset.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => {
                let mut config: DaemonConfig = serde_json::from_str(&contents)?;
                config.timeout_seconds =
                    config.timeout_seconds.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
                config
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, config })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.config.timeout_seconds
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Set the protection flag and persist.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.config.enabled = enabled;
        self.persist()
    }

    /// Set the timeout, clamped to `[MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS]`,
    /// persist, and return the value actually stored.
    pub fn set_timeout(&mut self, seconds: u64) -> Result<u64, ConfigError> {
        self.config.timeout_seconds = seconds.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        self.persist()?;
        Ok(self.config.timeout_seconds)
    }

    fn persist(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(&self.path);
        let contents = serde_json::to_string_pretty(&self.config)?;
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
