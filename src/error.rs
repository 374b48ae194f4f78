//! Error types for launch configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving settings or assembling an emulator command.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// OS image whose extension is not one of `.vhd`, `.qcow2` or `.iso`.
    #[error("Unknown OS storage type: {}", .0.display())]
    UnknownOsStorage(PathBuf),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
