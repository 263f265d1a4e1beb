//! Why a relay settings file was refused.

use std::path::PathBuf;

use thiserror::Error;

/// Settings failure. Each variant names where the bad input came from, so
/// `relayd` can print it and exit.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The file is not JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Syntax {
        /// Offending file.
        path: PathBuf,
        /// Parser error, with line and column.
        source: serde_json::Error,
    },
    /// The JSON parsed but a key has the wrong type, e.g. a string port.
    #[error("settings do not fit the relay schema: {0}")]
    Schema(#[source] serde_json::Error),
    /// A value parsed but the relay cannot run with it.
    #[error("{field} {reason}")]
    Rejected {
        /// camelCase path of the setting, e.g. `hub.queueCapacity`.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl SettingsError {
    pub(crate) fn rejected(field: &'static str, reason: &'static str) -> Self {
        Self::Rejected { field, reason }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, SettingsError>;
