//! Logging configuration consumed by the binaries' subscriber setup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How and where log output is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Master switch. When false no subscriber is installed.
    /// Default: true
    #[serde(default = "LoggingConfig::default_enabled")]
    pub enabled: bool,

    /// Filter directive (trace, debug, info, warn, error, or an EnvFilter string).
    /// Default: warn
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log file. `None` writes to stderr only.
    /// Default: headset.log
    #[serde(default = "LoggingConfig::default_path")]
    pub path: Option<PathBuf>,

    /// Append to an existing log file instead of truncating it.
    /// Default: false
    #[serde(default)]
    pub append: bool,

    /// Prefix records with a timestamp.
    /// Default: true
    #[serde(default = "LoggingConfig::default_enabled")]
    pub timestamps: bool,

    /// Include the emitting thread id.
    /// Default: true
    #[serde(default = "LoggingConfig::default_enabled")]
    pub thread_ids: bool,
}

impl LoggingConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_level() -> String {
        "warn".to_string()
    }

    fn default_path() -> Option<PathBuf> {
        Some(PathBuf::from("headset.log"))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            level: Self::default_level(),
            path: Self::default_path(),
            append: false,
            timestamps: true,
            thread_ids: true,
        }
    }
}
