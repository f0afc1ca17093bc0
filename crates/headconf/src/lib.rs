//! Minimal configuration loading for the headset session manager.
//!
//! Every crate in the workspace reads its knobs from [`HeadsetConfig`]. The
//! config is small on purpose: logging, stream chunking, firmware update
//! location and the session overlap policy.
//!
//! # Usage
//!
//! ```rust,no_run
//! use headconf::HeadsetConfig;
//!
//! let config = HeadsetConfig::load().expect("Failed to load config");
//!
//! println!("chunk size: {}", config.stream.chunk_size);
//! println!("firmware: {}", config.update.firmware_path.display());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/headset/config.toml` (system)
//! 2. `~/.config/headset/config.toml` (user)
//! 3. `./headset.toml` (local override)
//! 4. Environment variables (`HEADSET_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [logging]
//! level = "debug"
//! path = "/var/log/headset.log"
//! append = true
//!
//! [stream]
//! chunk_size = 50
//!
//! [update]
//! firmware_path = "~/firmware/halo.bin"
//!
//! [session]
//! overlap = "serialized"
//! ```

pub mod loader;
pub mod logging;
pub mod session;

pub use loader::{discover_config_files_with_override, ConfigLayer, ConfigSources};
pub use logging::LoggingConfig;
pub use session::{OverlapPolicy, SessionSettings, StreamConfig, UpdateConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key} in {path}: {message}")]
    Invalid {
        path: PathBuf,
        key: &'static str,
        message: String,
    },
}

/// Complete headset configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HeadsetConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub session: SessionSettings,
}

impl HeadsetConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/headset/config.toml`
    /// 3. `~/.config/headset/config.toml`
    /// 4. `./headset.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./headset.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = HeadsetConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let layer = loader::load_layer(&path)?;
            config = loader::merge_configs(config, layer);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand so the section order matches the docs
        let mut output = String::new();

        output.push_str("# Headset Configuration\n\n");

        output.push_str("[logging]\n");
        output.push_str(&format!("enabled = {}\n", self.logging.enabled));
        output.push_str(&format!("level = {}\n", quoted(&self.logging.level)));
        let log_path = self
            .logging
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        output.push_str(&format!("path = {}\n", quoted(&log_path)));
        output.push_str(&format!("append = {}\n", self.logging.append));
        output.push_str(&format!("timestamps = {}\n", self.logging.timestamps));
        output.push_str(&format!("thread_ids = {}\n", self.logging.thread_ids));

        output.push_str("\n[stream]\n");
        output.push_str(&format!("chunk_size = {}\n", self.stream.chunk_size));

        output.push_str("\n[update]\n");
        output.push_str(&format!(
            "firmware_path = {}\n",
            quoted(&self.update.firmware_path.display().to_string())
        ));
        output.push_str(&format!("block_size = {}\n", self.update.block_size));

        output.push_str("\n[session]\n");
        output.push_str(&format!("overlap = \"{}\"\n", self.session.overlap.as_str()));

        output
    }
}

/// Render a TOML string literal, escaping quotes and backslashes.
fn quoted(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}
