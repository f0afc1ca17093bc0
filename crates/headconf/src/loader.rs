//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, HeadsetConfig, OverlapPolicy};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/headset/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("headset/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("headset.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Keys set by one config file. Absent keys leave the layer below untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    pub log_enabled: Option<bool>,
    pub log_level: Option<String>,
    /// `Some(None)` when the file sets an empty path to disable the log file.
    pub log_path: Option<Option<PathBuf>>,
    pub log_append: Option<bool>,
    pub log_timestamps: Option<bool>,
    pub log_thread_ids: Option<bool>,
    pub chunk_size: Option<usize>,
    pub firmware_path: Option<PathBuf>,
    pub block_size: Option<usize>,
    pub overlap: Option<OverlapPolicy>,
}

impl ConfigLayer {
    /// Write every key this layer sets onto `config`.
    pub fn apply_to(self, config: &mut HeadsetConfig) {
        let logging = &mut config.logging;
        set(&mut logging.enabled, self.log_enabled);
        set(&mut logging.level, self.log_level);
        set(&mut logging.path, self.log_path);
        set(&mut logging.append, self.log_append);
        set(&mut logging.timestamps, self.log_timestamps);
        set(&mut logging.thread_ids, self.log_thread_ids);
        set(&mut config.stream.chunk_size, self.chunk_size);
        set(&mut config.update.firmware_path, self.firmware_path);
        set(&mut config.update.block_size, self.block_size);
        set(&mut config.session.overlap, self.overlap);
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Load config from a TOML file on top of the compiled defaults.
pub fn load_from_file(path: &Path) -> Result<HeadsetConfig, ConfigError> {
    Ok(merge_configs(HeadsetConfig::default(), load_layer(path)?))
}

/// Load only the keys a TOML file sets.
pub fn load_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<ConfigLayer, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let invalid = |key: &'static str, message: String| ConfigError::Invalid {
        path: path.to_path_buf(),
        key,
        message,
    };

    let mut layer = ConfigLayer::default();
    if let Some(section) = table.get("logging").and_then(|v| v.as_table()) {
        layer.log_enabled = section.get("enabled").and_then(|v| v.as_bool());
        layer.log_level = section.get("level").and_then(|v| v.as_str()).map(str::to_string);
        layer.log_path = section
            .get("path")
            .and_then(|v| v.as_str())
            .map(|v| if v.is_empty() { None } else { Some(expand_path(v)) });
        layer.log_append = section.get("append").and_then(|v| v.as_bool());
        layer.log_timestamps = section.get("timestamps").and_then(|v| v.as_bool());
        layer.log_thread_ids = section.get("thread_ids").and_then(|v| v.as_bool());
    }

    if let Some(section) = table.get("stream").and_then(|v| v.as_table()) {
        if let Some(v) = section.get("chunk_size").and_then(|v| v.as_integer()) {
            if v <= 0 {
                return Err(invalid("stream.chunk_size", format!("must be positive, got {v}")));
            }
            layer.chunk_size = Some(v as usize);
        }
    }

    if let Some(section) = table.get("update").and_then(|v| v.as_table()) {
        layer.firmware_path = section
            .get("firmware_path")
            .and_then(|v| v.as_str())
            .map(expand_path);
        if let Some(v) = section.get("block_size").and_then(|v| v.as_integer()) {
            if !(1..=u16::MAX as i64).contains(&v) {
                return Err(invalid(
                    "update.block_size",
                    format!("must be between 1 and {}, got {v}", u16::MAX),
                ));
            }
            layer.block_size = Some(v as usize);
        }
    }

    if let Some(section) = table.get("session").and_then(|v| v.as_table()) {
        if let Some(v) = section.get("overlap").and_then(|v| v.as_str()) {
            let policy = OverlapPolicy::parse(v).ok_or_else(|| {
                invalid(
                    "session.overlap",
                    format!("expected \"permissive\" or \"serialized\", got {v:?}"),
                )
            })?;
            layer.overlap = Some(policy);
        }
    }

    Ok(layer)
}

/// Merge a file's layer onto `base`. Every key the layer sets wins, including
/// a key set back to its default; keys it leaves out keep the base value.
pub fn merge_configs(mut base: HeadsetConfig, overlay: ConfigLayer) -> HeadsetConfig {
    overlay.apply_to(&mut base);
    base
}

/// Apply environment variable overrides to config.
///
/// Unparseable numeric or policy values are ignored rather than failing the load.
pub fn apply_env_overrides(config: &mut HeadsetConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("HEADSET_LOG_LEVEL") {
        config.logging.level = v;
        sources.env_overrides.push("HEADSET_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.logging.level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
    if let Ok(v) = env::var("HEADSET_LOG_PATH") {
        config.logging.path = if v.is_empty() { None } else { Some(expand_path(&v)) };
        sources.env_overrides.push("HEADSET_LOG_PATH".to_string());
    }

    if let Ok(v) = env::var("HEADSET_CHUNK_SIZE") {
        if let Ok(size) = v.parse::<usize>() {
            if size > 0 {
                config.stream.chunk_size = size;
                sources.env_overrides.push("HEADSET_CHUNK_SIZE".to_string());
            }
        }
    }

    if let Ok(v) = env::var("HEADSET_FIRMWARE_PATH") {
        config.update.firmware_path = expand_path(&v);
        sources.env_overrides.push("HEADSET_FIRMWARE_PATH".to_string());
    }
    if let Ok(v) = env::var("HEADSET_UPDATE_BLOCK_SIZE") {
        if let Ok(size) = v.parse::<u16>() {
            if size > 0 {
                config.update.block_size = size as usize;
                sources.env_overrides.push("HEADSET_UPDATE_BLOCK_SIZE".to_string());
            }
        }
    }

    if let Ok(v) = env::var("HEADSET_OVERLAP") {
        if let Some(policy) = OverlapPolicy::parse(&v) {
            config.session.overlap = policy;
            sources.env_overrides.push("HEADSET_OVERLAP".to_string());
        }
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
