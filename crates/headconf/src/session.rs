//! Session, streaming and firmware update settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stream assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Timesteps per delivered chunk.
    /// Default: 25
    #[serde(default = "StreamConfig::default_chunk_size")]
    pub chunk_size: usize,
}

impl StreamConfig {
    fn default_chunk_size() -> usize {
        25
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: Self::default_chunk_size(),
        }
    }
}

/// Firmware update settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateConfig {
    /// Firmware image sent by `start_update`.
    /// Default: ../updates/firmware_HALO.bin
    #[serde(default = "UpdateConfig::default_firmware_path")]
    pub firmware_path: PathBuf,

    /// Bytes per update block; each block waits for a device ack.
    /// Default: 240
    #[serde(default = "UpdateConfig::default_block_size")]
    pub block_size: usize,
}

impl UpdateConfig {
    fn default_firmware_path() -> PathBuf {
        PathBuf::from("../updates/firmware_HALO.bin")
    }

    fn default_block_size() -> usize {
        240
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            firmware_path: Self::default_firmware_path(),
            block_size: Self::default_block_size(),
        }
    }
}

/// Whether asynchronous operations of different kinds may be in flight together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Different kinds may overlap unless both change the session state.
    #[default]
    Permissive,
    /// At most one asynchronous operation of any kind at a time.
    Serialized,
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapPolicy::Permissive => "permissive",
            OverlapPolicy::Serialized => "serialized",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(OverlapPolicy::Permissive),
            "serialized" | "serialised" => Some(OverlapPolicy::Serialized),
            _ => None,
        }
    }
}

/// Session behaviour knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettings {
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_policy_parse() {
        assert_eq!(OverlapPolicy::parse("permissive"), Some(OverlapPolicy::Permissive));
        assert_eq!(OverlapPolicy::parse(" Serialized "), Some(OverlapPolicy::Serialized));
        assert_eq!(OverlapPolicy::parse("sometimes"), None);
    }
}
