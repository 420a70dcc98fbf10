use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the AF/ZCL core. Missing fields take their defaults when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AfConfig {
    /// how long a pending confirmation or response may stay unanswered
    pub request_timeout_ms: u64,
    pub default_radius: u8,
    /// profile whose delegator forwards traffic of remote endpoints with unknown profile
    pub default_profile_id: u16,
    pub discover_page_size: u8,
    pub read_chunk_size: usize,
    /// in-flight interview requests allowed per device
    pub device_concurrency: usize,
    /// how long traffic of an unidentified device is buffered
    pub reborn_timeout_ms: u64,
}

impl AfConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reborn_timeout(&self) -> Duration {
        Duration::from_millis(self.reborn_timeout_ms)
    }
}

impl Default for AfConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            default_radius: 30,
            default_profile_id: 0x0104,
            discover_page_size: 240,
            read_chunk_size: 5,
            device_concurrency: 1,
            reborn_timeout_ms: 60_000,
        }
    }
}

pub fn load_config(path: &str) -> Result<AfConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context(format!("parsing {}", path))
}

pub fn save_config(path: &str, config: &AfConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}
