// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving snippet settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluetooth::READ_BUFFER_SIZE;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adapter stability wait settings.
    pub stability: StabilityConfig,

    /// RFCOMM settings.
    pub rfcomm: RfcommConfig,

    /// Event cache settings.
    pub events: EventsConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Seconds the state must stay unchanged.
    pub window_secs: u64,

    /// Seconds between state polls.
    pub poll_interval_secs: u64,

    /// Seconds before giving up.
    pub timeout_secs: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window_secs: 5,
            poll_interval_secs: 1,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfcommConfig {
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Maximum queued events per (callback id, event name).
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive applied on top of `RUST_LOG`.
    pub default_directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "bluesnip=info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluesnip")
            .join("config.toml")
    }

    /// Load configuration from the default location, creating it if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[stability]\ntimeout_secs = 60\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.stability.timeout_secs, 60);
        assert_eq!(config.stability.window_secs, 5);
        assert_eq!(config.rfcomm.read_buffer_size, 1024);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.rfcomm.read_buffer_size = 256;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }
}
