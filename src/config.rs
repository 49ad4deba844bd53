//! Persisted transport settings (§5 ambient config, grounded on the
//! teacher's `ConfigManager`): the default hardware/software buffer sizes
//! and the realtime-priority opt-in, loaded from (and saved back to) a TOML
//! file under the platform config directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSettings {
    pub hw_buffer_frames: i32,
    pub sw_buffer_frames: i32,
    pub sample_rate: u32,
    pub wants_rtmidi: bool,
    pub realtime_priority: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            hw_buffer_frames: 512,
            sw_buffer_frames: 128,
            sample_rate: 48_000,
            wants_rtmidi: false,
            realtime_priority: false,
        }
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    config: TransportSettings,
}

impl ConfigManager {
    pub fn with_config(config: TransportSettings) -> Self {
        Self {
            config_path: PathBuf::from("fallback_config.toml"),
            config,
        }
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;
        Ok(Self { config_path, config })
    }

    pub fn get_config(&self) -> &TransportSettings {
        &self.config
    }

    pub fn update_config(&mut self, config: TransportSettings) -> Result<()> {
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        Self::save_config_to_path(&self.config, &self.config_path)
    }

    fn load_or_create_config(config_path: &PathBuf) -> Result<TransportSettings> {
        if config_path.exists() {
            info!("loading transport settings from {config_path:?}");
            let raw = fs::read_to_string(config_path).context("failed to read configuration file")?;
            match toml::from_str::<TransportSettings>(&raw) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!("failed to parse configuration file: {e}. using defaults");
                    let default_config = TransportSettings::default();
                    Self::save_config_to_path(&default_config, config_path)?;
                    Ok(default_config)
                }
            }
        } else {
            info!("no configuration file found at {config_path:?}, writing defaults");
            let default_config = TransportSettings::default();
            Self::save_config_to_path(&default_config, config_path)?;
            Ok(default_config)
        }
    }

    fn save_config_to_path(config: &TransportSettings, path: &PathBuf) -> Result<()> {
        let raw = toml::to_string_pretty(config).context("failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        fs::write(path, raw).context("failed to write configuration file")?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = if let Some(dir) = dirs::config_dir() {
            dir.join("synth-transport")
        } else {
            let home_dir = dirs::home_dir().context("could not determine home directory")?;
            home_dir.join(".synth-transport")
        };
        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn default_settings_match_a_typical_device() {
        let config = TransportSettings::default();
        assert_eq!(config.hw_buffer_frames, 512);
        assert_eq!(config.sample_rate, 48_000);
        assert!(!config.wants_rtmidi);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = TransportSettings {
            hw_buffer_frames: 1024,
            sw_buffer_frames: 256,
            sample_rate: 44_100,
            wants_rtmidi: true,
            realtime_priority: true,
        };
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: TransportSettings = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn with_config_uses_a_fallback_path() {
        let manager = ConfigManager::with_config(TransportSettings::default());
        assert_eq!(manager.get_config(), &TransportSettings::default());
    }
}
