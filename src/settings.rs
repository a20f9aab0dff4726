//! Engine settings with JSON persistence.
//!
//! This module provides:
//! - `EngineSettings`, the user-tunable knobs of the flasher
//! - Conversion into the handshake, strategy and HEX parser configuration
//! - Persistence to a JSON file in an application data directory
//!
//! ## Extensibility
//!
//! To add a new setting:
//! 1. Add the field to `EngineSettings` (the struct-level `#[serde(default)]`
//!    keeps older files loadable)
//! 2. Give it a default in the `Default` impl
//! 3. Thread it into the relevant conversion below

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::flasher::config::{
    DEFAULT_SETTLE_DELAY, INTER_CHUNK_DELAY, NORMAL_BAUD_RATE, REENUMERATION_TIMEOUT_MS,
    TOUCH_BAUD_RATE, TOUCH_SIGNAL_HOLD,
};
use crate::flasher::{
    BlockEncodingStrategy, FlashError, FlashMode, FlashResult, HandshakeConfig, HexParseOptions,
    PortConfig,
};

/// Tunables for flashing and the bootloader handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Baud rate for streaming and commands.
    pub normal_baud_rate: u32,

    /// Baud rate that triggers the bootloader.
    pub touch_baud_rate: u32,

    /// Run the touch handshake before flashing.
    pub enter_bootloader: bool,

    /// Wait after the touch before looking for the device.
    pub settle_delay_ms: u64,

    /// Maximum wait for the bootloader to appear.
    pub reenumeration_timeout_ms: u64,

    /// Reopen the application port after flashing.
    pub reopen_after_reset: bool,

    /// Pause after each raw chunk.
    pub inter_chunk_delay_ms: u64,

    /// Block encoding.
    pub flash_mode: FlashMode,

    /// Overrides the family ID of a UF2 flash mode.
    pub family_id: Option<u32>,

    /// Reject HEX records whose checksum does not match.
    pub strict_checksums: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            normal_baud_rate: NORMAL_BAUD_RATE,
            touch_baud_rate: TOUCH_BAUD_RATE,
            enter_bootloader: false,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            reenumeration_timeout_ms: REENUMERATION_TIMEOUT_MS,
            reopen_after_reset: false,
            inter_chunk_delay_ms: INTER_CHUNK_DELAY.as_millis() as u64,
            flash_mode: FlashMode::default(),
            family_id: None,
            strict_checksums: false,
        }
    }
}

impl EngineSettings {
    /// Check values that would otherwise fail deep inside a flash.
    pub fn validate(&self) -> FlashResult<()> {
        if self.normal_baud_rate == 0 || self.touch_baud_rate == 0 {
            return Err(FlashError::InvalidConfig {
                reason: "baud rates must be non-zero".into(),
            });
        }
        if self.enter_bootloader && self.touch_baud_rate == self.normal_baud_rate {
            return Err(FlashError::InvalidConfig {
                reason: format!(
                    "touch baud rate {} must differ from the normal baud rate",
                    self.touch_baud_rate
                ),
            });
        }
        self.strategy().map(|_| ())
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            touch_baud_rate: self.touch_baud_rate,
            normal_baud_rate: self.normal_baud_rate,
            signal_hold: TOUCH_SIGNAL_HOLD,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            reenumeration_timeout: Duration::from_millis(self.reenumeration_timeout_ms),
            reopen_after_reset: self.reopen_after_reset,
        }
    }

    pub fn hex_options(&self) -> HexParseOptions {
        HexParseOptions {
            verify_checksums: self.strict_checksums,
        }
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    /// Flash mode with the family ID override applied.
    pub fn flash_mode(&self) -> FlashMode {
        match (&self.flash_mode, self.family_id) {
            (FlashMode::Uf2Framed { data_per_block, .. }, Some(family_id)) => {
                FlashMode::Uf2Framed {
                    data_per_block: *data_per_block,
                    family_id: Some(family_id),
                }
            }
            (mode, _) => mode.clone(),
        }
    }

    pub fn strategy(&self) -> FlashResult<Box<dyn BlockEncodingStrategy>> {
        self.flash_mode().strategy(self.inter_chunk_delay())
    }

    /// Port configuration at the normal baud rate.
    pub fn port_config(&self, port_name: impl Into<String>) -> PortConfig {
        PortConfig::new(port_name).with_baud(self.normal_baud_rate)
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the data directory.
const SETTINGS_FILENAME: &str = "flasher_settings.json";

/// Manages persistence of engine settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given data directory.
    pub fn new(data_dir: &Path) -> Self {
        let settings_file_path = data_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> FlashResult<EngineSettings> {
        if !self.settings_file_path.exists() {
            debug!(
                "No settings at {}, using defaults",
                self.settings_file_path.display()
            );
            return Ok(EngineSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(EngineSettings::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Validate and save settings to disk.
    pub fn save(&self, settings: &EngineSettings) -> FlashResult<()> {
        settings.validate()?;

        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;

        if settings.has_non_default_settings() {
            info!("Saved non-default settings: {:?}", settings);
        }
        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.normal_baud_rate, 115_200);
        assert_eq!(settings.touch_baud_rate, 1200);
        assert_eq!(settings.inter_chunk_delay(), Duration::from_millis(50));
        assert!(!settings.strict_checksums);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path());

        // Initially returns defaults
        let loaded = manager.load().unwrap();
        assert_eq!(loaded, EngineSettings::default());

        let settings = EngineSettings {
            enter_bootloader: true,
            flash_mode: FlashMode::Uf2Framed {
                data_per_block: 256,
                family_id: None,
            },
            strict_checksums: true,
            ..EngineSettings::default()
        };
        manager.save(&settings).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, settings);
        assert!(manager.settings_path().exists());
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path());
        fs::write(manager.settings_path(), "  \n").unwrap();

        assert_eq!(manager.load().unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path());
        fs::write(manager.settings_path(), r#"{"settleDelayMs": 1500}"#).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.settle_delay_ms, 1500);
        assert_eq!(loaded.normal_baud_rate, NORMAL_BAUD_RATE);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path());
        fs::write(manager.settings_path(), "{not json").unwrap();

        assert!(matches!(manager.load(), Err(FlashError::Config(_))));
    }

    #[test]
    fn test_save_rejects_oversized_uf2_blocks() {
        let dir = tempdir().unwrap();
        let manager = SettingsManager::new(dir.path());
        let settings = EngineSettings {
            flash_mode: FlashMode::Uf2Framed {
                data_per_block: 480,
                family_id: None,
            },
            ..EngineSettings::default()
        };

        assert!(matches!(
            manager.save(&settings),
            Err(FlashError::BlockOverflow { size: 480, .. })
        ));
        assert!(!manager.settings_path().exists());
    }

    #[test]
    fn test_touch_baud_must_differ_when_entering_bootloader() {
        let settings = EngineSettings {
            enter_bootloader: true,
            touch_baud_rate: NORMAL_BAUD_RATE,
            ..EngineSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(FlashError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_family_id_override() {
        let settings = EngineSettings {
            flash_mode: FlashMode::Uf2Framed {
                data_per_block: 476,
                family_id: None,
            },
            family_id: Some(0xADA5_2840),
            ..EngineSettings::default()
        };

        assert_eq!(
            settings.flash_mode(),
            FlashMode::Uf2Framed {
                data_per_block: 476,
                family_id: Some(0xADA5_2840)
            }
        );
        // Ignored for raw mode
        let raw = EngineSettings {
            family_id: Some(1),
            ..EngineSettings::default()
        };
        assert_eq!(raw.flash_mode(), FlashMode::default());
    }

    #[test]
    fn test_conversions() {
        let settings = EngineSettings {
            settle_delay_ms: 250,
            reopen_after_reset: true,
            strict_checksums: true,
            ..EngineSettings::default()
        };

        let handshake = settings.handshake_config();
        assert_eq!(handshake.settle_delay, Duration::from_millis(250));
        assert!(handshake.reopen_after_reset);
        assert!(settings.hex_options().verify_checksums);

        let port = settings.port_config("COM7");
        assert_eq!(port.port_name, "COM7");
        assert_eq!(port.baud_rate, NORMAL_BAUD_RATE);
    }

    #[test]
    fn test_serde_camel_case() {
        let json = serde_json::to_string(&EngineSettings::default()).unwrap();

        assert!(json.contains("normalBaudRate"));
        assert!(json.contains("interChunkDelayMs"));
        assert!(json.contains(r#""mode":"rawChunked""#));
        assert!(!json.contains("normal_baud_rate"));
    }
}
