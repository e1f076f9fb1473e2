//! Persistent configuration for droidpilot.
//!
//! Stores tool locations and port defaults in `~/.droidpilot/config.json`.
//! Missing fields fall back to their defaults, so an absent or partial file
//! is always usable.
//!
//! # Example
//!
//! ```no_run
//! use droidpilot_core::config::DroidpilotConfig;
//!
//! let config = DroidpilotConfig::load();
//! println!("adb: {}", config.adb_path.display());
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ipc::droidpilot_dir;

const CONFIG_FILENAME: &str = "config.json";

/// Default adb server port.
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// First local port handed to chromedriver instances.
pub const DEFAULT_CHROMEDRIVER_PORT: u16 = 9515;

/// Persistent droidpilot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidpilotConfig {
    /// adb executable; resolved through `PATH` when relative.
    pub adb_path: PathBuf,
    /// chromedriver executable; resolved through `PATH` when relative.
    pub chromedriver_path: PathBuf,
    /// adb server port used when a session does not set `adbPort`.
    pub adb_port: u16,
    /// Lowest chromedriver port; drivers lease free ports from a window
    /// above it.
    pub chromedriver_base_port: u16,
}

impl Default for DroidpilotConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            chromedriver_path: PathBuf::from("chromedriver"),
            adb_port: DEFAULT_ADB_PORT,
            chromedriver_base_port: DEFAULT_CHROMEDRIVER_PORT,
        }
    }
}

impl DroidpilotConfig {
    /// Load config from `~/.droidpilot/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = droidpilot_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.droidpilot/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let path = droidpilot_dir().join(CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_path_lookup() {
        let config = DroidpilotConfig::default();
        assert_eq!(config.adb_path, PathBuf::from("adb"));
        assert_eq!(config.chromedriver_path, PathBuf::from("chromedriver"));
        assert_eq!(config.adb_port, 5037);
        assert_eq!(config.chromedriver_base_port, 9515);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let loaded: DroidpilotConfig =
            serde_json::from_str(r#"{"adb_path": "/opt/android/platform-tools/adb"}"#).unwrap();
        assert_eq!(loaded.adb_path, PathBuf::from("/opt/android/platform-tools/adb"));
        assert_eq!(loaded.adb_port, DEFAULT_ADB_PORT);
        assert_eq!(loaded.chromedriver_base_port, DEFAULT_CHROMEDRIVER_PORT);
    }

    #[test]
    fn deserialize_empty_json() {
        let loaded: DroidpilotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, DroidpilotConfig::default());
    }
}
