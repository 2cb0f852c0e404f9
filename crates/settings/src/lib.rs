//! RoomAgent Settings
//!
//! `Settings<T>` persists any serde config type as JSON under the service's
//! config directory. `RoomAgentConfig` is the host's own config tree; every
//! field has a default so partial files load.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use roomagent_keystore::default_config_dir_for;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(String),
    #[error("Failed to write settings: {0}")]
    WriteError(String),
    #[error("Failed to parse settings: {0}")]
    ParseError(String),
    #[error("Failed to create directory: {0}")]
    CreateDirError(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Top-level host configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomAgentConfig {
    pub sandbox: SandboxSettings,
    pub gateway: GatewaySettings,
    pub controller: ControllerSettings,
    pub storage: StorageSettings,
}

/// Per-isolate resource ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub max_memory_bytes: usize,
    pub fuel_limit: u64,
    /// Wall-clock bound enforced inside the engine. Never longer than
    /// `controller.call_timeout_ms`.
    pub max_execution_ms: u64,
    pub epoch_tick_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            fuel_limit: 50_000_000,
            max_execution_ms: 10_000,
            epoch_tick_ms: 10,
        }
    }
}

/// Bounds on what one call may move across the host import surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub max_state_bytes: usize,
    pub max_event_bytes: usize,
    pub max_emitted_events_per_call: usize,
    pub max_log_line_bytes: usize,
    pub max_log_lines_per_call: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_state_bytes: 64 * 1024,
            max_event_bytes: 16 * 1024,
            max_emitted_events_per_call: 1024,
            max_log_line_bytes: 512,
            max_log_lines_per_call: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Bound on a single `init` / `on_task_event` / `on_tick` round trip.
    pub call_timeout_ms: u64,
    pub instantiate_timeout_ms: u64,
    /// Capacity of the emitted-event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2_000,
            instantiate_timeout_ms: 10_000,
            event_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite file for persisted agent state. `None` uses the data directory.
    pub db_path: Option<PathBuf>,
}

/// Generic settings wrapper for any serializable config type.
///
/// ```ignore
/// let settings: Settings<RoomAgentConfig> = Settings::load_or_default("roomagent", None)?;
/// ```
pub struct Settings<T> {
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned + Default> Settings<T> {
    /// Load settings from `custom_path` or the service default, writing
    /// defaults when no file exists yet.
    pub fn load_or_default(service: &str, custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(service),
        };

        if path.exists() {
            debug!("Loading settings from {}", path.display());
            let content =
                fs::read_to_string(&path).map_err(|e| SettingsError::ReadError(e.to_string()))?;
            let config: T = serde_json::from_str(&content)
                .map_err(|e| SettingsError::ParseError(e.to_string()))?;
            Ok(Self { config, path })
        } else {
            debug!("Creating default settings at {}", path.display());
            let settings = Self {
                config: T::default(),
                path,
            };
            settings.save()?;
            Ok(settings)
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettingsError::CreateDirError(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&self.config)
            .map_err(|e| SettingsError::WriteError(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| SettingsError::WriteError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn default_settings_path(service: &str) -> PathBuf {
    default_config_dir_for(service).join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings: Settings<RoomAgentConfig> =
            Settings::load_or_default("roomagent", Some(&path)).unwrap();
        assert_eq!(settings.config, RoomAgentConfig::default());
        assert!(path.exists());

        let again: Settings<RoomAgentConfig> =
            Settings::load_or_default("roomagent", Some(&path)).unwrap();
        assert_eq!(again.config, RoomAgentConfig::default());
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut settings: Settings<RoomAgentConfig> =
            Settings::load_or_default("roomagent", Some(&path)).unwrap();
        settings.config.controller.call_timeout_ms = 250;
        settings.config.gateway.max_state_bytes = 128;
        settings.save().unwrap();

        let loaded: Settings<RoomAgentConfig> =
            Settings::load_or_default("roomagent", Some(&path)).unwrap();
        assert_eq!(loaded.config.controller.call_timeout_ms, 250);
        assert_eq!(loaded.config.gateway.max_state_bytes, 128);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"sandbox": {"fuel_limit": 42}}"#).unwrap();

        let settings: Settings<RoomAgentConfig> =
            Settings::load_or_default("roomagent", Some(&path)).unwrap();
        assert_eq!(settings.config.sandbox.fuel_limit, 42);
        assert_eq!(
            settings.config.sandbox.max_memory_bytes,
            SandboxSettings::default().max_memory_bytes
        );
        assert_eq!(settings.config.gateway, GatewaySettings::default());
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        let result: Result<Settings<RoomAgentConfig>> =
            Settings::load_or_default("roomagent", Some(&path));
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }
}
