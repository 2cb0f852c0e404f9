//! RoomAgent App
//!
//! Unified initialization for an agent sandbox host: logging + device seed +
//! settings + encrypted state store + controller.

pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use roomagent_agent_runtime::{AgentController, ControllerConfig, ModuleRegistry, SandboxError};
use roomagent_settings::{RoomAgentConfig, Settings, SettingsError};
use roomagent_state::{EncryptedStateStore, SeedCipher, SqliteStateStore, StorageError};
use thiserror::Error;
use tracing::info;

pub use logging::LogLevel;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
    #[error("Keystore error: {0}")]
    KeystoreError(#[from] roomagent_keystore::KeystoreError),
    #[error("State store error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Sandbox error: {0}")]
    SandboxError(#[from] SandboxError),
}

/// Where encrypted agent state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLocation {
    /// From settings, else `<data dir>/state.db`.
    Default,
    File(PathBuf),
    InMemory,
}

/// Initialized host.
pub struct App {
    pub service: String,
    pub settings: Settings<RoomAgentConfig>,
    pub registry: Arc<ModuleRegistry>,
    pub store: Arc<EncryptedStateStore>,
    pub controller: Arc<AgentController>,
}

/// Builder for constructing an App with configurable options.
pub struct AppBuilder {
    service: String,
    log_level: LogLevel,
    skip_logging: bool,
    skip_banner: bool,
    config_path: Option<PathBuf>,
    seed_path: Option<PathBuf>,
    state: StateLocation,
}

impl AppBuilder {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            log_level: LogLevel::Info,
            skip_logging: false,
            skip_banner: false,
            config_path: None,
            seed_path: None,
            state: StateLocation::Default,
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.log_level = LogLevel::from_verbose(verbose);
        self
    }

    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn skip_banner(mut self) -> Self {
        self.skip_banner = true;
        self
    }

    pub fn config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn seed_path(mut self, path: impl AsRef<Path>) -> Self {
        self.seed_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn state(mut self, location: StateLocation) -> Self {
        self.state = location;
        self
    }

    pub fn build(self) -> Result<App, AppError> {
        if !self.skip_logging {
            let _ = logging::try_init(self.log_level);
        }

        let seed_path = self
            .seed_path
            .unwrap_or_else(|| roomagent_keystore::default_seed_path_for(&self.service));
        let seed = roomagent_keystore::load_or_generate_seed(&seed_path)?;

        let settings: Settings<RoomAgentConfig> =
            Settings::load_or_default(&self.service, self.config_path.as_deref())?;

        let backend = match &self.state {
            StateLocation::InMemory => SqliteStateStore::open_in_memory()?,
            StateLocation::File(path) => SqliteStateStore::open(path)?,
            StateLocation::Default => {
                let path = settings.config.storage.db_path.clone().unwrap_or_else(|| {
                    roomagent_keystore::data_dir(&self.service).join("state.db")
                });
                SqliteStateStore::open(&path)?
            }
        };
        let store = Arc::new(EncryptedStateStore::new(
            Arc::new(backend),
            Arc::new(SeedCipher::new(seed)),
        ));

        let registry = Arc::new(ModuleRegistry::new());
        let controller = Arc::new(AgentController::new(
            ControllerConfig::from_settings(&settings.config),
            registry.clone(),
            store.clone(),
        )?);

        if !self.skip_banner {
            info!(
                "{} {} starting, settings at {}",
                self.service,
                env!("CARGO_PKG_VERSION"),
                settings.path().display(),
            );
        }

        Ok(App {
            service: self.service,
            settings,
            registry,
            store,
            controller,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomagent_state::StateKey;

    #[test]
    fn test_app_builder() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::new("roomagent-app-test")
            .skip_logging()
            .skip_banner()
            .config_path(dir.path().join("settings.json"))
            .seed_path(dir.path().join("device.seed"))
            .state(StateLocation::InMemory)
            .build()
            .unwrap();

        assert_eq!(app.service, "roomagent-app-test");
        assert!(dir.path().join("settings.json").exists());
        assert!(dir.path().join("device.seed").exists());
        assert!(app.controller.instances().is_empty());
    }

    #[test]
    fn test_state_survives_restart_with_same_seed() {
        let dir = tempfile::tempdir().unwrap();
        let build = || {
            AppBuilder::new("roomagent-app-test")
                .skip_logging()
                .skip_banner()
                .config_path(dir.path().join("settings.json"))
                .seed_path(dir.path().join("device.seed"))
                .state(StateLocation::File(dir.path().join("state.db")))
                .build()
                .unwrap()
        };
        let key = StateKey::new("room", "agent");

        let first = build();
        first.store.save(&key, b"counter=3").unwrap();
        drop(first);

        let second = build();
        let blob = second.store.load(&key).unwrap().unwrap();
        assert_eq!(blob.as_slice(), b"counter=3");
    }
}
