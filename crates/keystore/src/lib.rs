//! RoomAgent Keystore
//!
//! File-based persistence for the device seed that state encryption keys are
//! derived from, plus the platform directories the other crates write into.

use std::fs;
use std::path::{Path, PathBuf};

use roomagent_crypto::{DeviceSeed, SEED_LEN};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read seed file: {0}")]
    ReadError(String),
    #[error("Failed to write seed file: {0}")]
    WriteError(String),
    #[error("Invalid seed format: expected {SEED_LEN} bytes, found {0}")]
    InvalidFormat(usize),
    #[error("Failed to create directory: {0}")]
    CreateDirError(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Load the device seed at `path`, generating and saving one if absent.
pub fn load_or_generate_seed(path: &Path) -> Result<DeviceSeed> {
    if path.exists() {
        debug!("Loading device seed from {}", path.display());
        let bytes = fs::read(path).map_err(|e| KeystoreError::ReadError(e.to_string()))?;
        let seed: [u8; SEED_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::InvalidFormat(bytes.len()))?;
        Ok(DeviceSeed::from_bytes(seed))
    } else {
        info!("Generating new device seed at {}", path.display());
        let seed = DeviceSeed::generate();
        save_seed(path, &seed)?;
        Ok(seed)
    }
}

/// Write the seed, creating parent directories. Owner-only on unix.
pub fn save_seed(path: &Path, seed: &DeviceSeed) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| KeystoreError::CreateDirError(e.to_string()))?;
    }
    fs::write(path, seed.as_bytes()).map_err(|e| KeystoreError::WriteError(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| KeystoreError::WriteError(e.to_string()))?;
    }
    Ok(())
}

/// `<data dir>/keys` for the service.
pub fn default_keystore_dir_for(service: &str) -> PathBuf {
    data_dir(service).join("keys")
}

/// `<data dir>/keys/device.seed` for the service.
pub fn default_seed_path_for(service: &str) -> PathBuf {
    default_keystore_dir_for(service).join("device.seed")
}

/// Per-service configuration directory.
///
/// - macOS: `~/Library/Application Support/{Service}`
/// - Linux: `$XDG_CONFIG_HOME/{service}` or `~/.config/{service}`
/// - Windows: `%APPDATA%\{Service}`
pub fn default_config_dir_for(service: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".config"))
            .join(service.to_lowercase())
    }
    #[cfg(not(target_os = "linux"))]
    {
        data_dir(service)
    }
}

/// Per-service data directory (seed, state database).
pub fn data_dir(service: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir()
            .join("Library")
            .join("Application Support")
            .join(capitalize(service))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".local").join("share"))
            .join(service.to_lowercase())
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join("AppData").join("Roaming"))
            .join(capitalize(service))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        home_dir().join(format!(".{}", service.to_lowercase()))
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => home_dir().join(rest.trim_start_matches(['/', '\\'])),
        None => PathBuf::from(path),
    }
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().to_string() + &chars.as_str().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_load_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("device.seed");

        let first = load_or_generate_seed(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_seed(&path).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn test_seed_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.seed");
        load_or_generate_seed(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_invalid_seed_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.seed");
        fs::write(&path, b"too short").unwrap();
        let result = load_or_generate_seed(&path);
        assert!(matches!(result, Err(KeystoreError::InvalidFormat(9))));
    }

    #[test]
    fn test_default_paths() {
        let seed_path = default_seed_path_for("roomagent");
        assert!(
            seed_path.ends_with("keys/device.seed") || seed_path.ends_with("keys\\device.seed")
        );
        assert!(!default_config_dir_for("roomagent").as_os_str().is_empty());
    }

    #[test]
    fn test_expand_path() {
        assert!(!expand_path("~/test").to_string_lossy().starts_with('~'));
        assert!(expand_path("~/test").ends_with("test"));
        assert_eq!(expand_path("/abs/path"), PathBuf::from("/abs/path"));
    }
}
