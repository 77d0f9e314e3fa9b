//! Save-data settings
//!
//! Loaded from JSON on native targets and from LocalStorage on the web.
//! Missing fields fall back to their defaults.

use serde::{Deserialize, Serialize};
#[cfg(not(target_arch = "wasm32"))]
use std::path::{Path, PathBuf};

use crate::consts;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// The per-user save container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container directory name
    pub dir_name: String,

    // === Metadata (metadata-capable devices only) ===
    pub title: String,
    pub subtitle: String,
    pub detail: String,
    /// PNG shown next to the container in system UI
    #[cfg(not(target_arch = "wasm32"))]
    pub icon_path: Option<PathBuf>,

    /// Blocks reserved when the container is created
    pub blocks: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            dir_name: consts::MOUNT_DIR_NAME.to_string(),
            title: consts::SAVE_TITLE.to_string(),
            subtitle: String::new(),
            detail: String::new(),
            #[cfg(not(target_arch = "wasm32"))]
            icon_path: None,
            blocks: consts::DEFAULT_CONTAINER_BLOCKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Local user owning the container
    pub user_id: i32,

    pub container: ContainerSettings,

    // === Transfer ===
    /// Bytes per chunked read/write
    pub chunk_size: usize,
    /// Refresh the backup copy on every unmount
    pub backup_on_unmount: bool,

    // === Scheduling ===
    /// Times a `Busy` request is put back at the head of the queue
    pub busy_requeue_limit: u32,
    /// Ticks a device call may stay unanswered before a warning is logged
    pub stall_warning_ticks: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: 1,
            container: ContainerSettings::default(),
            chunk_size: consts::DEFAULT_CHUNK_SIZE,
            backup_on_unmount: true,
            busy_requeue_limit: 3,
            stall_warning_ticks: 600,
        }
    }
}

impl Settings {
    /// Environment variable naming a settings file
    pub const ENV_VAR: &'static str = "SAVEBRIDGE_SETTINGS";

    /// LocalStorage key
    #[cfg(target_arch = "wasm32")]
    const STORAGE_KEY: &'static str = "savebridge_settings";

    pub fn validate(&self) -> Result<(), SettingsError> {
        let dir = &self.container.dir_name;
        if dir.is_empty() {
            return Err(SettingsError::Invalid("container.dir_name is empty".into()));
        }
        if dir.contains(['/', '\\']) || dir == "." || dir == ".." {
            return Err(SettingsError::Invalid(format!(
                "container.dir_name '{}' must be a plain name",
                dir
            )));
        }
        if self.chunk_size == 0 {
            return Err(SettingsError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.container.blocks < consts::BLOCKS_MIN {
            return Err(SettingsError::Invalid(format!(
                "container.blocks must be at least {}",
                consts::BLOCKS_MIN
            )));
        }
        if self.stall_warning_ticks == 0 {
            return Err(SettingsError::Invalid(
                "stall_warning_ticks must be at least 1".into(),
            ));
        }
        Ok(())
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from `$SAVEBRIDGE_SETTINGS`, or use defaults
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load() -> Self {
        let Some(path) = std::env::var_os(Self::ENV_VAR) else {
            log::info!("Using default settings");
            return Self::default();
        };

        let path = PathBuf::from(path);
        match Self::load_from(&path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                log::warn!("Ignoring settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Read the container icon, if one is configured
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_icon(&self) -> Option<Vec<u8>> {
        let path = self.container.icon_path.as_ref()?;
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Could not read icon {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Load settings from LocalStorage (WASM only)
    #[cfg(target_arch = "wasm32")]
    pub fn load() -> Self {
        let storage = web_sys::window()
            .and_then(|w| w.local_storage().ok())
            .flatten();

        if let Some(storage) = storage {
            if let Ok(Some(json)) = storage.get_item(Self::STORAGE_KEY) {
                match serde_json::from_str::<Self>(&json) {
                    Ok(settings) if settings.validate().is_ok() => {
                        log::info!("Loaded settings from LocalStorage");
                        return settings;
                    }
                    Ok(_) => log::warn!("Stored settings are invalid"),
                    Err(e) => log::warn!("Stored settings are malformed: {}", e),
                }
            }
        }

        log::info!("Using default settings");
        Self::default()
    }

    /// Save settings to LocalStorage (WASM only)
    #[cfg(target_arch = "wasm32")]
    pub fn save(&self) {
        let storage = web_sys::window()
            .and_then(|w| w.local_storage().ok())
            .flatten();

        if let Some(storage) = storage {
            if let Ok(json) = serde_json::to_string(self) {
                let _ = storage.set_item(Self::STORAGE_KEY, &json);
                log::info!("Settings saved");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.container.dir_name, "saves");
        assert_eq!(settings.chunk_size, 1000);
        assert!(settings.backup_on_unmount);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = Settings::from_json(r#"{"user_id": 7, "container": {"title": "Slot"}}"#)
            .unwrap();
        assert_eq!(settings.user_id, 7);
        assert_eq!(settings.container.title, "Slot");
        assert_eq!(settings.container.dir_name, "saves");
        assert_eq!(settings.busy_requeue_limit, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Settings::from_json(r#"{"chunk_size": 0}"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));

        let err = Settings::from_json(r#"{"container": {"dir_name": "../up"}}"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));

        let err = Settings::from_json("{not json").unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.stall_warning_ticks = 42;

        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load_from(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
