//! Settings storage
//!
//! Manages persistence of the engine configuration.

use crate::storage::{get_data_dir, StorageError};
use crate::types::{InferenceParams, ModelParams, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Smallest context a session can work with
const MIN_CONTEXT_SIZE: u32 = 256;

/// Engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How the model is loaded
    pub model: ModelParams,
    /// Defaults for every turn
    pub inference: InferenceParams,
    /// Shared session behaviour
    pub session: SessionConfig,
}

impl EngineSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.inference.validate();

        self.model.context_size = self.model.context_size.max(MIN_CONTEXT_SIZE);
        self.model.batch_size = self.model.batch_size.clamp(1, self.model.context_size);

        if encoding_rs::Encoding::for_label(self.model.encoding.as_bytes()).is_none() {
            tracing::warn!(
                "Unknown encoding {:?}, falling back to utf-8",
                self.model.encoding
            );
            self.model.encoding = "utf-8".to_string();
        }

        if self.model.threads.is_some_and(|t| t <= 0) {
            self.model.threads = None;
        }

        // Can't generate more than the context holds
        if self.inference.max_tokens > self.model.context_size as i32 {
            self.inference.max_tokens = (self.model.context_size / 2) as i32;
        }

        self.session.antiprompts.retain(|a| !a.is_empty());
        if self
            .session
            .system_prompt
            .as_ref()
            .is_some_and(|p| p.trim().is_empty())
        {
            self.session.system_prompt = None;
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Load settings from `path`, falling back to defaults
pub fn load_settings_from(path: &Path) -> EngineSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

fn load_settings_internal(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`, creating its directory
pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
