//! Application settings storage
//!
//! Stores user preferences in a JSON file in the app data directory.

use crate::error::ConfigError;
use crate::scanner::ScanOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Settings version for future migrations
    pub version: u32,
    /// Patterns to ignore during scanning
    pub ignore_patterns: Vec<String>,
    /// Show hidden files (files starting with .)
    pub show_hidden_files: bool,
    /// Minimum time between progress updates
    pub progress_interval_ms: u64,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            ignore_patterns: Vec::new(),
            show_hidden_files: true,
            progress_interval_ms: 100,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            ignore_patterns: self.ignore_patterns.clone(),
            show_hidden_files: self.show_hidden_files,
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }
}

const SETTINGS_VERSION: u32 = 1;

/// Get the data directory path
fn get_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("spacescan"))
}

/// Get the settings file path
pub fn settings_path() -> Option<PathBuf> {
    get_data_dir().map(|p| p.join("settings.json"))
}

/// Load settings from disk, falling back to defaults
pub fn load_settings() -> Settings {
    match settings_path() {
        Some(path) => load_settings_from(&path),
        None => Settings::default(),
    }
}

pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }

    let parsed = fs::read_to_string(path)
        .map_err(ConfigError::from)
        .and_then(|content| serde_json::from_str::<Settings>(&content).map_err(ConfigError::from));

    match parsed {
        Ok(settings) => settings,
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable settings");
            Settings::default()
        }
    }
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<(), ConfigError> {
    let path = settings_path().ok_or(ConfigError::NoDataDir)?;
    save_settings_to(&path, settings)
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    // Ensure version is set
    let mut settings = settings.clone();
    settings.version = SETTINGS_VERSION;

    let content = serde_json::to_string_pretty(&settings)?;
    fs::write(path, content)?;

    Ok(())
}

/// Update a single setting value
pub fn update_setting<F>(updater: F) -> Result<Settings, ConfigError>
where
    F: FnOnce(&mut Settings),
{
    let mut settings = load_settings();
    updater(&mut settings);
    save_settings(&settings)?;
    Ok(settings)
}

/// Reset settings to defaults
pub fn reset_settings() -> Result<Settings, ConfigError> {
    let defaults = Settings::default();
    save_settings(&defaults)?;
    Ok(defaults)
}

/// Add an ignore pattern
pub fn add_ignore_pattern(pattern: &str) -> Result<Settings, ConfigError> {
    update_setting(|s| {
        if !s.ignore_patterns.iter().any(|p| p == pattern) {
            s.ignore_patterns.push(pattern.to_string());
        }
    })
}

/// Remove an ignore pattern
pub fn remove_ignore_pattern(pattern: &str) -> Result<Settings, ConfigError> {
    update_setting(|s| {
        s.ignore_patterns.retain(|p| p != pattern);
    })
}
