//! Persistent storage
//!
//! This module handles all data persistence: the layered configuration store,
//! the recent-models registry, local model discovery and transcripts.

pub mod config_store;
pub mod history;
pub mod models;
pub mod recent;
pub mod remote;

use std::path::PathBuf;
use thiserror::Error;

pub use config_store::{ConfigError, ConfigStore};
pub use recent::RecentModelRegistry;

/// Environment variable that overrides the configuration file location
pub const CONFIG_PATH_ENV: &str = "LM_SESSION_CONFIG";

/// Storage-level errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not determine a data directory for this platform")]
    NoDataDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// Application data directory
///
/// Linux: ~/.local/share/lm-session
/// macOS: ~/Library/Application Support/lm-session
/// Windows: %APPDATA%\lm-session\data
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("", "", "lm-session")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}

/// Location of the persisted configuration file
pub fn default_config_path() -> Result<PathBuf, StorageError> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(get_data_dir()?.join("config.json"))
}

/// Directory scanned for models when nothing else is configured
pub fn default_models_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("./models"))
}
