//! Layered configuration store
//!
//! Compiled-in defaults, overlaid by a persisted JSON file, overlaid by
//! in-memory runtime changes. Nothing is written back until `save` is called.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::config::{GenerationParams, ModelParams};

pub const SECTION_MODEL: &str = "model";
pub const SECTION_GENERATION: &str = "generation";
pub const SECTION_MISC: &str = "misc";

pub const KEY_RECENT_MODELS: &str = "recent_models";
pub const KEY_LAST_MODELS_DIR: &str = "last_models_dir";
pub const KEY_SYSTEM_PROMPT: &str = "system_prompt";

/// System prompt used in chat mode when none is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Configuration persistence failures. Neither is fatal: the store keeps its
/// previous state.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration from {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
    #[error("failed to save configuration to {}: {reason}", path.display())]
    Save { path: PathBuf, reason: String },
}

/// Build the compiled-in default document
pub fn default_document() -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert(SECTION_MODEL.into(), section_of(&ModelParams::default()));
    doc.insert(SECTION_GENERATION.into(), section_of(&GenerationParams::default()));
    doc.insert(SECTION_MISC.into(), Value::Object(Map::new()));
    doc.insert(KEY_RECENT_MODELS.into(), Value::Array(Vec::new()));
    doc.insert(
        KEY_LAST_MODELS_DIR.into(),
        Value::String(super::default_models_dir().to_string_lossy().to_string()),
    );
    doc.insert(
        KEY_SYSTEM_PROMPT.into(),
        Value::String(DEFAULT_SYSTEM_PROMPT.to_string()),
    );
    doc
}

fn section_of<T: serde::Serialize>(params: &T) -> Value {
    serde_json::to_value(params).unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Recursively merge `source` into `target`.
///
/// When both sides hold an object under the same key the objects are merged;
/// otherwise the value from `source` replaces the one in `target`.
pub fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) =
            (target.get_mut(key), value)
        {
            deep_merge(existing, incoming);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

/// Process-wide configuration, shared by reference between components.
///
/// Reads take a shared lock; `set`, `update_section` and `load` serialize on
/// the write lock.
#[derive(Debug)]
pub struct ConfigStore {
    defaults: Map<String, Value>,
    data: RwLock<Map<String, Value>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Store holding only the compiled-in defaults
    pub fn new() -> Self {
        Self::with_defaults(default_document())
    }

    /// Store with a custom default skeleton
    pub fn with_defaults(defaults: Map<String, Value>) -> Self {
        Self {
            data: RwLock::new(defaults.clone()),
            defaults,
        }
    }

    /// Defaults overlaid by the file at `path`. A missing or unreadable file
    /// leaves the defaults in place.
    pub fn open(path: &Path) -> Self {
        let store = Self::new();
        if let Err(e) = store.load(path) {
            tracing::warn!("Using default configuration: {}", e);
        }
        store
    }

    pub fn defaults(&self) -> &Map<String, Value> {
        &self.defaults
    }

    /// Value of `section.key`, falling back to the compiled-in default and
    /// then to `null`.
    pub fn get(&self, section: &str, key: &str) -> Value {
        let live = self
            .data
            .read()
            .get(section)
            .and_then(|s| s.get(key))
            .cloned();
        live.or_else(|| {
            self.defaults
                .get(section)
                .and_then(|s| s.get(key))
                .cloned()
        })
        .unwrap_or(Value::Null)
    }

    /// Top-level entry such as `system_prompt` or `recent_models`
    pub fn get_value(&self, key: &str) -> Value {
        self.data
            .read()
            .get(key)
            .or_else(|| self.defaults.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Copy of a section; empty when the section does not exist
    pub fn section(&self, section: &str) -> Map<String, Value> {
        match self.data.read().get(section) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Overwrite `section.key`, creating the section if needed. Returns
    /// `false` and changes nothing when `section` names a scalar entry.
    pub fn set(&self, section: &str, key: &str, value: Value) -> bool {
        let mut data = self.data.write();
        match section_mut(&mut data, section) {
            Some(map) => {
                map.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Overwrite a top-level entry
    pub fn set_value(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
    }

    /// Deep-merge `values` into a section, leaving unmentioned keys alone.
    /// Returns `false` when `section` names a scalar entry.
    pub fn update_section(&self, section: &str, values: &Map<String, Value>) -> bool {
        let mut data = self.data.write();
        match section_mut(&mut data, section) {
            Some(map) => {
                deep_merge(map, values);
                true
            }
            None => false,
        }
    }

    /// Run `f` against the live document under the write lock
    pub(crate) fn modify<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.data.write())
    }

    /// Full copy of the live document
    pub fn snapshot(&self) -> Map<String, Value> {
        self.data.read().clone()
    }

    /// Replace the live document with the defaults overlaid by the file at
    /// `path`.
    ///
    /// Returns `Ok(false)` when there is no file. On error the current state
    /// is kept.
    pub fn load(&self, path: &Path) -> Result<bool, ConfigError> {
        if !path.exists() {
            tracing::info!("Config file {} not found, keeping current values", path.display());
            return Ok(false);
        }

        let load_err = |reason: String| ConfigError::Load {
            path: path.to_path_buf(),
            reason,
        };

        let json = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let parsed: Value = serde_json::from_str(&json).map_err(|e| load_err(e.to_string()))?;
        let Value::Object(file) = parsed else {
            return Err(load_err("top level is not a JSON object".to_string()));
        };

        let merged = self.overlay_defaults(&file);
        *self.data.write() = merged;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(true)
    }

    fn overlay_defaults(&self, file: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.defaults.clone();
        for (key, value) in file {
            let Some(slot) = merged.get_mut(key) else {
                tracing::debug!("Ignoring unknown top-level config key '{}'", key);
                continue;
            };
            match slot {
                Value::Object(section) => match value {
                    Value::Object(incoming) => deep_merge(section, incoming),
                    _ => tracing::warn!("Config key '{}' is not an object, keeping default", key),
                },
                Value::Array(_) if !value.is_array() => {
                    tracing::warn!("Config key '{}' is not a list, keeping default", key);
                }
                _ => *slot = value.clone(),
            }
        }
        merged
    }

    /// Write the full live document to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let save_err = |reason: String| ConfigError::Save {
            path: path.to_path_buf(),
            reason,
        };

        let json = serde_json::to_string_pretty(&Value::Object(self.snapshot()))
            .map_err(|e| save_err(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| save_err(e.to_string()))?;
        }
        fs::write(path, json).map_err(|e| save_err(e.to_string()))?;

        tracing::debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Typed view of the `model` section
    pub fn model_params(&self) -> ModelParams {
        ModelParams::from_section(&self.section(SECTION_MODEL))
    }

    /// Typed view of the `generation` section
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams::from_section(&self.section(SECTION_GENERATION))
    }

    pub fn system_prompt(&self) -> String {
        self.get_value(KEY_SYSTEM_PROMPT)
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn last_models_dir(&self) -> PathBuf {
        self.get_value(KEY_LAST_MODELS_DIR)
            .as_str()
            .map(PathBuf::from)
            .unwrap_or_else(super::default_models_dir)
    }
}

/// Section `section`, created when absent. `None` when the name is taken by
/// a scalar such as `system_prompt`, which is left as it is.
fn section_mut<'a>(
    data: &'a mut Map<String, Value>,
    section: &str,
) -> Option<&'a mut Map<String, Value>> {
    match data
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
    {
        Value::Object(map) => Some(map),
        _ => {
            tracing::warn!("Config entry '{}' is not a section, leaving it unchanged", section);
            None
        }
    }
}
