//! Recently used models
//!
//! Bounded most-recently-used list of model paths kept in the configuration
//! store under `recent_models`, front = most recent.

use serde_json::Value;
use std::sync::Arc;

use super::config_store::{ConfigStore, KEY_RECENT_MODELS};

/// Maximum number of entries kept
pub const MAX_RECENT_MODELS: usize = 10;

/// Registry of recently loaded models
#[derive(Debug, Clone)]
pub struct RecentModelRegistry {
    store: Arc<ConfigStore>,
}

impl RecentModelRegistry {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Move `path` to the front, evicting the oldest entry past the bound
    pub fn add(&self, path: &str) {
        self.store.modify(|doc| {
            let mut entries = read_entries(doc.get(KEY_RECENT_MODELS));
            entries.retain(|p| p != path);
            entries.insert(0, path.to_string());
            entries.truncate(MAX_RECENT_MODELS);
            doc.insert(KEY_RECENT_MODELS.to_string(), to_value(entries));
        });
        tracing::debug!("Recorded recent model {}", path);
    }

    /// Remove `path` if present; returns whether it was listed
    pub fn remove(&self, path: &str) -> bool {
        self.store.modify(|doc| {
            let mut entries = read_entries(doc.get(KEY_RECENT_MODELS));
            let before = entries.len();
            entries.retain(|p| p != path);
            let removed = entries.len() != before;
            doc.insert(KEY_RECENT_MODELS.to_string(), to_value(entries));
            removed
        })
    }

    pub fn clear(&self) {
        self.store
            .modify(|doc| doc.insert(KEY_RECENT_MODELS.to_string(), Value::Array(Vec::new())));
    }

    /// Entries, most recent first
    pub fn list(&self) -> Vec<String> {
        read_entries(Some(&self.store.get_value(KEY_RECENT_MODELS)))
    }
}

// Tolerates hand-edited files: non-strings, duplicates and overflow are dropped.
fn read_entries(value: Option<&Value>) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items.iter().filter_map(Value::as_str) {
            if !entries.iter().any(|e| e == item) {
                entries.push(item.to_string());
            }
        }
    }
    entries.truncate(MAX_RECENT_MODELS);
    entries
}

fn to_value(entries: Vec<String>) -> Value {
    Value::Array(entries.into_iter().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> RecentModelRegistry {
        RecentModelRegistry::new(Arc::new(ConfigStore::new()))
    }

    #[test]
    fn test_existing_path_moves_to_front() {
        let recent = registry();
        recent.add("/models/a.gguf");
        recent.add("/models/b.gguf");
        recent.add("/models/a.gguf");
        assert_eq!(recent.list(), vec!["/models/a.gguf", "/models/b.gguf"]);
    }

    #[test]
    fn test_bound_evicts_oldest() {
        let recent = registry();
        for i in 0..=MAX_RECENT_MODELS {
            recent.add(&format!("/models/{i}.gguf"));
        }
        let list = recent.list();
        assert_eq!(list.len(), MAX_RECENT_MODELS);
        assert_eq!(list[0], "/models/10.gguf");
        assert!(!list.contains(&"/models/0.gguf".to_string()));
    }

    #[test]
    fn test_remove_and_clear() {
        let recent = registry();
        recent.add("/models/a.gguf");
        recent.add("/models/b.gguf");
        assert!(recent.remove("/models/a.gguf"));
        assert!(!recent.remove("/models/a.gguf"));
        assert_eq!(recent.list(), vec!["/models/b.gguf"]);
        recent.clear();
        assert!(recent.list().is_empty());
    }

    #[test]
    fn test_tolerates_malformed_entries() {
        let store = Arc::new(ConfigStore::new());
        store.set_value(KEY_RECENT_MODELS, json!(["/a.gguf", 3, "/a.gguf", null, "/b.gguf"]));
        let recent = RecentModelRegistry::new(store);
        assert_eq!(recent.list(), vec!["/a.gguf", "/b.gguf"]);
    }
}
