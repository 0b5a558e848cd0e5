//! Transcript storage
//!
//! Saves and restores a chat transcript as a JSON array of messages.

use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::storage::StorageError;
use crate::types::message::Message;

/// Write `messages` to `path`, creating the parent directory
pub fn save_transcript(path: &Path, messages: &[Message]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(messages)?;
    fs::write(path, json)?;
    tracing::debug!("Saved {} messages to {}", messages.len(), path.display());
    Ok(())
}

/// Read a transcript written by `save_transcript`
pub fn load_transcript(path: &Path) -> Result<Vec<Message>, StorageError> {
    let json = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&json)?;
    if !value.is_array() {
        return Err(StorageError::InvalidFormat(
            "transcript must be a JSON array".to_string(),
        ));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Role;

    #[test]
    fn test_transcript_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats").join("session.json");
        let messages = vec![
            Message::new(Role::User, "2+2?"),
            Message::new(Role::Assistant, "4"),
        ];

        save_transcript(&path, &messages).unwrap();
        let loaded = load_transcript(&path).unwrap();
        assert_eq!(loaded, messages);
    }

    #[test]
    fn test_rejects_non_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"role": "user"}"#).unwrap();
        assert!(matches!(
            load_transcript(&path),
            Err(StorageError::InvalidFormat(_))
        ));
    }
}
