//! Local model discovery
//!
//! Lists GGUF files found in a models directory.

use std::path::{Path, PathBuf};

use crate::storage::StorageError;

/// A GGUF file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModel {
    /// File name including the extension
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// List `*.gguf` files directly inside `dir`, sorted by file name.
///
/// A directory that does not exist yields an empty list.
pub fn scan_models_directory(dir: &Path) -> Result<Vec<LocalModel>, StorageError> {
    if !dir.is_dir() {
        tracing::debug!("Models directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = format!("{}/*.gguf", escaped.trim_end_matches(['/', '\\']));

    let mut models = Vec::new();
    let entries = glob::glob(&pattern)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        models.push(LocalModel {
            filename,
            path,
            size_bytes,
        });
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(models)
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_lists_only_gguf_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.gguf"), b"GGUF1234").unwrap();
        fs::write(dir.path().join("a.gguf"), b"GGUF").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        fs::create_dir(dir.path().join("sub.gguf")).unwrap();

        let models = scan_models_directory(dir.path()).unwrap();
        let names: Vec<_> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["a.gguf", "b.gguf"]);
        assert_eq!(models[1].size_bytes, 8);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let models = scan_models_directory(&dir.path().join("nope")).unwrap();
        assert!(models.is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
