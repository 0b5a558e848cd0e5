//! Model types
//!
//! Defines model references and metadata about a loaded model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::storage::remote::RemoteModelRef;

/// Where a model is loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A GGUF file on the local filesystem
    Local(PathBuf),
    /// A file inside a named model repository
    Remote(RemoteModelRef),
}

impl ModelSource {
    /// Interpret user input as a model reference.
    ///
    /// Anything that is not a well-formed remote reference is treated as a
    /// local path; whether that path exists is checked at load time.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if !PathBuf::from(trimmed).exists() {
            if let Ok(remote) = RemoteModelRef::parse(trimmed) {
                return ModelSource::Remote(remote);
            }
        }
        ModelSource::Local(PathBuf::from(trimmed))
    }

    /// Human-readable identifier used as the model name
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string()),
            ModelSource::Remote(remote) => remote.filename.clone(),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::Remote(remote) => write!(f, "{remote}"),
        }
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        ModelSource::Local(path)
    }
}

/// Dimensions reported by a backend handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendInfo {
    pub context_size: u32,
    pub embedding_size: u32,
    pub vocab_size: u32,
}

/// Information about a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Display name of the model
    pub name: String,
    /// Reference the model was loaded from
    pub source: String,
    /// Context window in tokens
    pub context_size: u32,
    pub embedding_size: u32,
    pub vocab_size: u32,
    /// CPU threads the model was loaded with
    pub n_threads: u32,
    /// GPU layers the model was loaded with (-1 = all)
    pub n_gpu_layers: i32,
}
