//! Remote model references
//!
//! Parses references to a GGUF file inside a named model repository. The
//! backend resolves and fetches them; this layer only checks they are
//! well-formed.

use std::fmt;
use thiserror::Error;

const HUB_HOST: &str = "huggingface.co";

/// Known-good quantized builds offered alongside local files, as
/// (repository id, file name). Menu numbers `P1..Pn` follow this order.
pub const PREDEFINED_MODELS: &[(&str, &str)] = &[
    ("TheBloke/Phi-2-GGUF", "phi-2.Q4_K_M.gguf"),
    (
        "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
        "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
    ),
    (
        "TheBloke/CodeLlama-70B-Python-GGUF",
        "codellama-70b-python.Q2_K.gguf",
    ),
];

/// All predefined models as references
pub fn predefined_models() -> Vec<RemoteModelRef> {
    PREDEFINED_MODELS
        .iter()
        .filter_map(|(repo_id, filename)| RemoteModelRef::new(*repo_id, *filename).ok())
        .collect()
}

/// Resolve a menu choice such as `P2` (1-based, case-insensitive)
pub fn predefined_model(choice: &str) -> Option<RemoteModelRef> {
    let choice = choice.trim();
    let number = choice
        .strip_prefix('P')
        .or_else(|| choice.strip_prefix('p'))?
        .parse::<usize>()
        .ok()?;
    let (repo_id, filename) = PREDEFINED_MODELS.get(number.checked_sub(1)?)?;
    RemoteModelRef::new(*repo_id, *filename).ok()
}

/// Reasons a reference is not well-formed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteRefError {
    #[error("'{0}' is not a repository reference (expected owner/repo:file.gguf)")]
    NotARemoteRef(String),
    #[error("repository id '{0}' must have the form owner/repo")]
    InvalidRepoId(String),
    #[error("reference '{0}' does not name a file")]
    MissingFilename(String),
}

/// A file inside a named model repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModelRef {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

impl RemoteModelRef {
    pub fn new(repo_id: impl Into<String>, filename: impl Into<String>) -> Result<Self, RemoteRefError> {
        let reference = Self {
            repo_id: repo_id.into(),
            filename: filename.into(),
            revision: "main".to_string(),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Parse the supported reference formats:
    /// 1. `owner/repo:model.gguf`
    /// 2. `https://huggingface.co/owner/repo/blob/<rev>/model.gguf`
    /// 3. `https://huggingface.co/owner/repo/resolve/<rev>/model.gguf`
    pub fn parse(input: &str) -> Result<Self, RemoteRefError> {
        let input = input.trim();
        let input = input.split('?').next().unwrap_or(input);
        let input = input.split('#').next().unwrap_or(input);

        if input.contains(HUB_HOST) {
            return Self::parse_hub_url(input);
        }

        let (repo_id, filename) = input
            .split_once(':')
            .ok_or_else(|| RemoteRefError::NotARemoteRef(input.to_string()))?;
        if !repo_id.contains('/') || repo_id.contains('\\') {
            return Err(RemoteRefError::NotARemoteRef(input.to_string()));
        }

        Self::new(repo_id, filename)
    }

    fn parse_hub_url(url: &str) -> Result<Self, RemoteRefError> {
        let path = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches(HUB_HOST)
            .trim_start_matches('/');

        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() < 2 {
            return Err(RemoteRefError::InvalidRepoId(path.to_string()));
        }
        let repo_id = format!("{}/{}", parts[0], parts[1]);

        let marker = parts
            .iter()
            .position(|&p| p == "blob" || p == "resolve")
            .ok_or_else(|| RemoteRefError::MissingFilename(url.to_string()))?;
        if parts.len() <= marker + 2 {
            return Err(RemoteRefError::MissingFilename(url.to_string()));
        }

        let reference = Self {
            repo_id,
            filename: parts[marker + 2..].join("/"),
            revision: parts[marker + 1].to_string(),
        };
        reference.validate()?;
        Ok(reference)
    }

    pub fn validate(&self) -> Result<(), RemoteRefError> {
        let mut segments = self.repo_id.split('/');
        let owner = segments.next().unwrap_or_default();
        let repo = segments.next().unwrap_or_default();
        if owner.trim().is_empty() || repo.trim().is_empty() || segments.next().is_some() {
            return Err(RemoteRefError::InvalidRepoId(self.repo_id.clone()));
        }
        if self.filename.trim().is_empty() {
            return Err(RemoteRefError::MissingFilename(self.repo_id.clone()));
        }
        Ok(())
    }

    /// Direct download URL for the referenced file
    pub fn download_url(&self) -> String {
        format!(
            "https://{}/{}/resolve/{}/{}",
            HUB_HOST, self.repo_id, self.revision, self.filename
        )
    }
}

impl fmt::Display for RemoteModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo_id, self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hub_url_full() {
        let url = "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/blob/main/llama-2-7b.Q4_K_M.gguf";
        let parsed = RemoteModelRef::parse(url).unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(parsed.filename, "llama-2-7b.Q4_K_M.gguf");
        assert_eq!(parsed.revision, "main");
    }

    #[test]
    fn test_parse_colon_form() {
        let parsed = RemoteModelRef::parse("TheBloke/Phi-2-GGUF:phi-2.Q4_K_M.gguf").unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/Phi-2-GGUF");
        assert_eq!(parsed.filename, "phi-2.Q4_K_M.gguf");
        assert_eq!(parsed.to_string(), "TheBloke/Phi-2-GGUF:phi-2.Q4_K_M.gguf");
        assert_eq!(
            parsed.download_url(),
            "https://huggingface.co/TheBloke/Phi-2-GGUF/resolve/main/phi-2.Q4_K_M.gguf"
        );
    }

    #[test]
    fn test_predefined_models_are_valid() {
        let models = predefined_models();
        assert_eq!(models.len(), PREDEFINED_MODELS.len());
        for model in &models {
            assert!(model.validate().is_ok());
            assert!(model.filename.ends_with(".gguf"));
            assert_eq!(RemoteModelRef::parse(&model.to_string()).unwrap(), *model);
        }
        let mut names: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), models.len());
    }

    #[test]
    fn test_predefined_menu_choice() {
        let phi = predefined_model("P1").unwrap();
        assert_eq!(phi.repo_id, "TheBloke/Phi-2-GGUF");
        assert_eq!(predefined_model(" p2 ").unwrap().filename, "mistral-7b-instruct-v0.2.Q4_K_M.gguf");
        assert!(predefined_model("P0").is_none());
        assert!(predefined_model("P4").is_none());
        assert!(predefined_model("L1").is_none());
        assert!(predefined_model("Px").is_none());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            RemoteModelRef::parse("/models/a.gguf"),
            Err(RemoteRefError::NotARemoteRef(_))
        ));
        assert!(matches!(
            RemoteModelRef::parse("TheBloke/Phi-2-GGUF:"),
            Err(RemoteRefError::MissingFilename(_))
        ));
        assert!(matches!(
            RemoteModelRef::parse("/repo:file.gguf"),
            Err(RemoteRefError::InvalidRepoId(_))
        ));
        assert!(RemoteModelRef::parse("C:\\models\\a.gguf").is_err());
        assert!(RemoteModelRef::parse("https://huggingface.co/TheBloke/Repo").is_err());
    }
}
