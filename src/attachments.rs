//! File attachments
//!
//! Text pulled out of attached files is prepended to the user prompt as
//! context. Extraction itself sits behind [`TextExtractor`] so richer formats
//! can be plugged in by the caller.

use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("extracting {format} text requires {dependency}")]
    MissingDependency { format: String, dependency: String },
    #[error("failed to read attachment: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a file into plain text
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String, ExtractError>;
}

/// Extensions read verbatim by [`PlainTextExtractor`]
pub const PLAIN_TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "jsonl", "yaml", "yml", "toml", "xml", "log",
    "ini", "cfg", "rs", "py", "js", "ts", "c", "h", "cpp", "hpp", "java", "go", "sh", "sql",
    "html", "htm",
];

/// Document formats that need a dedicated extractor
const RICH_FORMATS: &[(&str, &str)] = &[
    ("pdf", "a PDF text extractor"),
    ("docx", "a DOCX reader"),
    ("doc", "a DOC reader"),
];

/// Reads plain-text files, replacing invalid UTF-8
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if let Some((format, dependency)) = RICH_FORMATS.iter().find(|(f, _)| *f == ext) {
            return Err(ExtractError::MissingDependency {
                format: format.to_string(),
                dependency: dependency.to_string(),
            });
        }
        if !ext.is_empty() && !PLAIN_TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ExtractError::UnsupportedFormat(ext));
        }

        let bytes = fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A file whose text has been extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

impl Attachment {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Extract `path` with `extractor`, naming the attachment after the file
    pub fn from_path(path: &Path, extractor: &dyn TextExtractor) -> Result<Self, ExtractError> {
        let content = extractor.extract(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        tracing::debug!("Attached {} ({} chars)", name, content.len());
        Ok(Self { name, content })
    }
}

/// Build the prompt sent to the model from the user's prompt, attachments
/// and free-form extra context. Without either, the prompt is unchanged.
pub fn compose_prompt(prompt: &str, attachments: &[Attachment], extra_context: Option<&str>) -> String {
    let mut context = String::new();

    if !attachments.is_empty() {
        context.push_str("Attached files:\n\n");
        for attachment in attachments {
            context.push_str(&format!(
                "--- {} ---\n{}\n\n",
                attachment.name, attachment.content
            ));
        }
    }

    if let Some(extra) = extra_context.map(str::trim).filter(|e| !e.is_empty()) {
        if !context.is_empty() {
            context.push('\n');
        }
        context.push_str("Additional context:\n");
        context.push_str(extra);
    }

    if context.is_empty() {
        return prompt.to_string();
    }
    format!("{context}\n\n{prompt}")
}
