//! Prompt formatting
//!
//! Maps (mode, system prompt, user prompt) to the text handed to the backend.
//! Complete mode passes the prompt through untouched; chat mode wraps it in
//! an instruction template.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Placeholder replaced by the system prompt
pub const SYSTEM_PLACEHOLDER: &str = "{system}";
/// Placeholder replaced by the user prompt
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Llama-2 style instruction wrapper
pub const DEFAULT_CHAT_TEMPLATE: &str = "<s>[INST] {system}\n\n{prompt} [/INST]";

/// How the prompt is presented to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Instruction-wrapped with a system prompt
    #[default]
    Chat,
    /// Raw continuation of the prompt
    Complete,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Chat => "chat",
            GenerationMode::Complete => "complete",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(GenerationMode::Chat),
            "complete" => Ok(GenerationMode::Complete),
            other => Err(format!("unknown mode '{other}' (expected chat or complete)")),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template must contain {0} exactly once")]
    Placeholder(&'static str),
    #[error("{{system}} must come before {{prompt}}")]
    Order,
}

/// A chat template split around its two placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    head: String,
    middle: String,
    tail: String,
}

impl PromptTemplate {
    /// Parse a template containing `{system}` followed by `{prompt}`
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        for placeholder in [SYSTEM_PLACEHOLDER, PROMPT_PLACEHOLDER] {
            if template.matches(placeholder).count() != 1 {
                return Err(TemplateError::Placeholder(placeholder));
            }
        }

        let (head, rest) = template
            .split_once(SYSTEM_PLACEHOLDER)
            .ok_or(TemplateError::Placeholder(SYSTEM_PLACEHOLDER))?;
        let (middle, tail) = rest.split_once(PROMPT_PLACEHOLDER).ok_or(TemplateError::Order)?;

        Ok(Self {
            head: head.to_string(),
            middle: middle.to_string(),
            tail: tail.to_string(),
        })
    }

    pub fn render(&self, system_prompt: &str, prompt: &str) -> String {
        let mut out = String::with_capacity(
            self.head.len() + system_prompt.len() + self.middle.len() + prompt.len() + self.tail.len(),
        );
        out.push_str(&self.head);
        out.push_str(system_prompt);
        out.push_str(&self.middle);
        out.push_str(prompt);
        out.push_str(&self.tail);
        out
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            head: "<s>[INST] ".to_string(),
            middle: "\n\n".to_string(),
            tail: " [/INST]".to_string(),
        }
    }
}

/// Formats prompts for the backend. Pure and deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptFormatter {
    template: PromptTemplate,
}

impl PromptFormatter {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn format(&self, mode: GenerationMode, system_prompt: &str, prompt: &str) -> String {
        match mode {
            GenerationMode::Complete => prompt.to_string(),
            GenerationMode::Chat => self.template.render(system_prompt, prompt),
        }
    }
}
