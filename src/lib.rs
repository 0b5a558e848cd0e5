//! lm-session
//!
//! Session layer for local language models: layered configuration, the
//! loaded-model lifecycle, prompt formatting and blocking or streaming
//! generation over a pluggable backend.

pub mod attachments;
pub mod inference;
pub mod logging;
pub mod storage;
pub mod types;

pub use inference::{
    GenerationCoordinator, GenerationError, GenerationMode, GenerationOutput, GenerationRequest,
    LoadError, ModelSession, SessionState, TextStream,
};
pub use storage::{ConfigError, ConfigStore, RecentModelRegistry};
pub use types::config::{GenerationParams, ModelParams, Overrides, ParamError};
pub use types::model::{ModelInfo, ModelSource};
