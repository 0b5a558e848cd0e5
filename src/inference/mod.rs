//! Model lifecycle and text generation
//!
//! The session owns the loaded model, the coordinator turns requests into
//! backend calls, and the backend traits keep the inference engine pluggable.

pub mod backend;
pub mod coordinator;
#[cfg(feature = "llama")]
pub mod llama;
pub mod prompt;
pub mod session;
pub mod streaming;

pub use backend::{BackendError, ModelBackend, ModelHandle, StreamControl};
pub use coordinator::{
    GenerationCoordinator, GenerationError, GenerationOutput, GenerationRequest, TextResult,
};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use prompt::{GenerationMode, PromptFormatter, PromptTemplate};
pub use session::{LoadError, ModelSession, SessionState};
pub use streaming::{CancelHandle, StreamError, StreamToken, TextStream};
