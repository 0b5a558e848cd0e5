//! Model backend boundary
//!
//! The session layer only talks to an inference engine through these two
//! traits: a loader that turns a model reference into a handle, and the
//! handle's info / blocking / streaming calls.

use thiserror::Error;

use crate::types::config::{GenerationParams, ModelParams};
use crate::types::model::{BackendInfo, ModelSource};

/// Failures reported by a backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend rejected the parameters or the model file
    #[error("{0}")]
    Init(String),
    /// The backend cannot serve this kind of model reference
    #[error("unsupported model source: {0}")]
    UnsupportedSource(String),
    /// Failure while producing text
    #[error("{0}")]
    Generation(String),
}

/// Returned by a fragment sink to tell the producer whether to keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// Loads models. Implementations must be safe to call from a worker thread.
pub trait ModelBackend: Send + Sync {
    fn load(
        &self,
        source: &ModelSource,
        params: &ModelParams,
    ) -> Result<Box<dyn ModelHandle>, BackendError>;
}

/// A loaded model.
///
/// Dropping the handle releases everything the backend allocated for it.
pub trait ModelHandle: Send + Sync {
    fn info(&self) -> BackendInfo;

    /// Generate the full completion for `prompt`
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, BackendError>;

    /// Generate incrementally, handing each fragment to `on_fragment` in
    /// order. Implementations must stop producing, and make no further calls
    /// to `on_fragment`, once it returns [`StreamControl::Stop`].
    fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_fragment: &mut dyn FnMut(&str) -> StreamControl,
    ) -> Result<(), BackendError>;
}
