//! Model session
//!
//! Owns at most one loaded model and tracks its lifecycle:
//! `Unloaded -> Loading -> Ready | Error`. Loading again from `Ready` or
//! `Error` replaces the previous model.

use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::backend::{ModelBackend, ModelHandle};
use super::coordinator::GenerationError;
use crate::storage::config_store::KEY_LAST_MODELS_DIR;
use crate::storage::{ConfigStore, RecentModelRegistry};
use crate::types::config::{ModelParams, Overrides, ParamError};
use crate::types::model::{ModelInfo, ModelSource};

/// Lifecycle state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("invalid model reference: {0}")]
    InvalidReference(String),
    #[error("backend failed to initialize the model: {0}")]
    BackendInit(String),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error("cannot load while {0}")]
    Busy(&'static str),
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    handle: Option<Arc<dyn ModelHandle>>,
    info: Option<ModelInfo>,
    params: Option<ModelParams>,
    error: Option<String>,
}

/// A single loaded model shared between the loader and the generation
/// coordinator.
pub struct ModelSession {
    config: Arc<ConfigStore>,
    recent: RecentModelRegistry,
    backend: Arc<dyn ModelBackend>,
    inner: RwLock<SessionInner>,
    busy: Arc<AtomicBool>,
}

impl fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ModelSession")
            .field("state", &inner.state)
            .field("info", &inner.info)
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .finish()
    }
}

impl ModelSession {
    pub fn new(config: Arc<ConfigStore>, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            recent: RecentModelRegistry::new(config.clone()),
            config,
            backend,
            inner: RwLock::new(SessionInner::default()),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Metadata of the loaded model; `None` unless the session is ready
    pub fn current_info(&self) -> Option<ModelInfo> {
        let inner = self.inner.read();
        match inner.state {
            SessionState::Ready => inner.info.clone(),
            _ => None,
        }
    }

    /// Why the last load failed
    pub fn last_error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    /// Parameters the current model was loaded with
    pub fn loaded_params(&self) -> Option<ModelParams> {
        self.inner.read().params.clone()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn recent_models(&self) -> &RecentModelRegistry {
        &self.recent
    }

    /// Configured model parameters with `overrides` applied. Does not
    /// modify the configuration.
    pub fn resolve_load_parameters(&self, overrides: &Overrides) -> Result<ModelParams, ParamError> {
        self.config.model_params().with_overrides(overrides)
    }

    /// Load `source` with the configured parameters plus `overrides`
    pub fn load_with_overrides(
        &self,
        source: ModelSource,
        overrides: &Overrides,
    ) -> Result<ModelInfo, LoadError> {
        let params = self.resolve_load_parameters(overrides)?;
        self.load(source, params)
    }

    /// Load a model, replacing whatever was loaded before.
    ///
    /// Blocks for the duration of the backend load. On failure the session
    /// ends in `Error` with no model held.
    pub fn load(&self, source: ModelSource, params: ModelParams) -> Result<ModelInfo, LoadError> {
        self.begin_load()?;
        tracing::info!("Loading model: {}", source);

        match self.load_inner(&source, &params) {
            Ok((handle, info)) => {
                {
                    let mut inner = self.inner.write();
                    inner.state = SessionState::Ready;
                    inner.handle = Some(handle);
                    inner.info = Some(info.clone());
                    inner.params = Some(params);
                    inner.error = None;
                }
                self.remember(&source);
                tracing::info!(
                    "Model loaded: {} (ctx {}, vocab {})",
                    info.name,
                    info.context_size,
                    info.vocab_size
                );
                Ok(info)
            }
            Err(e) => {
                tracing::error!("Failed to load model {}: {}", source, e);
                let mut inner = self.inner.write();
                inner.state = SessionState::Error;
                inner.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Run [`ModelSession::load`] on the blocking thread pool. The session
    /// reports `Loading` until the returned task completes.
    pub fn load_in_background(
        self: &Arc<Self>,
        source: ModelSource,
        params: ModelParams,
    ) -> tokio::task::JoinHandle<Result<ModelInfo, LoadError>> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.load(source, params))
    }

    /// Release the model. Fails while a generation still holds it.
    pub fn unload(&self) -> Result<(), LoadError> {
        let mut inner = self.inner.write();
        if inner.state == SessionState::Loading {
            return Err(LoadError::Busy("a load is in progress"));
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(LoadError::Busy("a generation is in progress"));
        }
        if inner.handle.take().is_some() {
            tracing::info!("Model unloaded");
        }
        *inner = SessionInner::default();
        Ok(())
    }

    /// Exclusive use of the loaded model for one generation
    pub(crate) fn lease(&self) -> Result<SessionLease, GenerationError> {
        let inner = self.inner.read();
        let handle = match (inner.state, &inner.handle) {
            (SessionState::Ready, Some(handle)) => handle.clone(),
            (state, _) => return Err(GenerationError::SessionNotReady(state)),
        };
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GenerationError::Busy);
        }
        Ok(SessionLease {
            handle,
            _busy: BusyGuard(self.busy.clone()),
        })
    }

    fn begin_load(&self) -> Result<(), LoadError> {
        let mut inner = self.inner.write();
        if inner.state == SessionState::Loading {
            return Err(LoadError::Busy("another load is in progress"));
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(LoadError::Busy("a generation is in progress"));
        }
        inner.state = SessionState::Loading;
        inner.handle = None;
        inner.info = None;
        inner.params = None;
        inner.error = None;
        Ok(())
    }

    fn load_inner(
        &self,
        source: &ModelSource,
        params: &ModelParams,
    ) -> Result<(Arc<dyn ModelHandle>, ModelInfo), LoadError> {
        match source {
            ModelSource::Local(path) if !path.is_file() => {
                return Err(LoadError::FileNotFound(path.clone()));
            }
            ModelSource::Remote(remote) => {
                remote
                    .validate()
                    .map_err(|e| LoadError::InvalidReference(e.to_string()))?;
            }
            ModelSource::Local(_) => {}
        }

        let handle: Arc<dyn ModelHandle> = self
            .backend
            .load(source, params)
            .map_err(|e| LoadError::BackendInit(e.to_string()))?
            .into();

        let dims = handle.info();
        let info = ModelInfo {
            name: source.display_name(),
            source: source.to_string(),
            context_size: dims.context_size,
            embedding_size: dims.embedding_size,
            vocab_size: dims.vocab_size,
            n_threads: params.n_cpu_threads,
            n_gpu_layers: params.n_gpu_layers,
        };
        Ok((handle, info))
    }

    /// Record a successful local load in the recent list
    fn remember(&self, source: &ModelSource) {
        let ModelSource::Local(path) = source else {
            return;
        };
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        self.recent.add(&absolute.to_string_lossy());
        if let Some(parent) = absolute.parent() {
            self.config.set_value(
                KEY_LAST_MODELS_DIR,
                serde_json::Value::String(parent.to_string_lossy().to_string()),
            );
        }
    }
}

/// Exclusive use of the model for one generation. Fields drop in order, so
/// the handle is released before the session stops reporting busy.
pub(crate) struct SessionLease {
    handle: Arc<dyn ModelHandle>,
    _busy: BusyGuard,
}

impl SessionLease {
    pub(crate) fn handle(&self) -> &dyn ModelHandle {
        self.handle.as_ref()
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
