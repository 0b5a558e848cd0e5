//! Generation coordinator
//!
//! Resolves per-request parameters, formats the prompt and drives the loaded
//! model either to a complete text or to a cancellable stream.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use super::backend::StreamControl;
use super::prompt::{GenerationMode, PromptFormatter};
use super::session::{ModelSession, SessionState};
use super::streaming::{TextStream, DEFAULT_STREAM_BUFFER};
use crate::types::config::{GenerationParams, Overrides, ParamError};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no model is ready (session is {0})")]
    SessionNotReady(SessionState),
    #[error("another generation is already running")]
    Busy,
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error("generation failed: {0}")]
    Backend(String),
    #[error("could not start generation worker: {0}")]
    Worker(String),
}

/// One generation call
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub mode: GenerationMode,
    pub prompt: String,
    /// Replaces the configured system prompt for this call only
    pub system_prompt: Option<String>,
    pub overrides: Overrides,
}

impl GenerationRequest {
    pub fn chat(prompt: impl Into<String>) -> Self {
        Self {
            mode: GenerationMode::Chat,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn complete(prompt: impl Into<String>) -> Self {
        Self {
            mode: GenerationMode::Complete,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }
}

/// Full completion text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResult {
    pub text: String,
}

/// What a generation produced, depending on the resolved `stream` flag
#[derive(Debug)]
pub enum GenerationOutput {
    Text(TextResult),
    Stream(TextStream),
}

impl GenerationOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, GenerationOutput::Stream(_))
    }
}

pub struct GenerationCoordinator {
    session: Arc<ModelSession>,
    formatter: PromptFormatter,
    stream_buffer: usize,
}

impl GenerationCoordinator {
    pub fn new(session: Arc<ModelSession>) -> Self {
        Self {
            session,
            formatter: PromptFormatter::default(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_formatter(mut self, formatter: PromptFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Fragments a stream may buffer ahead of its consumer
    pub fn with_stream_buffer(mut self, fragments: usize) -> Self {
        self.stream_buffer = fragments.max(1);
        self
    }

    pub fn session(&self) -> &Arc<ModelSession> {
        &self.session
    }

    /// Configured generation parameters with `overrides` applied. Does not
    /// modify the configuration.
    pub fn resolve_generation_params(
        &self,
        overrides: &Overrides,
    ) -> Result<GenerationParams, ParamError> {
        self.session
            .config()
            .generation_params()
            .with_overrides(overrides)
    }

    /// Run one generation.
    ///
    /// Returns [`GenerationOutput::Stream`] when the resolved `stream` flag is
    /// set, otherwise the whole text. The model is held until the text is
    /// returned or the stream ends, is cancelled, or is dropped.
    pub fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        let lease = self.session.lease()?;
        let params = self.resolve_generation_params(&request.overrides)?;
        let system_prompt = request
            .system_prompt
            .unwrap_or_else(|| self.session.config().system_prompt());
        let prompt = self
            .formatter
            .format(request.mode, &system_prompt, &request.prompt);

        let request_id = Uuid::new_v4();
        tracing::info!(
            %request_id,
            mode = %request.mode,
            stream = params.stream,
            max_tokens = params.max_tokens,
            "Starting generation"
        );

        if !params.stream {
            let started = Instant::now();
            let text = lease
                .handle()
                .generate(&prompt, &params)
                .map_err(|e| GenerationError::Backend(e.to_string()))?;
            tracing::info!(
                %request_id,
                chars = text.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Generation finished"
            );
            let text = if params.echo { prompt + &text } else { text };
            return Ok(GenerationOutput::Text(TextResult { text }));
        }

        let stream = TextStream::spawn(request_id, self.stream_buffer, move |sink| {
            let lease = lease;
            if params.echo && sink(&prompt) == StreamControl::Stop {
                return Ok(());
            }
            lease.handle().generate_stream(&prompt, &params, sink)
        })
        .map_err(|e| GenerationError::Worker(e.to_string()))?;
        Ok(GenerationOutput::Stream(stream))
    }

    /// Run a generation and wait for the whole text, draining the stream if
    /// the resolved parameters ask for one. Blocks the current thread.
    pub fn generate_text(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        match self.generate(request)? {
            GenerationOutput::Text(result) => Ok(result.text),
            GenerationOutput::Stream(stream) => stream
                .collect_text()
                .map_err(|e| GenerationError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::{BackendError, ModelBackend, ModelHandle};
    use crate::storage::config_store::{ConfigStore, SECTION_GENERATION};
    use crate::types::config::ModelParams;
    use crate::types::model::{BackendInfo, ModelSource};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        prompts: Mutex<Vec<String>>,
        params: Mutex<Vec<GenerationParams>>,
    }

    struct EchoHandle(Arc<Recorder>);

    impl ModelHandle for EchoHandle {
        fn info(&self) -> BackendInfo {
            BackendInfo::default()
        }

        fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, BackendError> {
            self.0.prompts.lock().push(prompt.to_string());
            self.0.params.lock().push(params.clone());
            Ok("4".into())
        }

        fn generate_stream(
            &self,
            prompt: &str,
            params: &GenerationParams,
            on_fragment: &mut dyn FnMut(&str) -> StreamControl,
        ) -> Result<(), BackendError> {
            self.0.prompts.lock().push(prompt.to_string());
            self.0.params.lock().push(params.clone());
            for piece in ["The ", "answer ", "is ", "4."] {
                if on_fragment(piece) == StreamControl::Stop {
                    break;
                }
            }
            Ok(())
        }
    }

    struct EchoBackend(Arc<Recorder>);

    impl ModelBackend for EchoBackend {
        fn load(
            &self,
            _: &ModelSource,
            _: &ModelParams,
        ) -> Result<Box<dyn ModelHandle>, BackendError> {
            Ok(Box::new(EchoHandle(self.0.clone())))
        }
    }

    fn ready_coordinator() -> (GenerationCoordinator, Arc<Recorder>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"GGUF").unwrap();

        let recorder = Arc::new(Recorder::default());
        let session = Arc::new(ModelSession::new(
            Arc::new(ConfigStore::new()),
            Arc::new(EchoBackend(recorder.clone())),
        ));
        session
            .load(ModelSource::Local(path), ModelParams::default())
            .unwrap();
        (GenerationCoordinator::new(session), recorder, dir)
    }

    #[test]
    fn test_blocking_chat_generation() {
        let (coordinator, recorder, _dir) = ready_coordinator();
        let request = GenerationRequest::chat("2+2?")
            .with_system_prompt("Be terse.")
            .with_override("stream", json!(false));

        let output = coordinator.generate(request).unwrap();
        match output {
            GenerationOutput::Text(result) => assert_eq!(result.text, "4"),
            other => panic!("expected text, got {other:?}"),
        }
        assert_eq!(
            recorder.prompts.lock()[0],
            "<s>[INST] Be terse.\n\n2+2? [/INST]"
        );
    }

    #[test]
    fn test_configured_system_prompt_is_used() {
        let (coordinator, recorder, _dir) = ready_coordinator();
        coordinator
            .generate_text(GenerationRequest::chat("hi").with_override("stream", json!(false)))
            .unwrap();
        assert_eq!(
            recorder.prompts.lock()[0],
            "<s>[INST] You are a helpful AI assistant.\n\nhi [/INST]"
        );
    }

    #[test]
    fn test_stream_concatenation() {
        let (coordinator, _, _dir) = ready_coordinator();
        let output = coordinator
            .generate(GenerationRequest::complete("Q: 2+2? A:"))
            .unwrap();
        assert!(output.is_stream());
        let GenerationOutput::Stream(stream) = output else {
            unreachable!()
        };
        assert_eq!(stream.collect_text().unwrap(), "The answer is 4.");
    }

    #[test]
    fn test_overrides_do_not_mutate_config() {
        let (coordinator, recorder, _dir) = ready_coordinator();
        let request = GenerationRequest::complete("x")
            .with_override("temperature", json!(0.1))
            .with_override("stream", json!(false));
        coordinator.generate(request).unwrap();

        assert!((recorder.params.lock()[0].temperature - 0.1).abs() < 1e-6);
        let config = coordinator.session().config();
        assert!((config.generation_params().temperature - 0.7).abs() < 1e-6);
        assert!(config.section(SECTION_GENERATION).get("temperature").is_some());
    }

    #[test]
    fn test_invalid_override_never_reaches_backend() {
        let (coordinator, recorder, _dir) = ready_coordinator();
        let err = coordinator
            .generate(GenerationRequest::chat("x").with_override("top_p", json!(1.5)))
            .unwrap_err();
        assert!(matches!(err, GenerationError::Param(ParamError::InvalidValue { .. })));
        assert!(recorder.prompts.lock().is_empty());

        // the failed call must not leave the session busy
        coordinator
            .generate_text(GenerationRequest::chat("x"))
            .unwrap();
    }

    #[test]
    fn test_echo_prefixes_prompt() {
        let (coordinator, _, _dir) = ready_coordinator();
        let text = coordinator
            .generate_text(
                GenerationRequest::complete("2+2=")
                    .with_override("echo", json!(true))
                    .with_override("stream", json!(false)),
            )
            .unwrap();
        assert_eq!(text, "2+2=4");
    }

    #[test]
    fn test_stream_holds_session_until_dropped() {
        let (coordinator, _, _dir) = ready_coordinator();
        // a one-fragment buffer keeps the worker blocked until we read
        let coordinator = coordinator.with_stream_buffer(1);
        let stream = coordinator.generate(GenerationRequest::complete("x")).unwrap();
        assert!(matches!(
            coordinator.generate(GenerationRequest::complete("y")),
            Err(GenerationError::Busy)
        ));
        let GenerationOutput::Stream(stream) = stream else {
            unreachable!()
        };
        stream.cancel_and_wait();
        coordinator
            .generate_text(GenerationRequest::complete("y"))
            .unwrap();
    }
}
