//! llama.cpp backend
//!
//! Loads local GGUF files through `llama-cpp-2`. A fresh context is created
//! for every generation so calls never share KV-cache state.

use llama_cpp_2::context::params::{LlamaContextParams, RopeScalingType as LlamaRopeScaling};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};

use super::backend::{BackendError, ModelBackend, ModelHandle, StreamControl};
use super::streaming::StopMatcher;
use crate::types::config::{GenerationParams, ModelParams, RopeScalingType};
use crate::types::model::{BackendInfo, ModelSource};

/// llama.cpp may only be initialized once per process
static BACKEND: Mutex<Weak<LlamaBackend>> = Mutex::new(Weak::new());

fn shared_backend() -> Result<Arc<LlamaBackend>, BackendError> {
    let mut slot = BACKEND.lock();
    if let Some(backend) = slot.upgrade() {
        return Ok(backend);
    }
    let backend = Arc::new(
        LlamaBackend::init().map_err(|e| BackendError::Init(format!("llama backend: {e}")))?,
    );
    *slot = Arc::downgrade(&backend);
    tracing::info!("LLM backend initialized");
    Ok(backend)
}

/// [`ModelBackend`] over llama.cpp
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self {
            backend: shared_backend()?,
        })
    }
}

impl ModelBackend for LlamaCppBackend {
    fn load(
        &self,
        source: &ModelSource,
        params: &ModelParams,
    ) -> Result<Box<dyn ModelHandle>, BackendError> {
        let path = match source {
            ModelSource::Local(path) => path,
            ModelSource::Remote(remote) => {
                return Err(BackendError::UnsupportedSource(format!(
                    "{remote} must be downloaded first ({})",
                    remote.download_url()
                )));
            }
        };

        let gpu_layers = u32::try_from(params.n_gpu_layers).unwrap_or(u32::MAX);
        let mut model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        if params.use_mlock {
            model_params = model_params.with_use_mlock(true);
        }
        if !params.use_mmap || params.vocab_only || params.logits_all || !params.f16_kv {
            tracing::debug!("mmap, vocab_only, logits_all and f16_kv are left to llama.cpp defaults");
        }

        tracing::info!("Loading GGUF model from: {}", path.display());
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| BackendError::Init(format!("failed to load model: {e}")))?;

        Ok(Box::new(LlamaCppHandle {
            backend: self.backend.clone(),
            model,
            params: params.clone(),
        }))
    }
}

struct LlamaCppHandle {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    params: ModelParams,
}

impl LlamaCppHandle {
    fn context_params(&self) -> LlamaContextParams {
        let threads = i32::try_from(self.params.n_cpu_threads).unwrap_or(i32::MAX);
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.params.context_size))
            .with_n_batch(self.params.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads)
            .with_embeddings(self.params.embedding)
            .with_rope_freq_base(self.params.rope_freq_base)
            .with_rope_freq_scale(self.params.rope_freq_scale);
        match self.params.rope_scaling_type {
            RopeScalingType::None => {}
            RopeScalingType::Linear => {
                ctx_params = ctx_params.with_rope_scaling_type(LlamaRopeScaling::Linear);
            }
            RopeScalingType::Yarn => {
                ctx_params = ctx_params.with_rope_scaling_type(LlamaRopeScaling::Yarn);
            }
        }
        ctx_params
    }

    /// Tokenize the prompt and decode it into a new context
    fn prefill(&self, prompt: &str) -> Result<(LlamaContext<'_>, usize), BackendError> {
        let add_bos = if prompt.starts_with("<s>") {
            AddBos::Never
        } else {
            AddBos::Always
        };
        let tokens = self
            .model
            .str_to_token(prompt, add_bos)
            .map_err(|e| BackendError::Generation(format!("tokenization failed: {e}")))?;

        let n_ctx = self.params.context_size as usize;
        if tokens.len() >= n_ctx {
            return Err(BackendError::Generation(format!(
                "prompt is {} tokens, context window is {}",
                tokens.len(),
                n_ctx
            )));
        }

        let mut ctx = self
            .model
            .new_context(&self.backend, self.context_params())
            .map_err(|e| BackendError::Generation(format!("failed to create context: {e}")))?;

        let n_batch = (ctx.n_batch() as usize).max(1);
        for chunk in tokens.chunks(n_batch) {
            let mut batch = LlamaBatch::get_one(chunk)
                .map_err(|e| BackendError::Generation(format!("failed to create batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| BackendError::Generation(format!("prefill decode failed: {e}")))?;
        }
        Ok((ctx, tokens.len()))
    }

    /// Autoregressive loop. `on_piece` receives text with stop sequences
    /// already cut; returning `Stop` ends generation.
    fn run(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_piece: &mut dyn FnMut(&str) -> StreamControl,
    ) -> Result<(), BackendError> {
        let (mut ctx, prompt_tokens) = self.prefill(prompt)?;
        let mut sampler = build_sampler(params);
        let mut stops = StopMatcher::new(&params.stop);
        let mut utf8 = Vec::new();

        let budget = (self.params.context_size as usize)
            .saturating_sub(prompt_tokens)
            .min(params.max_tokens as usize);

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                break;
            }

            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| BackendError::Generation(format!("failed to decode token: {e}")))?;
            utf8.extend_from_slice(&bytes);
            let piece = take_valid_utf8(&mut utf8);

            if !piece.is_empty() {
                let (emit, hit) = stops.push(&piece);
                if !emit.is_empty() && on_piece(&emit) == StreamControl::Stop {
                    return Ok(());
                }
                if hit {
                    return Ok(());
                }
            }

            let next = [token];
            let mut batch = LlamaBatch::get_one(&next)
                .map_err(|e| BackendError::Generation(format!("failed to create batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| BackendError::Generation(format!("decode failed: {e}")))?;
        }

        let rest = stops.finish();
        if !rest.is_empty() {
            on_piece(&rest);
        }
        Ok(())
    }
}

impl ModelHandle for LlamaCppHandle {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            context_size: self.params.context_size,
            embedding_size: u32::try_from(self.model.n_embd()).unwrap_or_default(),
            vocab_size: u32::try_from(self.model.n_vocab()).unwrap_or_default(),
        }
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, BackendError> {
        let mut text = String::new();
        self.run(prompt, params, &mut |piece| {
            text.push_str(piece);
            StreamControl::Continue
        })?;
        Ok(text)
    }

    fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        on_fragment: &mut dyn FnMut(&str) -> StreamControl,
    ) -> Result<(), BackendError> {
        self.run(prompt, params, on_fragment)
    }
}

fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    let mut samplers = Vec::new();

    let has_penalties = params.repeat_penalty != 1.0
        || params.frequency_penalty != 0.0
        || params.presence_penalty != 0.0;
    if has_penalties {
        samplers.push(LlamaSampler::penalties(
            64,
            params.repeat_penalty,
            params.frequency_penalty,
            params.presence_penalty,
        ));
    }

    if params.temperature <= 0.0 {
        samplers.push(LlamaSampler::greedy());
    } else {
        let seed = uuid::Uuid::new_v4().as_u128() as u32;
        samplers.push(LlamaSampler::top_k(params.top_k as i32));
        samplers.push(LlamaSampler::top_p(params.top_p, 1));
        samplers.push(LlamaSampler::temp(params.temperature));
        samplers.push(LlamaSampler::dist(seed));
    }

    LlamaSampler::chain_simple(samplers)
}

/// Split off the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next token.
fn take_valid_utf8(buf: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            // not a truncated sequence, the bytes are simply invalid
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            return text;
        }
    };
    let text = String::from_utf8_lossy(&buf[..valid]).into_owned();
    buf.drain(..valid);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_token() {
        let mut buf = "zaż".as_bytes()[..3].to_vec();
        assert_eq!(take_valid_utf8(&mut buf), "za");
        buf.extend_from_slice(&"ż".as_bytes()[1..]);
        assert_eq!(take_valid_utf8(&mut buf), "ż");
        assert!(buf.is_empty());
    }
}
