//! Configuration types
//!
//! Typed model and generation parameter sets, resolved from the `model` and
//! `generation` sections of the configuration store and refined by call-time
//! overrides.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Call-time parameter overrides, keyed by parameter name.
pub type Overrides = Map<String, Value>;

/// Errors produced while applying parameter overrides
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamError {
    /// The key is not a recognized parameter name
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    /// The key is recognized but the value does not fit it
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ParamError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// RoPE scaling strategy requested from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeScalingType {
    #[default]
    None,
    Linear,
    Yarn,
}

impl RopeScalingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RopeScalingType::None => "none",
            RopeScalingType::Linear => "linear",
            RopeScalingType::Yarn => "yarn",
        }
    }
}

impl fmt::Display for RopeScalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RopeScalingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RopeScalingType::None),
            "linear" => Ok(RopeScalingType::Linear),
            "yarn" => Ok(RopeScalingType::Yarn),
            other => Err(format!(
                "expected one of none, linear, yarn but got '{other}'"
            )),
        }
    }
}

// Persisted as `null` when unset so older files stay readable.
impl Serialize for RopeScalingType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RopeScalingType::None => serializer.serialize_none(),
            other => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for RopeScalingType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(RopeScalingType::None),
            Some(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Parameters handed to the backend when a model is loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Context window size in tokens
    pub context_size: u32,
    /// Layers offloaded to the GPU (-1 = all)
    pub n_gpu_layers: i32,
    /// CPU threads used for evaluation
    pub n_cpu_threads: u32,
    /// Prompt processing batch size
    pub batch_size: u32,
    /// Half-precision key/value cache
    pub f16_kv: bool,
    pub logits_all: bool,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding: bool,
    pub rope_scaling_type: RopeScalingType,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
}

/// Recognized keys of the `model` section
pub const MODEL_PARAM_KEYS: &[&str] = &[
    "context_size",
    "n_gpu_layers",
    "n_cpu_threads",
    "batch_size",
    "f16_kv",
    "logits_all",
    "vocab_only",
    "use_mmap",
    "use_mlock",
    "embedding",
    "rope_scaling_type",
    "rope_freq_base",
    "rope_freq_scale",
];

/// Number of CPU threads used when nothing else is configured
pub fn default_thread_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            context_size: 4096,
            n_gpu_layers: -1,
            n_cpu_threads: default_thread_count(),
            batch_size: 512,
            f16_kv: true,
            logits_all: false,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            rope_scaling_type: RopeScalingType::None,
            rope_freq_base: 10000.0,
            rope_freq_scale: 1.0,
        }
    }
}

impl ModelParams {
    /// Resolve from a persisted section, keeping defaults for anything that
    /// does not fit the schema.
    pub fn from_section(section: &Map<String, Value>) -> Self {
        let mut params = Self::default();
        apply_lenient("model", section, |key, value| params.set_param(key, value));
        params
    }

    /// Apply call-time overrides. Either every override applies or none does.
    pub fn with_overrides(&self, overrides: &Overrides) -> Result<Self, ParamError> {
        let mut params = self.clone();
        for (key, value) in overrides {
            params.set_param(key, value)?;
        }
        Ok(params)
    }

    fn set_param(&mut self, key: &str, value: &Value) -> Result<(), ParamError> {
        match key {
            "context_size" => self.context_size = positive_u32(key, value)?,
            "n_gpu_layers" => self.n_gpu_layers = to_i32(key, value)?,
            "n_cpu_threads" => self.n_cpu_threads = positive_u32(key, value)?,
            "batch_size" => self.batch_size = positive_u32(key, value)?,
            "f16_kv" => self.f16_kv = to_bool(key, value)?,
            "logits_all" => self.logits_all = to_bool(key, value)?,
            "vocab_only" => self.vocab_only = to_bool(key, value)?,
            "use_mmap" => self.use_mmap = to_bool(key, value)?,
            "use_mlock" => self.use_mlock = to_bool(key, value)?,
            "embedding" => self.embedding = to_bool(key, value)?,
            "rope_scaling_type" => {
                self.rope_scaling_type = match value {
                    Value::Null => RopeScalingType::None,
                    Value::String(s) => s.parse().map_err(|e| ParamError::invalid(key, e))?,
                    _ => return Err(ParamError::invalid(key, "expected a string or null")),
                }
            }
            "rope_freq_base" => self.rope_freq_base = to_f32(key, value)?,
            "rope_freq_scale" => self.rope_freq_scale = to_f32(key, value)?,
            _ => return Err(ParamError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }
}

/// Sampling and output parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling cutoff (0.0 - 1.0)
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// Deliver the output as a stream of fragments
    pub stream: bool,
    /// Sequences that end generation when produced
    pub stop: Vec<String>,
    /// Prepend the prompt to the output
    pub echo: bool,
}

/// Recognized keys of the `generation` section
pub const GENERATION_PARAM_KEYS: &[&str] = &[
    "max_tokens",
    "temperature",
    "top_p",
    "top_k",
    "repeat_penalty",
    "presence_penalty",
    "frequency_penalty",
    "stream",
    "stop",
    "echo",
];

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            stream: true,
            stop: Vec::new(),
            echo: false,
        }
    }
}

impl GenerationParams {
    /// Resolve from a persisted section, keeping defaults for anything that
    /// does not fit the schema.
    pub fn from_section(section: &Map<String, Value>) -> Self {
        let mut params = Self::default();
        apply_lenient("generation", section, |key, value| {
            params.set_param(key, value)
        });
        params
    }

    /// Apply call-time overrides. Either every override applies or none does.
    pub fn with_overrides(&self, overrides: &Overrides) -> Result<Self, ParamError> {
        let mut params = self.clone();
        for (key, value) in overrides {
            params.set_param(key, value)?;
        }
        Ok(params)
    }

    fn set_param(&mut self, key: &str, value: &Value) -> Result<(), ParamError> {
        match key {
            "max_tokens" => self.max_tokens = positive_u32(key, value)?,
            "temperature" => {
                let t = to_f32(key, value)?;
                if t < 0.0 {
                    return Err(ParamError::invalid(key, "must be >= 0"));
                }
                self.temperature = t;
            }
            "top_p" => {
                let p = to_f32(key, value)?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(ParamError::invalid(key, "must be within 0.0 - 1.0"));
                }
                self.top_p = p;
            }
            "top_k" => self.top_k = to_u32(key, value)?,
            "repeat_penalty" => self.repeat_penalty = to_f32(key, value)?,
            "presence_penalty" => self.presence_penalty = to_f32(key, value)?,
            "frequency_penalty" => self.frequency_penalty = to_f32(key, value)?,
            "stream" => self.stream = to_bool(key, value)?,
            "stop" => self.stop = to_string_list(key, value)?,
            "echo" => self.echo = to_bool(key, value)?,
            _ => return Err(ParamError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }
}

fn apply_lenient(
    section: &str,
    values: &Map<String, Value>,
    mut apply: impl FnMut(&str, &Value) -> Result<(), ParamError>,
) {
    for (key, value) in values {
        match apply(key, value) {
            Ok(()) => {}
            Err(ParamError::UnknownParameter(_)) => {
                tracing::debug!("Ignoring unrecognized {}.{} in configuration", section, key);
            }
            Err(e) => {
                tracing::warn!("Keeping default for {}.{}: {}", section, key, e);
            }
        }
    }
}

fn to_bool(key: &str, value: &Value) -> Result<bool, ParamError> {
    value
        .as_bool()
        .ok_or_else(|| ParamError::invalid(key, "expected a boolean"))
}

fn to_u32(key: &str, value: &Value) -> Result<u32, ParamError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ParamError::invalid(key, "expected a non-negative integer"))
}

fn positive_u32(key: &str, value: &Value) -> Result<u32, ParamError> {
    match to_u32(key, value)? {
        0 => Err(ParamError::invalid(key, "must be greater than 0")),
        v => Ok(v),
    }
}

fn to_i32(key: &str, value: &Value) -> Result<i32, ParamError> {
    value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| ParamError::invalid(key, "expected an integer"))
}

fn to_f32(key: &str, value: &Value) -> Result<f32, ParamError> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| ParamError::invalid(key, "expected a number"))
}

fn to_string_list(key: &str, value: &Value) -> Result<Vec<String>, ParamError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ParamError::invalid(key, "expected a list of strings"))
            })
            .collect(),
        _ => Err(ParamError::invalid(key, "expected a string or a list of strings")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overrides(value: Value) -> Overrides {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_default_generation_params() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 512);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_p, 0.95);
        assert_eq!(params.top_k, 40);
        assert!(params.stream);
        assert!(!params.echo);
        assert!(params.stop.is_empty());
    }

    #[test]
    fn test_default_model_params() {
        let params = ModelParams::default();
        assert_eq!(params.context_size, 4096);
        assert_eq!(params.n_gpu_layers, -1);
        assert!(params.n_cpu_threads > 0);
        assert_eq!(params.rope_scaling_type, RopeScalingType::None);
    }

    #[test]
    fn test_keys_cover_serialized_fields() {
        let model = serde_json::to_value(ModelParams::default()).unwrap();
        let mut keys: Vec<_> = model.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        let mut expected: Vec<_> = MODEL_PARAM_KEYS.iter().map(|k| k.to_string()).collect();
        expected.sort();
        assert_eq!(keys, expected);

        let generation = serde_json::to_value(GenerationParams::default()).unwrap();
        assert_eq!(
            generation.as_object().unwrap().len(),
            GENERATION_PARAM_KEYS.len()
        );
    }

    #[test]
    fn test_rope_scaling_values() {
        let base = ModelParams::default();
        let yarn = base
            .with_overrides(&overrides(json!({"rope_scaling_type": "yarn"})))
            .unwrap();
        assert_eq!(yarn.rope_scaling_type, RopeScalingType::Yarn);

        let none = yarn
            .with_overrides(&overrides(json!({"rope_scaling_type": null})))
            .unwrap();
        assert_eq!(none.rope_scaling_type, RopeScalingType::None);

        let err = base
            .with_overrides(&overrides(json!({"rope_scaling_type": "dynamic"})))
            .unwrap_err();
        assert!(matches!(err, ParamError::InvalidValue { ref key, .. } if key == "rope_scaling_type"));
    }

    #[test]
    fn test_rope_scaling_serializes_none_as_null() {
        let value = serde_json::to_value(RopeScalingType::None).unwrap();
        assert!(value.is_null());
        let linear: RopeScalingType = serde_json::from_value(json!("linear")).unwrap();
        assert_eq!(linear, RopeScalingType::Linear);
    }

    #[test]
    fn test_unknown_override_rejected_without_partial_apply() {
        let base = GenerationParams::default();
        let err = base
            .with_overrides(&overrides(json!({"temperature": 0.1, "temprature": 0.2})))
            .unwrap_err();
        assert_eq!(err, ParamError::UnknownParameter("temprature".to_string()));
        // base untouched
        assert_eq!(base.temperature, 0.7);
    }

    #[test]
    fn test_override_type_mismatch() {
        let err = ModelParams::default()
            .with_overrides(&overrides(json!({"context_size": "big"})))
            .unwrap_err();
        assert!(matches!(err, ParamError::InvalidValue { .. }));

        let err = GenerationParams::default()
            .with_overrides(&overrides(json!({"top_p": 1.5})))
            .unwrap_err();
        assert!(matches!(err, ParamError::InvalidValue { .. }));
    }

    #[test]
    fn test_stop_accepts_string_or_list() {
        let base = GenerationParams::default();
        let single = base
            .with_overrides(&overrides(json!({"stop": "</s>"})))
            .unwrap();
        assert_eq!(single.stop, vec!["</s>".to_string()]);

        let many = base
            .with_overrides(&overrides(json!({"stop": ["a", "b"]})))
            .unwrap();
        assert_eq!(many.stop.len(), 2);
    }

    #[test]
    fn test_from_section_is_lenient() {
        let section = overrides(json!({
            "temperature": 0.2,
            "top_k": "many",
            "legacy_key": true
        }));
        let params = GenerationParams::from_section(&section);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_k, 40);
    }
}
