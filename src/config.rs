//! Runtime configuration
//!
//! Everything except the weights path has a default, so a JSON file may
//! carry as little as `{"weights_path": "model.gguf"}`. Values are
//! validated and clamped once by [`RuntimeConfig::validate`] before the
//! engine uses them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DeltavoxError, Result};
use crate::generate::SamplingConfig;

/// Placeholder replaced by the user prompt in [`RuntimeConfig::template`]
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Engine and generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// GGUF weight file
    #[serde(default)]
    pub weights_path: PathBuf,

    /// Optional `.npz` delta archive
    #[serde(default)]
    pub delta_path: Option<PathBuf>,

    /// Delta blend strength in `[0, 1]`
    #[serde(default)]
    pub alpha: f32,

    /// Tokens generated before the grace window opens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Sampling temperature; 0 selects the arg-max
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus threshold; 1 switches to top-k
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Top-k candidate count
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Repetition penalty (> 1 penalizes)
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    /// Trailing tokens the penalty considers
    #[serde(default = "default_repetition_window")]
    pub repetition_window: usize,

    /// Upper bound on the key/value cache length
    #[serde(default)]
    pub max_seq_len: Option<usize>,

    /// RNG seed for reproducible sampling
    #[serde(default)]
    pub seed: Option<u64>,

    /// Prompt template containing `{prompt}`
    #[serde(default = "default_template")]
    pub template: String,

    /// JSON-lines conversation log
    #[serde(default)]
    pub memory_log: Option<PathBuf>,

    /// Field command script run at startup
    #[serde(default)]
    pub field_script: Option<PathBuf>,
}

fn default_max_tokens() -> usize {
    256
}

fn default_temperature() -> f32 {
    0.9
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> usize {
    50
}

fn default_repetition_penalty() -> f32 {
    1.15
}

fn default_repetition_window() -> usize {
    64
}

fn default_template() -> String {
    "### Question: {prompt}\n### Answer:".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::new(),
            delta_path: None,
            alpha: 0.0,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            repetition_window: default_repetition_window(),
            max_seq_len: None,
            seed: None,
            template: default_template(),
            memory_log: None,
            field_script: None,
        }
    }
}

fn clamp_logged(name: &str, value: f32, min: f32, max: f32) -> f32 {
    let clamped = if value.is_nan() { min } else { value.clamp(min, max) };
    if clamped != value {
        warn!(setting = name, value, clamped, "setting out of range, clamped");
    }
    clamped
}

impl RuntimeConfig {
    /// Defaults with the given weights path
    #[must_use]
    pub fn new(weights_path: impl Into<PathBuf>) -> Self {
        Self {
            weights_path: weights_path.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Io`] if the file cannot be read and
    /// [`DeltavoxError::InvalidConfiguration`] if it is not valid JSON for
    /// this struct.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DeltavoxError::io(path, e))?;
        Self::from_json(&content)
    }

    /// Parse from JSON text
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::InvalidConfiguration`] on malformed JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| DeltavoxError::InvalidConfiguration {
            reason: format!("config JSON: {e}"),
        })
    }

    /// Reject unusable settings and clamp the rest into range
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::InvalidConfiguration`] for an empty weights
    /// path, a template without `{prompt}` or a zero sequence cap.
    pub fn validate(mut self) -> Result<Self> {
        if self.weights_path.as_os_str().is_empty() {
            return Err(DeltavoxError::InvalidConfiguration {
                reason: "weights path is required".to_string(),
            });
        }
        if !self.template.contains(PROMPT_PLACEHOLDER) {
            return Err(DeltavoxError::InvalidConfiguration {
                reason: format!("template must contain {PROMPT_PLACEHOLDER}"),
            });
        }
        if self.max_seq_len == Some(0) {
            return Err(DeltavoxError::InvalidConfiguration {
                reason: "max_seq_len must be positive".to_string(),
            });
        }

        self.alpha = clamp_logged("alpha", self.alpha, 0.0, 1.0);
        self.temperature = clamp_logged("temperature", self.temperature, 0.0, f32::MAX);
        self.top_p = clamp_logged("top_p", self.top_p, f32::MIN_POSITIVE, 1.0);
        self.repetition_penalty =
            clamp_logged("repetition_penalty", self.repetition_penalty, 1.0, f32::MAX);
        self.top_k = self.top_k.max(1);
        self.max_tokens = self.max_tokens.max(1);
        Ok(self)
    }

    /// Apply the prompt template
    #[must_use]
    pub fn format_prompt(&self, prompt: &str) -> String {
        self.template.replace(PROMPT_PLACEHOLDER, prompt)
    }

    /// Sampling parameters for one call
    #[must_use]
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            repetition_window: self.repetition_window,
        }
    }
}
