//! Model configuration extraction
//!
//! [`ModelConfig`] holds the transformer dimensions needed for inference,
//! read once from `{arch}.*` metadata keys with conventional defaults.

use super::types::GGUFModel;
use crate::error::{DeltavoxError, Result};

/// Rotary pairing convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeStyle {
    /// Adjacent pairs `(x[2i], x[2i+1])` (LLaMA)
    Norm,
    /// Split halves `(x[i], x[i + d/2])` (GPT-NeoX, Qwen)
    Neox,
}

impl RopeStyle {
    /// Convention used by an architecture name
    #[must_use]
    pub fn for_architecture(arch: &str) -> Self {
        const NEOX: [&str; 6] = ["qwen", "qwen2", "phi2", "phi3", "gptneox", "stablelm"];
        let arch = arch.to_ascii_lowercase();
        if NEOX.iter().any(|n| arch == *n || arch.starts_with(n)) {
            Self::Neox
        } else {
            Self::Norm
        }
    }
}

/// Transformer dimensions, immutable after load
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Architecture name (`general.architecture`)
    pub architecture: String,
    /// Number of transformer blocks
    pub num_layers: usize,
    /// Hidden width
    pub hidden_dim: usize,
    /// Query heads
    pub num_heads: usize,
    /// Key/value heads (equal to `num_heads` without grouping)
    pub num_kv_heads: usize,
    /// Width of one head
    pub head_dim: usize,
    /// Feed-forward inner width
    pub ffn_dim: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Positions the key/value cache can hold
    pub max_seq_len: usize,
    /// RMSNorm epsilon
    pub rms_eps: f32,
    /// RoPE frequency base
    pub rope_theta: f32,
    /// RoPE pairing convention
    pub rope_style: RopeStyle,
}

/// Context length used when the container does not declare one
pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;

impl ModelConfig {
    /// Derive the configuration from container metadata
    ///
    /// `seq_len_cap` optionally lowers the sequence limit below the declared
    /// context length to bound cache memory.
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Parse`] if a required key is missing and
    /// [`DeltavoxError::DimensionMismatch`] if the head layout is inconsistent.
    pub fn from_gguf(model: &GGUFModel, seq_len_cap: Option<usize>) -> Result<Self> {
        let architecture = model.architecture().unwrap_or("llama").to_string();
        let required = |suffix: &str| -> Result<usize> {
            model.arch_u32(suffix).map(|v| v as usize).ok_or_else(|| {
                DeltavoxError::parse(
                    "model metadata",
                    format!("missing {architecture}.{suffix}"),
                )
            })
        };

        let num_layers = required("block_count")?;
        let hidden_dim = required("embedding_length")?;
        let num_heads = required("attention.head_count")?;
        let num_kv_heads = model
            .arch_u32("attention.head_count_kv")
            .map_or(num_heads, |v| v as usize);

        let ffn_dim = match model.arch_u32("feed_forward_length") {
            Some(v) => v as usize,
            None => model
                .find_tensor("blk.0.ffn_gate.weight")
                .map(super::types::TensorInfo::rows)
                .ok_or_else(|| {
                    DeltavoxError::parse(
                        "model metadata",
                        format!("missing {architecture}.feed_forward_length"),
                    )
                })?,
        };

        let vocab_size = match model.get_string_array("tokenizer.ggml.tokens") {
            Some(tokens) => tokens.len(),
            None => model
                .find_tensor("token_embd.weight")
                .map(super::types::TensorInfo::rows)
                .ok_or_else(|| {
                    DeltavoxError::parse("model metadata", "cannot determine vocabulary size")
                })?,
        };

        let context = model
            .arch_u32("context_length")
            .map_or(DEFAULT_CONTEXT_LENGTH, |v| v as usize);
        let max_seq_len = seq_len_cap.map_or(context, |cap| cap.min(context));

        let rms_eps = model
            .arch_f32("attention.layer_norm_rms_epsilon")
            .unwrap_or(1e-6);
        let rope_theta = model.arch_f32("rope.freq_base").unwrap_or(10_000.0);
        let rope_style = RopeStyle::for_architecture(&architecture);

        if num_heads == 0 || num_kv_heads == 0 || hidden_dim == 0 || num_layers == 0 {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!(
                    "zero dimension: layers={num_layers} hidden={hidden_dim} heads={num_heads} kv_heads={num_kv_heads}"
                ),
            });
        }
        if !hidden_dim.is_multiple_of(num_heads) || !num_heads.is_multiple_of(num_kv_heads) {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!(
                    "hidden {hidden_dim} / heads {num_heads} / kv_heads {num_kv_heads} do not divide evenly"
                ),
            });
        }
        let head_dim = hidden_dim / num_heads;
        if !head_dim.is_multiple_of(2) {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!("head dimension {head_dim} must be even for rotary embedding"),
            });
        }
        if max_seq_len == 0 {
            return Err(DeltavoxError::DimensionMismatch {
                reason: "maximum sequence length is zero".to_string(),
            });
        }

        Ok(Self {
            architecture,
            num_layers,
            hidden_dim,
            num_heads,
            num_kv_heads,
            head_dim,
            ffn_dim,
            vocab_size,
            max_seq_len,
            rms_eps,
            rope_theta,
            rope_style,
        })
    }

    /// Width of the key/value projections
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Query heads sharing one key/value head
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::builder::GGUFBuilder;

    fn base(arch: &str) -> GGUFBuilder {
        GGUFBuilder::new()
            .architecture(arch)
            .num_layers(arch, 2)
            .hidden_dim(arch, 64)
            .num_heads(arch, 8)
            .ffn_hidden_dim(arch, 128)
            .add_string_array("tokenizer.ggml.tokens", &["a", "b", "c"])
    }

    #[test]
    fn test_defaults() {
        let model = GGUFModel::from_bytes(&base("llama").build()).unwrap();
        let config = ModelConfig::from_gguf(&model, None).unwrap();
        assert_eq!(config.num_kv_heads, 8);
        assert_eq!(config.head_dim, 8);
        assert_eq!(config.vocab_size, 3);
        assert_eq!(config.max_seq_len, DEFAULT_CONTEXT_LENGTH);
        assert!((config.rms_eps - 1e-6).abs() < 1e-12);
        assert!((config.rope_theta - 10_000.0).abs() < f32::EPSILON);
        assert_eq!(config.rope_style, RopeStyle::Norm);
    }

    #[test]
    fn test_explicit_values_and_cap() {
        let data = base("qwen2")
            .num_kv_heads("qwen2", 2)
            .context_length("qwen2", 4096)
            .rope_freq_base("qwen2", 1_000_000.0)
            .build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        let config = ModelConfig::from_gguf(&model, Some(512)).unwrap();
        assert_eq!(config.num_kv_heads, 2);
        assert_eq!(config.group_size(), 4);
        assert_eq!(config.kv_dim(), 16);
        assert_eq!(config.max_seq_len, 512);
        assert_eq!(config.rope_style, RopeStyle::Neox);

        let uncapped = ModelConfig::from_gguf(&model, Some(100_000)).unwrap();
        assert_eq!(uncapped.max_seq_len, 4096);
    }

    #[test]
    fn test_missing_required_key() {
        let data = GGUFBuilder::new().architecture("llama").build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        let err = ModelConfig::from_gguf(&model, None).unwrap_err();
        assert!(err.to_string().contains("llama.block_count"));
    }

    #[test]
    fn test_inconsistent_heads() {
        let data = base("llama").num_kv_heads("llama", 3).build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        assert!(matches!(
            ModelConfig::from_gguf(&model, None),
            Err(DeltavoxError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_rope_style_by_architecture() {
        assert_eq!(RopeStyle::for_architecture("llama"), RopeStyle::Norm);
        assert_eq!(RopeStyle::for_architecture("Qwen2"), RopeStyle::Neox);
        assert_eq!(RopeStyle::for_architecture("stablelm"), RopeStyle::Neox);
        assert_eq!(RopeStyle::for_architecture("mistral"), RopeStyle::Norm);
    }
}
