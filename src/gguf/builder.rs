//! GGUF builder - synthesizes valid containers in memory
//!
//! `GGUFBuilder` writes GGUF v3 files without needing real model weights.
//! Tests and benchmarks use it to produce small models with known values.
//!
//! # Example
//!
//! ```
//! use deltavox::gguf::{GGUFBuilder, GGUFModel, QuantType};
//!
//! let data = GGUFBuilder::new()
//!     .architecture("llama")
//!     .hidden_dim("llama", 32)
//!     .num_layers("llama", 1)
//!     .add_f32_tensor("output_norm.weight", &[32], &[1.0; 32])
//!     .add_quantized_tensor("token_embd.weight", &[4, 32], QuantType::Q8_0, &[0.1; 128])
//!     .build();
//!
//! let model = GGUFModel::from_bytes(&data).unwrap();
//! assert_eq!(model.tensors.len(), 2);
//! ```

use super::types::{
    QuantType, GGUF_ALIGNMENT, GGUF_MAGIC, GGUF_TYPE_F32, GGUF_TYPE_Q4_0, GGUF_TYPE_Q6_K,
    GGUF_TYPE_Q8_0, GGUF_VERSION_V3,
};
use crate::quantize::{encode_f16, quantize_q4_0, quantize_q6_k, quantize_q8_0};

const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;

fn string_bytes(value: &str) -> Vec<u8> {
    let mut bytes = (value.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(value.as_bytes());
    bytes
}

/// Builder for GGUF v3 containers
#[derive(Debug, Default)]
pub struct GGUFBuilder {
    /// Metadata entries (key, value type, encoded value)
    metadata: Vec<(String, u32, Vec<u8>)>,
    /// Tensors (name, dims outermost first, encoding tag, data)
    tensors: Vec<(String, Vec<u64>, u32, Vec<u8>)>,
}

impl GGUFBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Add a string metadata value
    #[must_use]
    pub fn add_string(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .push((key.to_string(), TYPE_STRING, string_bytes(value)));
        self
    }

    /// Add a u32 metadata value
    #[must_use]
    pub fn add_u32(mut self, key: &str, value: u32) -> Self {
        self.metadata
            .push((key.to_string(), TYPE_U32, value.to_le_bytes().to_vec()));
        self
    }

    /// Add an f32 metadata value
    #[must_use]
    pub fn add_f32(mut self, key: &str, value: f32) -> Self {
        self.metadata
            .push((key.to_string(), TYPE_F32, value.to_le_bytes().to_vec()));
        self
    }

    /// Add a bool metadata value
    #[must_use]
    pub fn add_bool(mut self, key: &str, value: bool) -> Self {
        self.metadata
            .push((key.to_string(), TYPE_BOOL, vec![u8::from(value)]));
        self
    }

    /// Add a string array (e.g. `tokenizer.ggml.tokens`)
    #[must_use]
    pub fn add_string_array<S: AsRef<str>>(mut self, key: &str, values: &[S]) -> Self {
        let mut bytes = TYPE_STRING.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            bytes.extend(string_bytes(v.as_ref()));
        }
        self.metadata.push((key.to_string(), TYPE_ARRAY, bytes));
        self
    }

    /// Add an i32 array (e.g. `tokenizer.ggml.token_type`)
    #[must_use]
    pub fn add_i32_array(mut self, key: &str, values: &[i32]) -> Self {
        let mut bytes = TYPE_I32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.metadata.push((key.to_string(), TYPE_ARRAY, bytes));
        self
    }

    /// Set architecture (`general.architecture`)
    #[must_use]
    pub fn architecture(self, arch: &str) -> Self {
        self.add_string("general.architecture", arch)
    }

    /// Set hidden dimension (embedding length)
    #[must_use]
    pub fn hidden_dim(self, arch: &str, dim: u32) -> Self {
        self.add_u32(&format!("{arch}.embedding_length"), dim)
    }

    /// Set number of layers (block count)
    #[must_use]
    pub fn num_layers(self, arch: &str, count: u32) -> Self {
        self.add_u32(&format!("{arch}.block_count"), count)
    }

    /// Set number of attention heads
    #[must_use]
    pub fn num_heads(self, arch: &str, count: u32) -> Self {
        self.add_u32(&format!("{arch}.attention.head_count"), count)
    }

    /// Set number of KV heads (for GQA)
    #[must_use]
    pub fn num_kv_heads(self, arch: &str, count: u32) -> Self {
        self.add_u32(&format!("{arch}.attention.head_count_kv"), count)
    }

    /// Set context length
    #[must_use]
    pub fn context_length(self, arch: &str, len: u32) -> Self {
        self.add_u32(&format!("{arch}.context_length"), len)
    }

    /// Set RoPE frequency base
    #[must_use]
    pub fn rope_freq_base(self, arch: &str, base: f32) -> Self {
        self.add_f32(&format!("{arch}.rope.freq_base"), base)
    }

    /// Set RMS epsilon
    #[must_use]
    pub fn rms_epsilon(self, arch: &str, eps: f32) -> Self {
        self.add_f32(&format!("{arch}.attention.layer_norm_rms_epsilon"), eps)
    }

    /// Set feed-forward hidden dimension
    #[must_use]
    pub fn ffn_hidden_dim(self, arch: &str, dim: u32) -> Self {
        self.add_u32(&format!("{arch}.feed_forward_length"), dim)
    }

    // =========================================================================
    // Tensors
    // =========================================================================

    /// Add a tensor with pre-encoded bytes and an arbitrary encoding tag
    #[must_use]
    pub fn add_raw_tensor(mut self, name: &str, dims: &[u64], tag: u32, data: Vec<u8>) -> Self {
        self.tensors
            .push((name.to_string(), dims.to_vec(), tag, data));
        self
    }

    /// Add an F32 tensor
    #[must_use]
    pub fn add_f32_tensor(self, name: &str, dims: &[u64], data: &[f32]) -> Self {
        let bytes = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.add_raw_tensor(name, dims, GGUF_TYPE_F32, bytes)
    }

    /// Add a `Q4_0` tensor from encoded blocks (18 bytes per 32 elements)
    #[must_use]
    pub fn add_q4_0_tensor(self, name: &str, dims: &[u64], data: &[u8]) -> Self {
        self.add_raw_tensor(name, dims, GGUF_TYPE_Q4_0, data.to_vec())
    }

    /// Add a `Q8_0` tensor from encoded blocks (34 bytes per 32 elements)
    #[must_use]
    pub fn add_q8_0_tensor(self, name: &str, dims: &[u64], data: &[u8]) -> Self {
        self.add_raw_tensor(name, dims, GGUF_TYPE_Q8_0, data.to_vec())
    }

    /// Add a `Q6_K` tensor from encoded superblocks (210 bytes per 256 elements)
    #[must_use]
    pub fn add_q6_k_tensor(self, name: &str, dims: &[u64], data: &[u8]) -> Self {
        self.add_raw_tensor(name, dims, GGUF_TYPE_Q6_K, data.to_vec())
    }

    /// Encode f32 values as `qtype` and add them as a tensor
    #[must_use]
    pub fn add_quantized_tensor(
        self,
        name: &str,
        dims: &[u64],
        qtype: QuantType,
        values: &[f32],
    ) -> Self {
        let bytes = match qtype {
            QuantType::F32 => return self.add_f32_tensor(name, dims, values),
            QuantType::F16 => encode_f16(values),
            QuantType::Q4_0 => quantize_q4_0(values),
            QuantType::Q8_0 => quantize_q8_0(values),
            QuantType::Q6_K => quantize_q6_k(values),
        };
        self.add_raw_tensor(name, dims, qtype.ggml_type(), bytes)
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Serialize the container
    ///
    /// Every tensor starts at a multiple of [`GGUF_ALIGNMENT`] within the
    /// data region.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut data = Vec::new();

        data.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        data.extend_from_slice(&GGUF_VERSION_V3.to_le_bytes());
        data.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        data.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value_type, value_bytes) in &self.metadata {
            data.extend(string_bytes(key));
            data.extend_from_slice(&value_type.to_le_bytes());
            data.extend_from_slice(value_bytes);
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for (name, dims, tag, bytes) in &self.tensors {
            data.extend(string_bytes(name));
            data.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            // GGML order: innermost first
            for dim in dims.iter().rev() {
                data.extend_from_slice(&dim.to_le_bytes());
            }
            data.extend_from_slice(&tag.to_le_bytes());
            data.extend_from_slice(&offset.to_le_bytes());
            offsets.push(offset);
            offset = (offset + bytes.len() as u64).div_ceil(GGUF_ALIGNMENT as u64)
                * GGUF_ALIGNMENT as u64;
        }

        let data_start = data.len().div_ceil(GGUF_ALIGNMENT) * GGUF_ALIGNMENT;
        data.resize(data_start, 0);

        for ((_, _, _, bytes), off) in self.tensors.iter().zip(offsets) {
            data.resize(data_start + off as usize, 0);
            data.extend_from_slice(bytes);
        }

        data
    }
}
