//! # Deltavox
//!
//! CPU inference runtime for quantized decoder-only transformers, with an
//! optional low-rank logits correction ("delta voice") blended in at
//! sampling time.
//!
//! ## Pipeline
//!
//! - **Container**: GGUF weights are memory-mapped and indexed by name
//! - **Codecs**: F32, F16, Q4_0, Q8_0 and Q6_K rows are decoded inside
//!   row-parallel matrix-vector kernels
//! - **Model**: RMSNorm, rotary grouped-query attention and SwiGLU blocks
//!   with a per-layer key/value cache
//! - **Delta**: `logits += alpha * A (B h)` from an `.npz` archive
//! - **Sampling**: suppression, repetition penalty, temperature, top-k or
//!   nucleus selection
//! - **Engine**: one lock-guarded generation flow per instance, steered by a
//!   field collaborator and reported to a memory collaborator
//!
//! ## Example
//!
//! ```rust,no_run
//! use deltavox::{Engine, RuntimeConfig};
//!
//! let engine = Engine::new(RuntimeConfig::new("model.gguf"))?;
//! let output = engine.generate("What is a rotary embedding?")?;
//! println!("{}", output.text);
//! # Ok::<(), deltavox::DeltavoxError>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for dimensions is exact in practice
#![allow(clippy::cast_possible_truncation)] // u64 offsets fit usize on supported targets
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::similar_names)] // q/k/v buffers
#![allow(clippy::many_single_char_names)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests

/// Run configuration (serde, validated)
pub mod config;
/// Low-rank logits correction and its NPY/NPZ reader
pub mod delta;
/// Generation driver
pub mod engine;
pub mod error;
/// Field collaborator: temperature, destiny and logit dampening
pub mod field;
pub mod generate;
/// GGUF container, model configuration and forward pass
pub mod gguf;
/// Conversation memory collaborator
pub mod memory;
/// Block codecs and matrix-vector kernels
pub mod quantize;
/// Byte-level BPE tokenizer
pub mod tokenizer;

pub use config::RuntimeConfig;
pub use delta::DeltaVoice;
pub use engine::{Engine, GenerationOutput, StopReason};
pub use error::{DeltavoxError, Result};
pub use field::{FieldKernel, FieldSnapshot, FieldSource, NullField, VelocityMode};
pub use generate::{Sampler, SamplingConfig};
pub use gguf::{GGUFBuilder, LlamaModel, ModelConfig, QuantType, WeightContainer};
pub use memory::{JsonlMemory, MemoryRecord, MemoryStore, NullMemory};
pub use tokenizer::Vocabulary;
