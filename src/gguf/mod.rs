//! GGUF (GPT-Generated Unified Format) weights and the decoder that runs them
//!
//! Pure Rust reader for the GGUF binary container used by llama.cpp and
//! compatible tools, plus the single transformer forward pass this crate
//! needs.
//!
//! Format specification: <https://github.com/ggerganov/ggml/blob/master/docs/gguf.md>
//!
//! ## Module Structure
//!
//! - `types`: constants, [`QuantType`], [`GGUFValue`], [`TensorInfo`]
//! - `io`: little-endian primitive readers
//! - `loader`: header, metadata and tensor directory parsing
//! - `container`: [`WeightContainer`] and [`TensorView`]
//! - `config`: [`ModelConfig`]
//! - `builder`: [`GGUFBuilder`] for synthetic containers
//! - `ops`: normalization, activation and rotary primitives
//! - `kv_cache`: [`KVCache`]
//! - `model`: [`LlamaModel`]

mod builder;
mod config;
mod container;
mod io;
mod kv_cache;
mod loader;
mod model;
pub mod ops;
mod types;

pub use builder::GGUFBuilder;
pub use config::{ModelConfig, RopeStyle, DEFAULT_CONTEXT_LENGTH};
pub use container::{TensorView, WeightContainer};
pub use kv_cache::KVCache;
pub use model::{GenerationState, LlamaModel};
pub use types::{
    GGUFHeader, GGUFModel, GGUFValue, QuantType, TensorInfo, GGUF_ALIGNMENT, GGUF_MAGIC,
    GGUF_TYPE_F16, GGUF_TYPE_F32, GGUF_TYPE_Q4_0, GGUF_TYPE_Q6_K, GGUF_TYPE_Q8_0,
    GGUF_VERSION_V2, GGUF_VERSION_V3,
};
